//! Session and message store
//!
//! [`SessionStore`] owns everything a front-end renders for one followed
//! session: the chat messages, the tool executions hanging off them, the
//! capped activity timeline and the agent roster. Every mutation records a
//! [`StoreChange`]; the UI drains those with [`SessionStore::take_changes`]
//! instead of diffing the whole state.
//!
//! Two boundaries keep side effects out of the store:
//! - [`StateStore`]: typed persistence for per-session client state (resume
//!   cursor, agent roster, starred/pinned marks)
//! - [`MessageSink`]: where finished turns are written back to, once each

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::stream::timeline::{KeyedEvent, TimelineChange, TimelineLog};
use crate::types::{
    new_id, AgentStatus, MarkKind, Message, MessageMetadata, MessageRole, MessageStatus,
    RunStatus, SessionState, ToolExecution, ToolStatus,
};

/// One mutation of the store, in the order it happened
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    MessageAdded { id: String },
    /// Text appended to a streaming message
    MessageAppended { id: String, delta: String },
    /// Message reached a terminal status
    MessageFinalized { id: String },
    ToolUpdated { message_id: String, tool_id: String },
    Timeline(TimelineChange),
    AgentStatus { agent: String, status: AgentStatus },
}

/// In-memory state of one followed session.
#[derive(Debug)]
pub struct SessionStore {
    session_id: String,
    messages: Vec<Message>,
    /// Message id -> position in `messages`
    index: HashMap<String, usize>,
    /// Agent -> id of its open (streaming) message
    streaming: HashMap<String, String>,
    timeline: TimelineLog,
    agents: BTreeMap<String, AgentStatus>,
    starred: BTreeSet<String>,
    pinned: BTreeSet<String>,
    /// Marks toggled off since load
    cleared_marks: BTreeSet<(String, MarkKind)>,
    changes: Vec<StoreChange>,
}

impl SessionStore {
    pub fn new(session_id: impl Into<String>, timeline_cap: usize) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            index: HashMap::new(),
            streaming: HashMap::new(),
            timeline: TimelineLog::new(timeline_cap),
            agents: BTreeMap::new(),
            starred: BTreeSet::new(),
            pinned: BTreeSet::new(),
            cleared_marks: BTreeSet::new(),
            changes: Vec::new(),
        }
    }

    /// Create a store primed with previously persisted state.
    pub fn from_state(state: &SessionState, timeline_cap: usize) -> Self {
        let mut store = Self::new(state.session_id.clone(), timeline_cap);
        store.agents = state.agents.clone();
        store.starred = state.starred.clone();
        store.pinned = state.pinned.clone();
        store
    }

    /// Export the persistable part of the store.
    pub fn to_state(&self, cursor: u64, status: Option<RunStatus>) -> SessionState {
        SessionState {
            session_id: self.session_id.clone(),
            cursor,
            status,
            agents: self.agents.clone(),
            starred: self.starred.clone(),
            pinned: self.pinned.clone(),
            cleared_marks: self.cleared_marks.clone(),
            updated_at: Some(Utc::now()),
        }
    }

    /// Forget everything and start over for another session.
    pub fn reset(&mut self, session_id: impl Into<String>) {
        let cap = self.timeline.cap();
        *self = Self::new(session_id, cap);
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ============================================
    // Messages
    // ============================================

    fn insert_message(&mut self, mut message: Message) -> String {
        while self.index.contains_key(&message.id) {
            message.id = new_id();
        }
        let id = message.id.clone();
        self.index.insert(id.clone(), self.messages.len());
        self.messages.push(message);
        self.changes.push(StoreChange::MessageAdded { id: id.clone() });
        id
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        let pos = *self.index.get(id)?;
        self.messages.get_mut(pos)
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        let pos = *self.index.get(id)?;
        self.messages.get(pos)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The agent's open message, if one is streaming.
    pub fn streaming_message(&self, agent: &str) -> Option<&Message> {
        self.streaming.get(agent).and_then(|id| self.message(id))
    }

    pub fn streaming_agents(&self) -> Vec<String> {
        let mut agents: Vec<_> = self.streaming.keys().cloned().collect();
        agents.sort();
        agents
    }

    /// Add a message typed by the user; it starts in `sending`.
    pub fn add_user_message(&mut self, content: impl Into<String>) -> String {
        self.insert_message(Message {
            id: new_id(),
            role: MessageRole::User,
            content: content.into(),
            status: MessageStatus::Sending,
            tools: Vec::new(),
            metadata: MessageMetadata::default(),
            created_at: Utc::now(),
        })
    }

    /// Mark a user message as accepted by the backend.
    pub fn mark_sent(&mut self, id: &str) -> bool {
        let Some(message) = self.message_mut(id) else {
            return false;
        };
        if message.status != MessageStatus::Sending {
            return false;
        }
        message.status = MessageStatus::Sent;
        self.changes
            .push(StoreChange::MessageFinalized { id: id.to_string() });
        true
    }

    fn open_message_id(&mut self, agent: &str) -> String {
        if let Some(id) = self.streaming.get(agent) {
            return id.clone();
        }
        let id = self.insert_message(Message {
            id: new_id(),
            role: MessageRole::Assistant,
            content: String::new(),
            status: MessageStatus::Streaming,
            tools: Vec::new(),
            metadata: MessageMetadata {
                agent: Some(agent.to_string()),
                ..Default::default()
            },
            created_at: Utc::now(),
        });
        self.streaming.insert(agent.to_string(), id.clone());
        id
    }

    /// Append text to the agent's open message, opening one if needed.
    ///
    /// Returns the id of the streaming message.
    pub fn upsert_streaming_message(&mut self, agent: &str, content: &str) -> String {
        let id = self.open_message_id(agent);
        if !content.is_empty() {
            if let Some(message) = self.message_mut(&id) {
                message.content.push_str(content);
            }
            self.changes.push(StoreChange::MessageAppended {
                id: id.clone(),
                delta: content.to_string(),
            });
        }
        id
    }

    /// Close the agent's open message.
    ///
    /// Returns the completed message the first time it is called for a
    /// turn, and `None` afterwards, so the caller persists each turn once.
    pub fn finalize_message(&mut self, agent: &str) -> Option<Message> {
        self.close_message(agent, MessageStatus::Sent, |_| {})
    }

    fn close_message(
        &mut self,
        agent: &str,
        status: MessageStatus,
        annotate: impl FnOnce(&mut MessageMetadata),
    ) -> Option<Message> {
        let id = self.streaming.remove(agent)?;
        let message = self.message_mut(&id)?;
        message.status = status;
        annotate(&mut message.metadata);
        let finished = message.clone();
        self.changes.push(StoreChange::MessageFinalized { id });
        Some(finished)
    }

    /// Close every open message as failed, keeping its content.
    pub fn fail_open_messages(&mut self, error: &str) -> Vec<Message> {
        self.streaming_agents()
            .into_iter()
            .filter_map(|agent| {
                self.close_message(&agent, MessageStatus::Error, |meta| {
                    meta.error = Some(error.to_string());
                })
            })
            .collect()
    }

    /// Close every open message after a user stop, keeping partial content.
    pub fn interrupt_open_messages(&mut self) -> Vec<Message> {
        self.streaming_agents()
            .into_iter()
            .filter_map(|agent| {
                self.close_message(&agent, MessageStatus::Sent, |meta| {
                    meta.interrupted = true;
                })
            })
            .collect()
    }

    /// Remember the id the backend assigned to a persisted message.
    pub fn set_remote_id(&mut self, id: &str, remote_id: impl Into<String>) {
        if let Some(message) = self.message_mut(id) {
            message.metadata.remote_id = Some(remote_id.into());
        }
    }

    // ============================================
    // Tool executions
    // ============================================

    /// Record a tool call on the agent's open message.
    pub fn record_tool_call(
        &mut self,
        agent: &str,
        tool: &str,
        parameters: serde_json::Value,
        at: DateTime<Utc>,
    ) -> String {
        let message_id = self.open_message_id(agent);
        let tool_id = new_id();
        if let Some(message) = self.message_mut(&message_id) {
            message.tools.push(ToolExecution {
                id: tool_id.clone(),
                agent: agent.to_string(),
                tool: tool.to_string(),
                parameters,
                result: None,
                status: ToolStatus::Executing,
                timestamp: at,
            });
        }
        self.changes.push(StoreChange::ToolUpdated {
            message_id,
            tool_id: tool_id.clone(),
        });
        tool_id
    }

    /// Complete the most recent executing call of `tool` by `agent`.
    ///
    /// Returns the tool execution id, or `None` if nothing was waiting.
    pub fn record_tool_result(
        &mut self,
        agent: &str,
        tool: &str,
        result: serde_json::Value,
        success: bool,
    ) -> Option<String> {
        let (message_id, execution) = self.messages.iter_mut().rev().find_map(|m| {
            let id = m.id.clone();
            m.tools
                .iter_mut()
                .rev()
                .find(|t| t.agent == agent && t.tool == tool && t.status == ToolStatus::Executing)
                .map(|t| (id, t))
        })?;

        execution.status = if success {
            ToolStatus::Success
        } else {
            ToolStatus::Error
        };
        execution.result = (!result.is_null()).then_some(result);
        let tool_id = execution.id.clone();

        self.changes.push(StoreChange::ToolUpdated {
            message_id,
            tool_id: tool_id.clone(),
        });
        Some(tool_id)
    }

    // ============================================
    // Timeline
    // ============================================

    pub fn append_timeline_events(&mut self, events: Vec<KeyedEvent>) {
        let changes = self.timeline.append(events);
        self.record_timeline(changes);
    }

    /// Record changes made directly through [`Self::timeline_mut`].
    pub fn record_timeline(&mut self, changes: impl IntoIterator<Item = TimelineChange>) {
        self.changes
            .extend(changes.into_iter().map(StoreChange::Timeline));
    }

    pub fn timeline(&self) -> &TimelineLog {
        &self.timeline
    }

    pub fn timeline_mut(&mut self) -> &mut TimelineLog {
        &mut self.timeline
    }

    // ============================================
    // Agents and marks
    // ============================================

    pub fn set_agent_status(&mut self, agent: &str, status: AgentStatus) {
        if agent.is_empty() {
            return;
        }
        if self.agents.get(agent) == Some(&status) {
            return;
        }
        self.agents.insert(agent.to_string(), status);
        self.changes.push(StoreChange::AgentStatus {
            agent: agent.to_string(),
            status,
        });
    }

    pub fn agents(&self) -> &BTreeMap<String, AgentStatus> {
        &self.agents
    }

    /// Toggle a mark on a message id. Returns whether the mark is now set.
    pub fn toggle_mark(&mut self, message_id: &str, mark: MarkKind) -> bool {
        let set = match mark {
            MarkKind::Starred => &mut self.starred,
            MarkKind::Pinned => &mut self.pinned,
        };
        let key = (message_id.to_string(), mark);
        if set.remove(message_id) {
            self.cleared_marks.insert(key);
            false
        } else {
            set.insert(message_id.to_string());
            self.cleared_marks.remove(&key);
            true
        }
    }

    pub fn is_marked(&self, message_id: &str, mark: MarkKind) -> bool {
        match mark {
            MarkKind::Starred => self.starred.contains(message_id),
            MarkKind::Pinned => self.pinned.contains(message_id),
        }
    }

    /// Drain the changes recorded since the last call.
    pub fn take_changes(&mut self) -> Vec<StoreChange> {
        std::mem::take(&mut self.changes)
    }
}

// ============================================
// Persistence boundaries
// ============================================

/// Typed persistence for per-session client state.
pub trait StateStore: Send + Sync {
    /// Load state for a session; unknown sessions yield an empty state.
    fn load_state(&self, session_id: &str) -> Result<SessionState>;

    fn save_state(&self, state: &SessionState) -> Result<()>;

    fn clear_state(&self, session_id: &str) -> Result<()>;
}

/// Non-durable [`StateStore`], used in tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, SessionState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load_state(&self, session_id: &str) -> Result<SessionState> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        Ok(states
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| SessionState::new(session_id)))
    }

    fn save_state(&self, state: &SessionState) -> Result<()> {
        let mut saved = state.clone();
        saved.cleared_marks.clear();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(saved.session_id.clone(), saved);
        Ok(())
    }

    fn clear_state(&self, session_id: &str) -> Result<()> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(session_id);
        Ok(())
    }
}

/// Receipt for a message written back to the backend
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct PersistedMessage {
    pub id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Destination for finished turns.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn persist_message(&self, session_id: &str, message: &Message)
        -> Result<PersistedMessage>;
}
