//! Core domain types for swarmtrace
//!
//! These types describe what flows through a followed swarm session:
//! raw [`Chunk`]s arriving from the backend, the chat [`Message`]s they are
//! coalesced into, and the [`TimelineEvent`]s derived from them.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One run of the swarm on the backend, identified by a backend session id |
//! | **Agent** | A named member of the swarm (e.g. "Researcher", "Writer") producing text and tool calls |
//! | **Chunk** | One incremental record returned by a poll (text delta, tool call, handoff, ...) |
//! | **Turn** | The span between an agent's first text and its completion chunk; one message per turn |
//! | **Marker** | A glyph-prefixed line in agent text such as `🔧 **Tool Called:**` |
//! | **Timeline** | The ordered, capped list of activity events shown next to the chat |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Generate a process-unique identifier for messages, events and tool executions.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================
// Chunks (backend wire format)
// ============================================

/// One incremental record from the backend stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Agent that produced this chunk (empty for session-level chunks like `done`)
    #[serde(default)]
    pub agent: String,
    /// When the backend emitted the chunk
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Type-specific payload
    #[serde(flatten)]
    pub kind: ChunkKind,
}

impl Chunk {
    pub fn new(agent: impl Into<String>, kind: ChunkKind) -> Self {
        Self {
            agent: agent.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn text(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            agent,
            ChunkKind::Text {
                content: content.into(),
            },
        )
    }
}

/// Payload of a [`Chunk`], tagged by the backend's `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkKind {
    /// Partial assistant text
    Text {
        #[serde(alias = "data")]
        content: String,
    },
    /// The agent invoked a tool
    ToolCall {
        tool: String,
        #[serde(default)]
        parameters: serde_json::Value,
    },
    /// A tool invocation finished
    ToolResult {
        tool: String,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default = "default_true")]
        success: bool,
    },
    /// The agent began a turn
    AgentStarted,
    /// The agent finished its turn
    AgentCompleted,
    /// Control passed from one agent to another
    Handoff {
        from: String,
        to: String,
        #[serde(default)]
        reason: Option<String>,
    },
    /// The whole run finished
    Done,
    /// The backend reported a failure
    Error {
        #[serde(alias = "content")]
        message: String,
    },
}

fn default_true() -> bool {
    true
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Text { .. } => "text",
            ChunkKind::ToolCall { .. } => "tool_call",
            ChunkKind::ToolResult { .. } => "tool_result",
            ChunkKind::AgentStarted => "agent_started",
            ChunkKind::AgentCompleted => "agent_completed",
            ChunkKind::Handoff { .. } => "handoff",
            ChunkKind::Done => "done",
            ChunkKind::Error { .. } => "error",
        }
    }
}

/// Run status reported alongside each poll response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Done,
    Error,
    WaitingForClarification,
    /// Anything this client does not know about; treated as still running
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
            RunStatus::WaitingForClarification => "waiting_for_clarification",
            RunStatus::Unknown => "unknown",
        }
    }

    /// Terminal statuses end the polling loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Done | RunStatus::Error | RunStatus::WaitingForClarification
        )
    }
}

impl From<&str> for RunStatus {
    fn from(s: &str) -> Self {
        match s {
            "running" => RunStatus::Running,
            "done" => RunStatus::Done,
            "error" => RunStatus::Error,
            "waiting_for_clarification" => RunStatus::WaitingForClarification,
            _ => RunStatus::Unknown,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================
// Messages
// ============================================

/// Who authored a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// Delivery state of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// User message not yet acknowledged
    Sending,
    /// Complete
    Sent,
    /// Terminated by a failure; content kept as-is
    Error,
    /// Still receiving text
    Streaming,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Error => "error",
            MessageStatus::Streaming => "streaming",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Error)
    }
}

/// Typed metadata carried by a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Agent that authored an assistant message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Turn was cut short by a user stop
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
    /// Failure that ended the turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id assigned by the backend once persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

/// A chat message owned by the session store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Process-unique identifier
    pub id: String,
    pub role: MessageRole,
    /// Full text; append-only while streaming
    pub content: String,
    pub status: MessageStatus,
    /// Tool executions observed during this turn
    #[serde(default)]
    pub tools: Vec<ToolExecution>,
    #[serde(default)]
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn agent(&self) -> Option<&str> {
        self.metadata.agent.as_deref()
    }
}

/// Status of one tool execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Executing,
    Success,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Executing => "executing",
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
        }
    }
}

/// A tool call made by an agent, completed in place when its result arrives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    pub id: String,
    pub agent: String,
    pub tool: String,
    pub parameters: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub status: ToolStatus,
    pub timestamp: DateTime<Utc>,
}

// ============================================
// Timeline
// ============================================

/// Kind of a timeline entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    Start,
    Thought,
    Action,
    Tool,
    Handoff,
    Complete,
    Error,
    Agent,
}

impl TimelineEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineEventKind::Start => "start",
            TimelineEventKind::Thought => "thought",
            TimelineEventKind::Action => "action",
            TimelineEventKind::Tool => "tool",
            TimelineEventKind::Handoff => "handoff",
            TimelineEventKind::Complete => "complete",
            TimelineEventKind::Error => "error",
            TimelineEventKind::Agent => "agent",
        }
    }
}

impl std::fmt::Display for TimelineEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of a timeline entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Running => "running",
            EventStatus::Success => "success",
            EventStatus::Error => "error",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, EventStatus::Pending | EventStatus::Running)
    }
}

/// Whether a tool targeted a file or a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    File,
    Directory,
}

/// Path a tool call said it would act on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTarget {
    pub kind: TargetKind,
    pub path: String,
}

/// Outcome reported by a file marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Found,
    NotFound,
    Written,
}

impl FileOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperation::Found => "found",
            FileOperation::NotFound => "not_found",
            FileOperation::Written => "written",
        }
    }
}

/// In-flight file activity announced by a progress marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressActivity {
    Writing,
    Reading,
}

/// Structured payload of a timeline event, one variant per known event shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetails {
    ToolCall {
        tool: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        purpose: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<ToolTarget>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parameters: Option<serde_json::Value>,
    },
    ToolResult {
        tool: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    FileOperation {
        operation: FileOperation,
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        lines: Option<u64>,
    },
    FileProgress {
        activity: ProgressActivity,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Handoff {
        from: String,
        to: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Output {
        text: String,
        truncated: bool,
    },
    Agent {
        status: AgentStatus,
    },
    Error {
        message: String,
    },
}

/// One entry of the activity timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Process-unique identifier
    pub id: String,
    pub kind: TimelineEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<EventDetails>,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds between the event opening and its status flip
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TimelineEvent>,
}

impl TimelineEvent {
    pub fn new(kind: TimelineEventKind, title: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            kind,
            agent: None,
            title: title.into(),
            description: None,
            details: None,
            timestamp: Utc::now(),
            duration_ms: None,
            status: None,
            children: Vec::new(),
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        let agent = agent.into();
        self.agent = (!agent.is_empty()).then_some(agent);
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_details(mut self, details: EventDetails) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ============================================
// Persisted session state
// ============================================

/// Lifecycle of an agent as seen by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Completed,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "running" => Ok(AgentStatus::Running),
            "completed" => Ok(AgentStatus::Completed),
            "error" => Ok(AgentStatus::Error),
            _ => Err(format!("unknown agent status: {}", s)),
        }
    }
}

/// User-applied mark on a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkKind {
    Starred,
    Pinned,
}

impl MarkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkKind::Starred => "starred",
            MarkKind::Pinned => "pinned",
        }
    }
}

impl std::str::FromStr for MarkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starred" => Ok(MarkKind::Starred),
            "pinned" => Ok(MarkKind::Pinned),
            _ => Err(format!("unknown mark: {}", s)),
        }
    }
}

/// Per-session client state that survives restarts.
///
/// Loaded when following starts, saved as the cursor advances, and
/// cleared when the user switches away from a session for good.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    /// Stream offset to resume polling from
    pub cursor: u64,
    /// Last run status seen
    pub status: Option<RunStatus>,
    /// Agent roster with latest known status
    pub agents: BTreeMap<String, AgentStatus>,
    pub starred: BTreeSet<String>,
    pub pinned: BTreeSet<String>,
    /// Marks removed since the state was loaded. Saving deletes these and
    /// leaves any other stored mark in place.
    #[serde(default)]
    pub cleared_marks: BTreeSet<(String, MarkKind)>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }
}
