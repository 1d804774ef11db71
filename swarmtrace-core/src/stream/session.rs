//! Per-session stream processing
//!
//! [`StreamSession`] is the single consumer of polled batches. It routes
//! each chunk to the token buffer, the session store and the timeline, and
//! rescans every touched agent's turn text for markers once per batch.
//!
//! Turn lifecycle per agent:
//! 1. text chunks accumulate in the buffer and the turn transcript
//! 2. [`StreamSession::flush`] moves due text into the streaming message
//! 3. `agent_completed` (or `done`) drains the agent's pending text, then
//!    finalizes the message and queues it for persistence

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::config::StreamConfig;
use crate::store::SessionStore;
use crate::stream::buffer::TokenBuffer;
use crate::stream::extract::{ActivityExtractor, MarkerExtractor};
use crate::stream::timeline::TimelineBuilder;
use crate::types::{AgentStatus, Chunk, ChunkKind, EventStatus, Message, SessionState};

/// Consumes chunk batches for one session.
pub struct StreamSession {
    store: SessionStore,
    buffer: TokenBuffer,
    extractor: Box<dyn ActivityExtractor>,
    builder: TimelineBuilder,
    /// Agent -> full text of its current turn, rescanned for markers
    transcripts: HashMap<String, String>,
    /// Finished messages not yet handed to the caller
    finished: Vec<Message>,
}

impl StreamSession {
    pub fn new(session_id: impl Into<String>, config: &StreamConfig) -> Self {
        Self::with_store(SessionStore::new(session_id, config.timeline_cap), config)
    }

    /// Resume a session from persisted state.
    pub fn from_state(state: &SessionState, config: &StreamConfig) -> Self {
        Self::with_store(SessionStore::from_state(state, config.timeline_cap), config)
    }

    fn with_store(store: SessionStore, config: &StreamConfig) -> Self {
        Self {
            store,
            buffer: TokenBuffer::new(config.flush_interval()),
            extractor: Box::new(MarkerExtractor::with_window(config.scan_window_chars)),
            builder: TimelineBuilder::new(config.output_preview_chars),
            transcripts: HashMap::new(),
            finished: Vec::new(),
        }
    }

    /// Replace the activity extractor.
    pub fn with_extractor(mut self, extractor: Box<dyn ActivityExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SessionStore {
        &mut self.store
    }

    /// Apply one polled batch, in order.
    pub fn ingest(&mut self, batch: Vec<Chunk>) {
        let mut touched = BTreeSet::new();

        for chunk in batch {
            let agent = chunk.agent.clone();
            let at = chunk.timestamp;

            // Appended after the chunk is applied, so a turn's last markers
            // land before its completion event
            let keyed = self.builder.from_chunk(&chunk);

            match chunk.kind {
                ChunkKind::Text { content } => {
                    self.buffer.append(&agent, &content);
                    self.transcripts
                        .entry(agent.clone())
                        .or_default()
                        .push_str(&content);
                    self.store.set_agent_status(&agent, AgentStatus::Running);
                    touched.insert(agent);
                }
                ChunkKind::ToolCall { tool, parameters } => {
                    self.store.record_tool_call(&agent, &tool, parameters, at);
                    self.store.set_agent_status(&agent, AgentStatus::Running);
                }
                ChunkKind::ToolResult {
                    tool,
                    result,
                    success,
                } => {
                    let output = result_preview(&result)
                        .map(|text| self.builder.output_child(&agent, &text, at));
                    if self
                        .store
                        .record_tool_result(&agent, &tool, result, success)
                        .is_none()
                    {
                        tracing::debug!(agent = %agent, tool = %tool, "tool result without a pending call");
                    }
                    let change = self
                        .store
                        .timeline_mut()
                        .resolve_tool(&agent, &tool, success, output, at);
                    self.store.record_timeline(change);
                }
                ChunkKind::AgentStarted => {
                    self.store.set_agent_status(&agent, AgentStatus::Running);
                }
                ChunkKind::AgentCompleted => {
                    self.finish_turn(&agent, at);
                    touched.remove(&agent);
                    let change =
                        self.store
                            .timeline_mut()
                            .resolve_agent(&agent, EventStatus::Success, at);
                    self.store.record_timeline(change);
                    self.store.set_agent_status(&agent, AgentStatus::Completed);
                }
                ChunkKind::Handoff { from, to, .. } => {
                    self.store.set_agent_status(&from, AgentStatus::Completed);
                    self.store.set_agent_status(&to, AgentStatus::Running);
                }
                ChunkKind::Done => {
                    self.finish_all(at);
                    touched.clear();
                }
                ChunkKind::Error { message } => {
                    tracing::warn!(agent = %agent, error = %message, "backend reported an error");
                    self.fail(&message);
                    touched.clear();
                    self.store.set_agent_status(&agent, AgentStatus::Error);
                }
            }

            if let Some(keyed) = keyed {
                self.store.append_timeline_events(vec![keyed]);
            }
        }

        for agent in touched {
            self.scan(&agent, Utc::now(), false);
        }
    }

    /// Move due text from the buffer into streaming messages.
    ///
    /// Returns the number of agents flushed.
    pub fn flush(&mut self, now: Instant) -> usize {
        let flushes = self.buffer.flush_due(now);
        let count = flushes.len();
        for flush in flushes {
            self.store.upsert_streaming_message(&flush.agent, &flush.text);
        }
        count
    }

    pub fn has_pending(&self) -> bool {
        self.buffer.has_pending()
    }

    /// Earliest instant at which [`Self::flush`] has work.
    pub fn next_flush(&self) -> Option<Instant> {
        self.buffer.next_due()
    }

    /// End every open turn normally and close open timeline events.
    pub fn finish_all(&mut self, at: DateTime<Utc>) {
        for agent in self.open_agents() {
            self.finish_turn(&agent, at);
            self.store.set_agent_status(&agent, AgentStatus::Completed);
        }
        let changes = self.store.timeline_mut().close_open(EventStatus::Success, at);
        self.store.record_timeline(changes);
    }

    /// Stop after a user cancel: flush everything and close open turns as
    /// interrupted, keeping partial content.
    pub fn abort(&mut self) {
        self.drain_into_messages();
        for agent in self.transcripts.keys().cloned().collect::<Vec<_>>() {
            self.scan(&agent, Utc::now(), true);
        }
        self.transcripts.clear();
        let interrupted = self.store.interrupt_open_messages();
        self.finished.extend(interrupted);
    }

    /// Close every open turn as failed, after flushing its pending text.
    pub fn fail(&mut self, error: &str) {
        self.drain_into_messages();
        let now = Utc::now();
        for agent in self.transcripts.keys().cloned().collect::<Vec<_>>() {
            self.scan(&agent, now, true);
        }
        self.transcripts.clear();
        let failed = self.store.fail_open_messages(error);
        self.finished.extend(failed);
        let changes = self
            .store
            .timeline_mut()
            .close_open(EventStatus::Error, now);
        self.store.record_timeline(changes);
    }

    /// Hand over messages that reached a terminal status since the last call.
    pub fn take_finished(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.finished)
    }

    fn drain_into_messages(&mut self) {
        for flush in self.buffer.drain_all() {
            self.store.upsert_streaming_message(&flush.agent, &flush.text);
        }
    }

    /// Agents with a streaming message or unflushed text.
    fn open_agents(&self) -> Vec<String> {
        let mut agents: BTreeSet<String> = self.store.streaming_agents().into_iter().collect();
        agents.extend(self.transcripts.keys().cloned());
        agents.into_iter().collect()
    }

    fn finish_turn(&mut self, agent: &str, at: DateTime<Utc>) {
        if let Some(pending) = self.buffer.finalize(agent) {
            self.store.upsert_streaming_message(agent, &pending);
        }
        self.scan(agent, at, true);
        self.transcripts.remove(agent);
        if let Some(message) = self.store.finalize_message(agent) {
            self.finished.push(message);
        }
    }

    /// Rescan the agent's turn text. Mid-turn, only settled matches are
    /// used; a marker whose block may still grow waits for a later pass.
    fn scan(&mut self, agent: &str, at: DateTime<Utc>, end_of_turn: bool) {
        let Some(text) = self.transcripts.get(agent) else {
            return;
        };
        let events: Vec<_> = self
            .extractor
            .extract(agent, text)
            .iter()
            .filter(|activity| end_of_turn || activity.settled)
            .map(|activity| self.builder.from_activity(activity, at))
            .collect();
        if !events.is_empty() {
            self.store.append_timeline_events(events);
        }
    }
}

/// Text shown for a tool result, if there is any.
fn result_preview(result: &serde_json::Value) -> Option<String> {
    match result {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreChange;
    use crate::types::{
        EventDetails, FileOperation, MessageStatus, TimelineEventKind, ToolStatus,
    };
    use std::time::Duration;

    fn session() -> StreamSession {
        StreamSession::new("s1", &StreamConfig::default())
    }

    fn chunk(agent: &str, kind: ChunkKind) -> Chunk {
        Chunk::new(agent, kind)
    }

    #[test]
    fn test_text_flushes_into_streaming_message() {
        let mut session = session();
        session.ingest(vec![
            Chunk::text("Researcher", "Hel"),
            Chunk::text("Researcher", "lo"),
        ]);
        assert!(session.has_pending());
        assert!(session.store().streaming_message("Researcher").is_none());

        assert_eq!(session.flush(Instant::now()), 1);
        let message = session.store().streaming_message("Researcher").unwrap();
        assert_eq!(message.content, "Hello");
        assert_eq!(message.status, MessageStatus::Streaming);
    }

    #[test]
    fn test_completion_flushes_pending_before_finalizing() {
        let mut session = session();
        let t0 = Instant::now();
        session.ingest(vec![Chunk::text("A", "first ")]);
        session.flush(t0);
        session.ingest(vec![
            Chunk::text("A", "second"),
            chunk("A", ChunkKind::AgentCompleted),
        ]);

        let finished = session.take_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].content, "first second");
        assert_eq!(finished[0].status, MessageStatus::Sent);
        assert!(!session.has_pending());
        assert!(session.take_finished().is_empty());
        assert_eq!(session.store().agents()["A"], AgentStatus::Completed);
    }

    #[test]
    fn test_markers_become_timeline_events() {
        let mut session = session();
        session.ingest(vec![Chunk::text(
            "Researcher",
            "🔧 **Tool Called:** `search`\n**Purpose:** find sources\n\n",
        )]);
        let tool = session.store().timeline().iter().next().unwrap().clone();
        assert_eq!(tool.kind, TimelineEventKind::Tool);
        assert_eq!(tool.status, Some(EventStatus::Running));

        // Result arrives in a later batch; the rescan flips the same event
        session.ingest(vec![Chunk::text(
            "Researcher",
            "✅ Found 3 results\n✅ **File Written Successfully:** `notes.md`\n**Size:** 120 bytes\n**Lines:** 4\n\n",
        )]);
        let events: Vec<_> = session.store().timeline().iter().cloned().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, tool.id);
        assert_eq!(events[0].status, Some(EventStatus::Success));
        assert!(matches!(
            &events[1].details,
            Some(EventDetails::FileOperation {
                operation: FileOperation::Written,
                size_bytes: Some(120),
                lines: Some(4),
                ..
            })
        ));
    }

    #[test]
    fn test_structured_tool_result_completes_execution() {
        let mut session = session();
        session.ingest(vec![
            chunk(
                "A",
                ChunkKind::ToolCall {
                    tool: "search".to_string(),
                    parameters: serde_json::json!({"q": "rust"}),
                },
            ),
            chunk(
                "A",
                ChunkKind::ToolResult {
                    tool: "search".to_string(),
                    result: serde_json::json!("3 hits"),
                    success: true,
                },
            ),
        ]);

        let message = session.store().streaming_message("A").unwrap();
        assert_eq!(message.tools.len(), 1);
        assert_eq!(message.tools[0].status, ToolStatus::Success);

        let event = session.store().timeline().iter().next().unwrap();
        assert_eq!(event.status, Some(EventStatus::Success));
        assert_eq!(event.children.len(), 1);
        assert!(event.duration_ms.is_some());
    }

    #[test]
    fn test_done_finalizes_all_and_closes_timeline() {
        let mut session = session();
        session.ingest(vec![
            chunk("A", ChunkKind::AgentStarted),
            Chunk::text("A", "a text"),
            Chunk::text("B", "b text"),
            chunk("", ChunkKind::Done),
        ]);

        let finished = session.take_finished();
        assert_eq!(finished.len(), 2);
        assert!(finished.iter().all(|m| m.status == MessageStatus::Sent));
        assert!(session.store().streaming_agents().is_empty());
        assert!(session
            .store()
            .timeline()
            .iter()
            .all(|e| !e.status.is_some_and(|s| s.is_open())));
    }

    #[test]
    fn test_error_fails_open_messages_with_content() {
        let mut session = session();
        session.ingest(vec![
            Chunk::text("A", "partial"),
            chunk(
                "A",
                ChunkKind::Error {
                    message: "model overloaded".to_string(),
                },
            ),
        ]);

        let finished = session.take_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].content, "partial");
        assert_eq!(finished[0].status, MessageStatus::Error);
        assert_eq!(
            finished[0].metadata.error.as_deref(),
            Some("model overloaded")
        );
    }

    #[test]
    fn test_error_keeps_markers_from_the_failed_turn() {
        let mut session = session();
        session.ingest(vec![
            Chunk::text("A", "🔧 **Tool Called:** `search`\n\n🤝 Handoff: A → B"),
            chunk(
                "A",
                ChunkKind::Error {
                    message: "model overloaded".to_string(),
                },
            ),
        ]);

        let events: Vec<_> = session
            .store()
            .timeline()
            .iter()
            .map(|e| (e.kind, e.status))
            .collect();
        assert_eq!(
            events,
            vec![
                (TimelineEventKind::Tool, Some(EventStatus::Error)),
                (TimelineEventKind::Handoff, Some(EventStatus::Success)),
                (TimelineEventKind::Error, Some(EventStatus::Error)),
            ]
        );
    }

    #[test]
    fn test_abort_keeps_partial_content_and_marks_interrupted() {
        let mut session = session();
        session.ingest(vec![Chunk::text("A", "half a thou")]);
        session.abort();

        let finished = session.take_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].content, "half a thou");
        assert!(finished[0].metadata.interrupted);
        assert!(!session.has_pending());
    }

    #[test]
    fn test_flush_respects_interval_per_agent() {
        let config = StreamConfig {
            flush_interval_ms: 50,
            ..Default::default()
        };
        let mut session = StreamSession::new("s1", &config);
        let t0 = Instant::now();

        session.ingest(vec![Chunk::text("A", "one")]);
        assert_eq!(session.flush(t0), 1);
        session.ingest(vec![Chunk::text("A", " two")]);
        assert_eq!(session.flush(t0 + Duration::from_millis(10)), 0);
        assert_eq!(session.flush(t0 + Duration::from_millis(50)), 1);
        assert_eq!(
            session.store().streaming_message("A").unwrap().content,
            "one two"
        );
    }

    #[test]
    fn test_changes_reported() {
        let mut session = session();
        session.ingest(vec![Chunk::text("A", "x")]);
        session.flush(Instant::now());
        let changes = session.store_mut().take_changes();
        assert!(changes
            .iter()
            .any(|c| matches!(c, StoreChange::MessageAppended { delta, .. } if delta == "x")));
    }
}
