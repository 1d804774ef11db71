//! Timeline event construction and the capped event log
//!
//! [`TimelineBuilder`] turns extractor matches and structured chunks into
//! [`TimelineEvent`]s, each paired with a dedupe key. [`TimelineLog`] holds
//! the ordered list, drops repeats, and only ever mutates an existing event
//! to close it (status flip plus duration) or to attach its output child.
//!
//! Marker text is rescanned on every poll cycle, so the same match shows up
//! again and again. The key for marker events is `kind|agent|title`; two
//! matches with the same key collapse into one event. Progress markers and
//! structured chunks are fine-grained and also key on their position
//! (text offset or chunk timestamp).

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::stream::extract::{Activity, ActivityKind};
use crate::types::{
    AgentStatus, Chunk, ChunkKind, EventDetails, EventStatus, FileOperation, ProgressActivity,
    TimelineEvent, TimelineEventKind,
};

/// Default maximum number of events kept by [`TimelineLog`].
pub const DEFAULT_TIMELINE_CAP: usize = 500;

/// Default length of the output preview attached to tool results.
pub const DEFAULT_OUTPUT_PREVIEW: usize = 500;

/// A timeline event together with the key used to deduplicate it
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedEvent {
    pub key: String,
    pub event: TimelineEvent,
}

/// What a [`TimelineLog`] mutation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineChange {
    Added(String),
    Updated(String),
}

impl TimelineChange {
    pub fn event_id(&self) -> &str {
        match self {
            TimelineChange::Added(id) | TimelineChange::Updated(id) => id,
        }
    }
}

/// Compute a compact dedupe key.
///
/// Returns a 32-character hex digest of SHA-256(kind|agent|title[|stamp]).
pub fn dedupe_key(
    kind: TimelineEventKind,
    agent: &str,
    title: &str,
    stamp: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(agent.as_bytes());
    hasher.update(b"|");
    hasher.update(title.as_bytes());
    if let Some(stamp) = stamp {
        hasher.update(b"|");
        hasher.update(stamp.as_bytes());
    }
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

/// Truncate to `max` characters, appending an ellipsis when anything was cut.
pub fn truncate_for_display(text: &str, max: usize) -> (String, bool) {
    match text.char_indices().nth(max) {
        Some((cut, _)) => (format!("{}…", &text[..cut]), true),
        None => (text.to_string(), false),
    }
}

/// Converts matches and chunks into keyed timeline events.
#[derive(Debug, Clone)]
pub struct TimelineBuilder {
    preview_chars: usize,
}

impl Default for TimelineBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_PREVIEW)
    }
}

impl TimelineBuilder {
    pub fn new(preview_chars: usize) -> Self {
        Self { preview_chars }
    }

    /// Child event holding a tool's raw output, truncated for display.
    pub fn output_child(&self, agent: &str, output: &str, at: DateTime<Utc>) -> TimelineEvent {
        let (text, truncated) = truncate_for_display(output, self.preview_chars);
        TimelineEvent::new(TimelineEventKind::Action, "Output")
            .with_agent(agent)
            .with_details(EventDetails::Output { text, truncated })
            .at(at)
    }

    /// Build the event for one extractor match.
    pub fn from_activity(&self, activity: &Activity, at: DateTime<Utc>) -> KeyedEvent {
        let agent = activity.agent.as_str();

        let (event, stamp) = match &activity.kind {
            ActivityKind::ToolCall(call) => {
                let title = match &call.target {
                    Some(target) => format!("{} ({})", call.tool, target.path),
                    None => call.tool.clone(),
                };
                let status = match &call.outcome {
                    None => EventStatus::Running,
                    Some(o) if o.success => EventStatus::Success,
                    Some(_) => EventStatus::Error,
                };
                let mut event = TimelineEvent::new(TimelineEventKind::Tool, title)
                    .with_agent(agent)
                    .with_status(status)
                    .with_details(EventDetails::ToolCall {
                        tool: call.tool.clone(),
                        purpose: call.purpose.clone(),
                        target: call.target.clone(),
                        parameters: None,
                    })
                    .at(at);
                if let Some(purpose) = &call.purpose {
                    event.description = Some(purpose.clone());
                }
                if let Some(outcome) = &call.outcome {
                    event
                        .children
                        .push(self.output_child(agent, &outcome.output, at));
                }
                (event, None)
            }
            ActivityKind::FileResult(file) => {
                let (title, status) = match file.operation {
                    FileOperation::Found => (format!("Found {}", file.path), EventStatus::Success),
                    FileOperation::NotFound => {
                        (format!("Not found {}", file.path), EventStatus::Error)
                    }
                    FileOperation::Written => {
                        (format!("Wrote {}", file.path), EventStatus::Success)
                    }
                };
                let mut event = TimelineEvent::new(TimelineEventKind::Action, title)
                    .with_agent(agent)
                    .with_status(status)
                    .with_details(EventDetails::FileOperation {
                        operation: file.operation,
                        path: file.path.clone(),
                        size_bytes: file.size_bytes,
                        lines: file.lines,
                    })
                    .at(at);
                event.description = file_stats(file.size_bytes, file.lines);
                (event, None)
            }
            ActivityKind::Handoff(handoff) => {
                let mut event = TimelineEvent::new(
                    TimelineEventKind::Handoff,
                    format!("{} → {}", handoff.from, handoff.to),
                )
                .with_agent(agent)
                .with_status(EventStatus::Success)
                .with_details(EventDetails::Handoff {
                    from: handoff.from.clone(),
                    to: handoff.to.clone(),
                    reason: handoff.reason.clone(),
                })
                .at(at);
                event.description = handoff.reason.clone();
                (event, None)
            }
            ActivityKind::Progress(progress) => {
                let title = match (&progress.activity, &progress.path) {
                    (ProgressActivity::Writing, Some(path)) => format!("Writing {}", path),
                    (ProgressActivity::Writing, None) => "Writing".to_string(),
                    (ProgressActivity::Reading, _) => "Reading".to_string(),
                };
                let event = TimelineEvent::new(TimelineEventKind::Action, title)
                    .with_agent(agent)
                    .with_status(EventStatus::Running)
                    .with_details(EventDetails::FileProgress {
                        activity: progress.activity,
                        path: progress.path.clone(),
                    })
                    .at(at);
                (event, Some(activity.offset.to_string()))
            }
        };

        KeyedEvent {
            key: dedupe_key(event.kind, agent, &event.title, stamp.as_deref()),
            event,
        }
    }

    /// Build the event for a structured chunk.
    ///
    /// Text chunks and tool results produce nothing here: text feeds the
    /// token buffer and extractor, results close an existing tool event via
    /// [`TimelineLog::resolve_tool`].
    pub fn from_chunk(&self, chunk: &Chunk) -> Option<KeyedEvent> {
        let agent = chunk.agent.as_str();
        let at = chunk.timestamp;

        let event = match &chunk.kind {
            ChunkKind::Text { .. } | ChunkKind::ToolResult { .. } => return None,
            ChunkKind::ToolCall { tool, parameters } => {
                TimelineEvent::new(TimelineEventKind::Tool, tool.clone())
                    .with_status(EventStatus::Running)
                    .with_details(EventDetails::ToolCall {
                        tool: tool.clone(),
                        purpose: None,
                        target: None,
                        parameters: (!parameters.is_null()).then(|| parameters.clone()),
                    })
            }
            ChunkKind::AgentStarted => {
                TimelineEvent::new(TimelineEventKind::Agent, format!("{} started", agent))
                    .with_status(EventStatus::Running)
                    .with_details(EventDetails::Agent {
                        status: AgentStatus::Running,
                    })
            }
            ChunkKind::AgentCompleted => {
                TimelineEvent::new(TimelineEventKind::Agent, format!("{} completed", agent))
                    .with_status(EventStatus::Success)
                    .with_details(EventDetails::Agent {
                        status: AgentStatus::Completed,
                    })
            }
            ChunkKind::Handoff { from, to, reason } => {
                let mut event =
                    TimelineEvent::new(TimelineEventKind::Handoff, format!("{} → {}", from, to))
                        .with_status(EventStatus::Success)
                        .with_details(EventDetails::Handoff {
                            from: from.clone(),
                            to: to.clone(),
                            reason: reason.clone(),
                        });
                event.description = reason.clone();
                event
            }
            ChunkKind::Done => TimelineEvent::new(TimelineEventKind::Complete, "Run complete")
                .with_status(EventStatus::Success),
            ChunkKind::Error { message } => TimelineEvent::new(TimelineEventKind::Error, "Error")
                .with_status(EventStatus::Error)
                .with_description(message.clone())
                .with_details(EventDetails::Error {
                    message: message.clone(),
                }),
        }
        .with_agent(agent)
        .at(at);

        let stamp = at.timestamp_nanos_opt().unwrap_or_default().to_string();
        Some(KeyedEvent {
            key: dedupe_key(event.kind, agent, &event.title, Some(&stamp)),
            event,
        })
    }
}

fn file_stats(size_bytes: Option<u64>, lines: Option<u64>) -> Option<String> {
    match (size_bytes, lines) {
        (Some(size), Some(lines)) => Some(format!("{} bytes, {} lines", size, lines)),
        (Some(size), None) => Some(format!("{} bytes", size)),
        (None, Some(lines)) => Some(format!("{} lines", lines)),
        (None, None) => None,
    }
}

/// Close an open event, recording how long it was open.
fn finish(event: &mut TimelineEvent, status: EventStatus, at: DateTime<Utc>) {
    event.status = Some(status);
    event.duration_ms = Some((at - event.timestamp).num_milliseconds().max(0));
}

/// Ordered, capped, deduplicated list of timeline events.
///
/// Once more than `cap` events are held the oldest are dropped first.
/// Keys of dropped events are remembered (up to a bound) so rescanned
/// text does not bring them back.
#[derive(Debug)]
pub struct TimelineLog {
    cap: usize,
    events: VecDeque<TimelineEvent>,
    keys: HashMap<String, String>,
    key_order: VecDeque<String>,
}

impl Default for TimelineLog {
    fn default() -> Self {
        Self::new(DEFAULT_TIMELINE_CAP)
    }
}

impl TimelineLog {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            events: VecDeque::new(),
            keys: HashMap::new(),
            key_order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimelineEvent> {
        self.events.iter()
    }

    pub fn get(&self, id: &str) -> Option<&TimelineEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut TimelineEvent> {
        self.events.iter_mut().find(|e| e.id == id)
    }

    /// Append a batch of events, merging repeats.
    pub fn append(&mut self, batch: Vec<KeyedEvent>) -> Vec<TimelineChange> {
        let mut changes = Vec::new();
        for keyed in batch {
            changes.extend(self.apply(keyed));
        }
        changes
    }

    /// Insert one event, or merge it into the event already holding its key.
    pub fn apply(&mut self, keyed: KeyedEvent) -> Vec<TimelineChange> {
        let KeyedEvent { key, event } = keyed;

        if let Some(existing_id) = self.keys.get(&key).cloned() {
            return self.merge(&existing_id, event).into_iter().collect();
        }

        let mut changes = Vec::new();

        // A finished write closes the matching "Writing <path>" progress event
        if let Some(EventDetails::FileOperation {
            operation: FileOperation::Written,
            path,
            ..
        }) = &event.details
        {
            if let Some(change) = self.resolve_progress(event.agent.as_deref(), path, event.timestamp)
            {
                changes.push(change);
            }
        }

        let id = event.id.clone();
        self.remember_key(key, id.clone());
        self.events.push_back(event);
        while self.events.len() > self.cap {
            self.events.pop_front();
        }
        changes.push(TimelineChange::Added(id));
        changes
    }

    fn remember_key(&mut self, key: String, id: String) {
        self.key_order.push_back(key.clone());
        self.keys.insert(key, id);
        while self.key_order.len() > self.cap.saturating_mul(4) {
            if let Some(old) = self.key_order.pop_front() {
                self.keys.remove(&old);
            }
        }
    }

    /// Repeats may only close an open event and attach its output child.
    fn merge(&mut self, id: &str, incoming: TimelineEvent) -> Option<TimelineChange> {
        let existing = self.get_mut(id)?;
        let current = existing.status?;
        let next = incoming.status?;
        if !current.is_open() || next.is_open() {
            return None;
        }

        finish(existing, next, incoming.timestamp);
        if existing.children.is_empty() {
            existing.children = incoming.children;
        }
        Some(TimelineChange::Updated(id.to_string()))
    }

    fn resolve_progress(
        &mut self,
        agent: Option<&str>,
        path: &str,
        at: DateTime<Utc>,
    ) -> Option<TimelineChange> {
        let event = self.events.iter_mut().rev().find(|e| {
            e.agent.as_deref() == agent
                && e.status.is_some_and(|s| s.is_open())
                && matches!(
                    &e.details,
                    Some(EventDetails::FileProgress {
                        activity: ProgressActivity::Writing,
                        path: Some(p),
                    }) if p == path
                )
        })?;
        finish(event, EventStatus::Success, at);
        Some(TimelineChange::Updated(event.id.clone()))
    }

    /// Close the most recent open tool event for `agent` + `tool`.
    ///
    /// Returns `None` when no open call matches; the caller decides whether
    /// to record a standalone result instead.
    pub fn resolve_tool(
        &mut self,
        agent: &str,
        tool: &str,
        success: bool,
        output: Option<TimelineEvent>,
        at: DateTime<Utc>,
    ) -> Option<TimelineChange> {
        let event = self.events.iter_mut().rev().find(|e| {
            e.kind == TimelineEventKind::Tool
                && e.agent.as_deref() == Some(agent)
                && e.status.is_some_and(|s| s.is_open())
                && matches!(&e.details, Some(EventDetails::ToolCall { tool: t, .. }) if t == tool)
        })?;

        let status = if success {
            EventStatus::Success
        } else {
            EventStatus::Error
        };
        finish(event, status, at);
        if let Some(child) = output {
            if event.children.is_empty() {
                event.children.push(child);
            }
        }
        Some(TimelineChange::Updated(event.id.clone()))
    }

    /// Close the agent's open "started" event.
    pub fn resolve_agent(
        &mut self,
        agent: &str,
        status: EventStatus,
        at: DateTime<Utc>,
    ) -> Option<TimelineChange> {
        let event = self.events.iter_mut().rev().find(|e| {
            e.kind == TimelineEventKind::Agent
                && e.agent.as_deref() == Some(agent)
                && e.status.is_some_and(|s| s.is_open())
        })?;
        finish(event, status, at);
        Some(TimelineChange::Updated(event.id.clone()))
    }

    /// Close every event still pending or running.
    pub fn close_open(&mut self, status: EventStatus, at: DateTime<Utc>) -> Vec<TimelineChange> {
        self.events
            .iter_mut()
            .filter(|e| e.status.is_some_and(|s| s.is_open()))
            .map(|e| {
                finish(e, status, at);
                TimelineChange::Updated(e.id.clone())
            })
            .collect()
    }

    /// Drop everything, including remembered keys.
    pub fn clear(&mut self) {
        self.events.clear();
        self.keys.clear();
        self.key_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::extract::{ActivityExtractor, MarkerExtractor};
    use pretty_assertions::assert_eq;

    fn build(text: &str) -> Vec<KeyedEvent> {
        let builder = TimelineBuilder::default();
        let now = Utc::now();
        MarkerExtractor::new()
            .extract("Researcher", text)
            .iter()
            .map(|a| builder.from_activity(a, now))
            .collect()
    }

    #[test]
    fn test_duplicate_keys_in_one_call_collapse() {
        let text = "🤝 Handoff: Researcher → Writer\nlater...\n🤝 Handoff: Researcher → Writer\n";
        let batch = build(text);
        assert_eq!(batch.len(), 2);

        let mut log = TimelineLog::default();
        let changes = log.append(batch);
        assert_eq!(log.len(), 1);
        assert_eq!(changes.len(), 1);
        assert_eq!(log.iter().next().unwrap().title, "Researcher → Writer");
    }

    #[test]
    fn test_rescan_flips_running_tool_to_success() {
        let mut log = TimelineLog::default();

        let partial = "🔧 **Tool Called:** `search`\n**Purpose:** sources\n";
        log.append(build(partial));
        let event = log.iter().next().unwrap().clone();
        assert_eq!(event.status, Some(EventStatus::Running));
        assert!(event.children.is_empty());

        let full = format!("{partial}✅ **File Found:** `notes.md`\n");
        let changes = log.append(build(&full));

        let tool = log.get(&event.id).unwrap();
        assert_eq!(tool.status, Some(EventStatus::Success));
        assert!(tool.duration_ms.is_some());
        assert_eq!(tool.children.len(), 1);
        assert!(matches!(
            &tool.children[0].details,
            Some(EventDetails::Output { text, .. }) if text.contains("notes.md")
        ));
        assert!(changes.contains(&TimelineChange::Updated(event.id.clone())));
        // The file result is its own event
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_closed_events_never_reopen() {
        let mut log = TimelineLog::default();
        let key = dedupe_key(TimelineEventKind::Tool, "A", "x", None);
        let done = TimelineEvent::new(TimelineEventKind::Tool, "x")
            .with_agent("A")
            .with_status(EventStatus::Success);
        let running = TimelineEvent::new(TimelineEventKind::Tool, "x")
            .with_agent("A")
            .with_status(EventStatus::Running);

        log.apply(KeyedEvent {
            key: key.clone(),
            event: done,
        });
        let changes = log.apply(KeyedEvent {
            key,
            event: running,
        });
        assert!(changes.is_empty());
        assert_eq!(
            log.iter().next().unwrap().status,
            Some(EventStatus::Success)
        );
    }

    #[test]
    fn test_cap_drops_oldest() {
        let mut log = TimelineLog::new(500);
        let mut ids = Vec::new();
        for i in 0..750 {
            let event = TimelineEvent::new(TimelineEventKind::Thought, format!("step {}", i));
            ids.push(event.id.clone());
            log.apply(KeyedEvent {
                key: format!("k{}", i),
                event,
            });
            assert!(log.len() <= 500);
        }

        assert_eq!(log.len(), 500);
        assert_eq!(log.iter().next().unwrap().id, ids[250]);
        assert_eq!(log.iter().last().unwrap().id, ids[749]);
        assert!(log.get(&ids[0]).is_none());
    }

    #[test]
    fn test_trimmed_keys_not_readded() {
        let mut log = TimelineLog::new(2);
        for i in 0..3 {
            log.apply(KeyedEvent {
                key: format!("k{}", i),
                event: TimelineEvent::new(TimelineEventKind::Thought, "t"),
            });
        }
        let changes = log.apply(KeyedEvent {
            key: "k0".to_string(),
            event: TimelineEvent::new(TimelineEventKind::Thought, "t"),
        });
        assert!(changes.is_empty());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_file_write_event_details() {
        let batch = build(
            "🔧 **Tool Called:** `search`\n✅ **File Written Successfully:** `out.txt`\n**Size:** 120 bytes\n**Lines:** 4\n",
        );
        let write = batch
            .iter()
            .find(|k| k.event.title == "Wrote out.txt")
            .unwrap();
        assert_eq!(write.event.kind, TimelineEventKind::Action);
        assert_eq!(write.event.description.as_deref(), Some("120 bytes, 4 lines"));
        assert_eq!(
            write.event.details,
            Some(EventDetails::FileOperation {
                operation: FileOperation::Written,
                path: "out.txt".to_string(),
                size_bytes: Some(120),
                lines: Some(4),
            })
        );
    }

    #[test]
    fn test_written_closes_writing_progress() {
        let mut log = TimelineLog::default();
        log.append(build("✍️ **Writing file:** `draft.md`\n"));
        let writing_id = log.iter().next().unwrap().id.clone();

        log.append(build(
            "✍️ **Writing file:** `draft.md`\n✅ **File Written Successfully:** `draft.md`\n",
        ));

        assert_eq!(log.len(), 2);
        assert_eq!(
            log.get(&writing_id).unwrap().status,
            Some(EventStatus::Success)
        );
    }

    #[test]
    fn test_resolve_tool_most_recent_open() {
        let builder = TimelineBuilder::default();
        let mut log = TimelineLog::default();
        for _ in 0..2 {
            let chunk = Chunk::new(
                "A",
                ChunkKind::ToolCall {
                    tool: "search".to_string(),
                    parameters: serde_json::Value::Null,
                },
            );
            log.apply(builder.from_chunk(&chunk).unwrap());
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let ids: Vec<_> = log.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids.len(), 2);

        let child = builder.output_child("A", "3 hits", Utc::now());
        let change = log.resolve_tool("A", "search", true, Some(child), Utc::now());
        assert_eq!(change, Some(TimelineChange::Updated(ids[1].clone())));
        assert_eq!(log.get(&ids[0]).unwrap().status, Some(EventStatus::Running));
        assert_eq!(log.get(&ids[1]).unwrap().children.len(), 1);

        assert!(log.resolve_tool("B", "search", true, None, Utc::now()).is_none());
    }

    #[test]
    fn test_close_open() {
        let mut log = TimelineLog::default();
        log.append(build("🔧 **Tool Called:** `a`\n⏳ Reading...\n🤝 Handoff: A → B\n"));
        let changes = log.close_open(EventStatus::Success, Utc::now());
        assert_eq!(changes.len(), 2);
        assert!(log
            .iter()
            .all(|e| e.status == Some(EventStatus::Success)));
    }

    #[test]
    fn test_truncate_for_display() {
        assert_eq!(truncate_for_display("short", 10), ("short".to_string(), false));
        assert_eq!(
            truncate_for_display("ééééé", 3),
            ("ééé…".to_string(), true)
        );
    }

    #[test]
    fn test_dedupe_key_stable() {
        let a = dedupe_key(TimelineEventKind::Tool, "A", "search", None);
        let b = dedupe_key(TimelineEventKind::Tool, "A", "search", None);
        let c = dedupe_key(TimelineEventKind::Tool, "A", "search", Some("42"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}
