//! Per-agent token coalescing
//!
//! Text deltas arrive far more often than anything downstream wants to
//! re-render. [`TokenBuffer`] collects them per agent and releases them in
//! batches, at most once per flush interval for any single agent.
//!
//! The debounce is leading-edge: the first text after a quiet period is
//! released on the next [`TokenBuffer::flush_due`] call, and anything that
//! arrives within the interval after that waits for the interval to pass.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Text released for one agent by a flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flush {
    pub agent: String,
    pub text: String,
}

#[derive(Debug, Default)]
struct AgentBuffer {
    pending: String,
    last_flush: Option<Instant>,
}

/// Accumulates text fragments per agent and drains them on a fixed cadence.
#[derive(Debug)]
pub struct TokenBuffer {
    interval: Duration,
    agents: HashMap<String, AgentBuffer>,
    /// First-seen order, so batches are emitted deterministically
    order: Vec<String>,
}

impl TokenBuffer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            agents: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Merge `text` into the agent's pending string.
    pub fn append(&mut self, agent: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.agents.contains_key(agent) {
            self.order.push(agent.to_string());
        }
        self.agents
            .entry(agent.to_string())
            .or_default()
            .pending
            .push_str(text);
    }

    /// Drain every agent whose pending text may be flushed at `now`.
    ///
    /// An agent is eligible when it has pending text and was never flushed,
    /// or was last flushed at least one interval ago.
    pub fn flush_due(&mut self, now: Instant) -> Vec<Flush> {
        let interval = self.interval;
        let mut flushes = Vec::new();

        for agent in &self.order {
            let Some(buffer) = self.agents.get_mut(agent) else {
                continue;
            };
            if buffer.pending.is_empty() {
                continue;
            }
            let due = match buffer.last_flush {
                None => true,
                Some(last) => now.saturating_duration_since(last) >= interval,
            };
            if due {
                buffer.last_flush = Some(now);
                flushes.push(Flush {
                    agent: agent.clone(),
                    text: std::mem::take(&mut buffer.pending),
                });
            }
        }

        flushes
    }

    /// Drain one agent immediately, ignoring the interval.
    ///
    /// Used when the agent's turn ends; the agent's debounce state is reset
    /// so its next turn starts with a leading-edge flush.
    pub fn finalize(&mut self, agent: &str) -> Option<String> {
        let buffer = self.agents.remove(agent)?;
        self.order.retain(|a| a != agent);
        (!buffer.pending.is_empty()).then_some(buffer.pending)
    }

    /// Drain everything, ignoring the interval.
    pub fn drain_all(&mut self) -> Vec<Flush> {
        let mut flushes = Vec::new();
        for agent in self.order.drain(..) {
            if let Some(buffer) = self.agents.remove(&agent) {
                if !buffer.pending.is_empty() {
                    flushes.push(Flush {
                        agent,
                        text: buffer.pending,
                    });
                }
            }
        }
        flushes
    }

    /// Pending (unflushed) text for an agent.
    pub fn pending(&self, agent: &str) -> Option<&str> {
        self.agents
            .get(agent)
            .map(|b| b.pending.as_str())
            .filter(|p| !p.is_empty())
    }

    pub fn has_pending(&self) -> bool {
        self.agents.values().any(|b| !b.pending.is_empty())
    }

    /// Earliest instant at which some pending agent becomes flushable.
    pub fn next_due(&self) -> Option<Instant> {
        self.agents
            .values()
            .filter(|b| !b.pending.is_empty())
            .map(|b| b.last_flush.map(|last| last + self.interval))
            .min_by(|a, b| match (a, b) {
                (None, _) => std::cmp::Ordering::Less,
                (_, None) => std::cmp::Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
            .map(|due| due.unwrap_or_else(Instant::now))
    }
}

impl Default for TokenBuffer {
    fn default() -> Self {
        Self::new(Duration::from_millis(16))
    }
}
