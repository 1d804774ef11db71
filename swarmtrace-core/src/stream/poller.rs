//! Polling driver
//!
//! Repeatedly asks a [`StreamBackend`] for chunks after the current offset
//! and hands each non-empty batch to a callback, until the run reaches a
//! terminal state, the stream ends, the inactivity watchdog fires, polling
//! fails too often, or the caller cancels.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::StreamBackend;
use crate::config::BackendConfig;
use crate::types::{Chunk, RunStatus};

/// Timing and retry knobs for [`PollingDriver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between polls
    pub interval: Duration,
    /// Time without progress before the run is force-stopped
    pub inactivity_timeout: Duration,
    /// Consecutive transient failures tolerated
    pub max_errors: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

impl From<&BackendConfig> for PollConfig {
    fn from(config: &BackendConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            inactivity_timeout: config.inactivity_timeout(),
            max_errors: config.max_poll_errors.max(1),
        }
    }
}

/// Why polling stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Run reported `done`, or the stream reported no more data
    Completed,
    /// Run paused for user input
    WaitingForClarification,
    /// Run reported `error`
    RemoteError,
    /// No progress within the inactivity timeout; the run was force-stopped
    Stalled,
    /// Polling itself failed (too many transient errors, or a fatal one)
    Failed(String),
    /// Caller cancelled
    Cancelled,
}

impl PollOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollOutcome::Completed => "completed",
            PollOutcome::WaitingForClarification => "waiting_for_clarification",
            PollOutcome::RemoteError => "remote_error",
            PollOutcome::Stalled => "stalled",
            PollOutcome::Failed(_) => "failed",
            PollOutcome::Cancelled => "cancelled",
        }
    }

    /// Whether the run finished on its own terms
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            PollOutcome::Completed | PollOutcome::WaitingForClarification
        )
    }
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Final state of a polling run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub outcome: PollOutcome,
    /// Offset to resume from
    pub offset: u64,
    /// Last run status the backend reported
    pub status: Option<RunStatus>,
    pub polls: u64,
    pub chunks: u64,
}

/// Drives the poll loop for one session.
pub struct PollingDriver<B> {
    backend: B,
    config: PollConfig,
}

impl<B: StreamBackend> PollingDriver<B> {
    pub fn new(backend: B, config: PollConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll `session_id` from `offset` until a terminal condition.
    ///
    /// `on_batch` receives each non-empty batch in arrival order. Once
    /// `cancel` fires, the in-flight request is dropped and no further
    /// batch is delivered.
    pub async fn run<F>(
        &self,
        session_id: &str,
        offset: u64,
        cancel: &CancellationToken,
        mut on_batch: F,
    ) -> PollReport
    where
        F: FnMut(Vec<Chunk>),
    {
        let mut report = PollReport {
            outcome: PollOutcome::Cancelled,
            offset,
            status: None,
            polls: 0,
            chunks: 0,
        };
        let mut consecutive_errors = 0u32;
        let mut last_progress = Instant::now();

        tracing::info!(session_id, offset, "polling started");

        let outcome = loop {
            if cancel.is_cancelled() {
                break PollOutcome::Cancelled;
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break PollOutcome::Cancelled,
                result = self.backend.poll(session_id, report.offset) => result,
            };
            report.polls += 1;

            match result {
                Ok(response) => {
                    // The cursor only moves past chunks that were handed over
                    if cancel.is_cancelled() {
                        break PollOutcome::Cancelled;
                    }
                    consecutive_errors = 0;

                    let advanced = response.offset > report.offset;
                    if response.offset < report.offset {
                        tracing::warn!(
                            session_id,
                            current = report.offset,
                            returned = response.offset,
                            "backend returned an older offset, ignoring"
                        );
                    }
                    if advanced || !response.chunks.is_empty() {
                        last_progress = Instant::now();
                    }
                    report.offset = report.offset.max(response.offset);
                    report.status = Some(response.status);

                    if !response.chunks.is_empty() {
                        tracing::debug!(
                            session_id,
                            chunks = response.chunks.len(),
                            offset = report.offset,
                            "batch received"
                        );
                        report.chunks += response.chunks.len() as u64;
                        on_batch(response.chunks);
                    }

                    match response.status {
                        RunStatus::Done => break PollOutcome::Completed,
                        RunStatus::Error => break PollOutcome::RemoteError,
                        RunStatus::WaitingForClarification => {
                            break PollOutcome::WaitingForClarification
                        }
                        RunStatus::Running | RunStatus::Unknown => {}
                    }
                    if !response.has_more {
                        break PollOutcome::Completed;
                    }
                }
                Err(e) if e.is_transient() => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        session_id,
                        attempt = consecutive_errors,
                        max = self.config.max_errors,
                        error = %e,
                        "poll failed"
                    );
                    if consecutive_errors >= self.config.max_errors {
                        break PollOutcome::Failed(e.to_string());
                    }
                }
                Err(e) => {
                    tracing::error!(session_id, error = %e, "poll failed permanently");
                    break PollOutcome::Failed(e.to_string());
                }
            }

            if last_progress.elapsed() >= self.config.inactivity_timeout {
                tracing::warn!(
                    session_id,
                    timeout_secs = self.config.inactivity_timeout.as_secs(),
                    "no progress, stopping remote run"
                );
                if let Err(e) = self.backend.stop(session_id).await {
                    tracing::warn!(session_id, error = %e, "force-stop failed");
                }
                break PollOutcome::Stalled;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break PollOutcome::Cancelled,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        };

        tracing::info!(
            session_id,
            outcome = %outcome,
            offset = report.offset,
            polls = report.polls,
            "polling finished"
        );
        report.outcome = outcome;
        report
    }
}
