//! Follow a remote session end to end
//!
//! [`follow`] wires the pieces together: the [`PollingDriver`] runs as its
//! own task and sends batches over a channel; this task owns the
//! [`StreamSession`], applies batches as they arrive, runs the flush tick
//! while text is pending, persists finished messages and, at the end,
//! saves the resume cursor.

use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::StreamBackend;
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::store::{MessageSink, SessionStore, StateStore, StoreChange};
use crate::stream::poller::{PollConfig, PollOutcome, PollingDriver};
use crate::stream::session::StreamSession;
use crate::types::{Chunk, RunStatus};

/// What to follow and how
#[derive(Debug, Clone)]
pub struct FollowOptions {
    pub session_id: String,
    /// Start offset; defaults to the persisted cursor
    pub offset: Option<u64>,
    pub poll: PollConfig,
    pub stream: StreamConfig,
}

impl FollowOptions {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            offset: None,
            poll: PollConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

/// Result of a finished follow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowSummary {
    pub outcome: PollOutcome,
    /// Cursor saved for the next follow
    pub offset: u64,
    pub status: Option<RunStatus>,
    pub chunks: u64,
    pub messages: usize,
    /// Messages accepted by the sink
    pub persisted: usize,
    pub timeline_events: usize,
}

/// Follow a session until its run ends or `cancel` fires.
///
/// `observer` sees the store after every applied change set. Returns the
/// summary together with the final session so callers can render it.
pub async fn follow<B, O>(
    backend: B,
    sink: Option<&dyn MessageSink>,
    states: &dyn StateStore,
    options: FollowOptions,
    cancel: CancellationToken,
    mut observer: O,
) -> Result<(FollowSummary, StreamSession)>
where
    B: StreamBackend + 'static,
    O: FnMut(&SessionStore, &[StoreChange]),
{
    let session_id = options.session_id.clone();
    let state = states.load_state(&session_id)?;
    let start = options.offset.unwrap_or(state.cursor);
    let mut session = StreamSession::from_state(&state, &options.stream);

    tracing::info!(session_id = %session_id, offset = start, "following session");

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Chunk>>();
    let driver = PollingDriver::new(backend, options.poll);
    let driver_cancel = cancel.child_token();
    let driver_session = session_id.clone();
    let handle = tokio::spawn(async move {
        driver
            .run(&driver_session, start, &driver_cancel, move |batch| {
                // Receiver only goes away when the follow loop is done
                let _ = tx.send(batch);
            })
            .await
    });

    let mut tick = tokio::time::interval(options.stream.flush_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut persisted = 0;

    loop {
        tokio::select! {
            batch = rx.recv() => match batch {
                Some(batch) => {
                    session.ingest(batch);
                    session.flush(Instant::now());
                }
                None => break,
            },
            _ = tick.tick(), if session.has_pending() => {
                session.flush(Instant::now());
            }
        }
        persisted += persist_finished(&mut session, sink, &session_id).await;
        notify(&mut session, &mut observer);
    }

    let report = handle
        .await
        .map_err(|e| Error::Task(format!("polling task: {}", e)))?;

    match &report.outcome {
        PollOutcome::Completed | PollOutcome::WaitingForClarification => {
            session.finish_all(Utc::now())
        }
        PollOutcome::Cancelled => session.abort(),
        PollOutcome::RemoteError => session.fail("run ended with an error"),
        PollOutcome::Stalled => session.fail("no activity before the inactivity timeout"),
        PollOutcome::Failed(reason) => session.fail(reason),
    }
    persisted += persist_finished(&mut session, sink, &session_id).await;
    notify(&mut session, &mut observer);

    states.save_state(&session.store().to_state(report.offset, report.status))?;

    let summary = FollowSummary {
        outcome: report.outcome,
        offset: report.offset,
        status: report.status,
        chunks: report.chunks,
        messages: session.store().messages().len(),
        persisted,
        timeline_events: session.store().timeline().len(),
    };
    tracing::info!(
        session_id = %session_id,
        outcome = %summary.outcome,
        messages = summary.messages,
        persisted = summary.persisted,
        "follow finished"
    );
    Ok((summary, session))
}

/// Write finished messages to the sink. Failures are logged, not fatal.
async fn persist_finished(
    session: &mut StreamSession,
    sink: Option<&dyn MessageSink>,
    session_id: &str,
) -> usize {
    let finished = session.take_finished();
    let Some(sink) = sink else {
        return 0;
    };

    let mut persisted = 0;
    for message in finished {
        match sink.persist_message(session_id, &message).await {
            Ok(receipt) => {
                session.store_mut().set_remote_id(&message.id, receipt.id);
                persisted += 1;
            }
            Err(e) => {
                tracing::warn!(
                    session_id,
                    message_id = %message.id,
                    error = %e,
                    "failed to persist message"
                );
            }
        }
    }
    persisted
}

fn notify<O>(session: &mut StreamSession, observer: &mut O)
where
    O: FnMut(&SessionStore, &[StoreChange]),
{
    let changes = session.store_mut().take_changes();
    if !changes.is_empty() {
        observer(session.store(), &changes);
    }
}
