//! Swarm backend API
//!
//! The backend runs the swarm and exposes its output as an offset-addressed
//! chunk stream. This module holds the wire types, the [`StreamBackend`]
//! seam the polling driver is written against, and the HTTP implementation
//! in [`BackendClient`].
//!
//! ## Endpoints
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/sessions/{id}/stream?offset=N` | Chunks after offset N, plus run status |
//! | POST | `/sessions/{id}/stop` | Stop the remote run |
//! | POST | `/sessions/{id}/messages` | Persist a finished message |
//! | GET | `/health` | Liveness |

mod client;

pub use client::BackendClient;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::types::{Chunk, RunStatus};

/// Response from GET /sessions/{id}/stream
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PollResponse {
    /// Chunks after the requested offset, in emission order
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    /// Offset to request next
    pub offset: u64,
    /// Whether the stream may still produce chunks
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub status: RunStatus,
}

/// Source of a session's chunk stream.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Fetch chunks after `offset`.
    async fn poll(&self, session_id: &str, offset: u64) -> Result<PollResponse>;

    /// Ask the backend to stop the run.
    async fn stop(&self, session_id: &str) -> Result<()>;
}

#[async_trait]
impl<T: StreamBackend + ?Sized> StreamBackend for std::sync::Arc<T> {
    async fn poll(&self, session_id: &str, offset: u64) -> Result<PollResponse> {
        (**self).poll(session_id, offset).await
    }

    async fn stop(&self, session_id: &str) -> Result<()> {
        (**self).stop(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_response_defaults() {
        let response: PollResponse = serde_json::from_str(r#"{"offset": 7}"#).unwrap();
        assert_eq!(response.offset, 7);
        assert!(response.chunks.is_empty());
        assert!(!response.has_more);
        assert_eq!(response.status, RunStatus::Running);
    }
}
