//! Error types for swarmtrace-core

use thiserror::Error;

/// Main error type for the swarmtrace-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure talking to the backend (connect, timeout, body)
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Backend answered with a non-success status
    #[error("backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    /// Session not found on the backend
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A background task panicked or was aborted
    #[error("background task failed: {0}")]
    Task(String),
}

impl Error {
    /// Whether a poll that failed with this error may be retried on the next tick.
    ///
    /// Transport failures and 5xx responses are transient; everything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Backend { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type alias for swarmtrace-core
pub type Result<T> = std::result::Result<T, Error>;
