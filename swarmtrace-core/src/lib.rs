//! # swarmtrace-core
//!
//! Core library for swarmtrace - a live follower for multi-agent swarm runs.
//!
//! This library provides:
//! - Domain types for chunks, messages and timeline events
//! - A polling driver for the backend's offset-addressed chunk stream
//! - Per-agent token coalescing and activity marker extraction
//! - The session store with its capped, deduplicated timeline
//! - SQLite storage for resume cursors, agent rosters and message marks
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Data flows through three stages:
//! - **Transport:** [`PollingDriver`] fetches [`Chunk`] batches from a [`StreamBackend`]
//! - **Processing:** [`StreamSession`] buffers text, extracts markers and builds timeline events
//! - **State:** [`SessionStore`] holds messages and the timeline; finished turns go to a
//!   [`MessageSink`], resume state to a [`StateStore`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use swarmtrace_core::{BackendClient, Config, Database, FollowOptions, PollConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> swarmtrace_core::Result<()> {
//! let config = Config::load()?;
//! let db = Database::open(&Config::database_path())?;
//! db.migrate()?;
//!
//! let client = BackendClient::new(config.backend.clone())?;
//! let options = FollowOptions {
//!     poll: PollConfig::from(&config.backend),
//!     stream: config.stream.clone(),
//!     ..FollowOptions::new("session-id")
//! };
//! let (summary, _session) = swarmtrace_core::follow(
//!     client.clone(),
//!     Some(&client),
//!     &db,
//!     options,
//!     CancellationToken::new(),
//!     |_, _| {},
//! )
//! .await?;
//! println!("{}", summary.outcome);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use backend::{BackendClient, PollResponse, StreamBackend};
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use store::{MemoryStateStore, MessageSink, SessionStore, StateStore, StoreChange};
pub use stream::{follow, FollowOptions, FollowSummary, PollConfig, PollOutcome, PollingDriver, StreamSession};
pub use types::*;

// Public modules
pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod store;
pub mod stream;
pub mod types;
