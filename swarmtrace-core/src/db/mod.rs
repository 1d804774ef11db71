//! Database layer for swarmtrace
//!
//! SQLite storage for per-session client state with:
//! - Schema migrations
//! - Repository methods for resume cursors, agent rosters and message marks

pub mod repo;
pub mod schema;

pub use repo::{Database, SessionRecord};
