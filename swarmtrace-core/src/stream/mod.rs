//! Live stream processing
//!
//! Data flows through these stages for every followed session:
//! - [`poller`]: fetches chunk batches from the backend
//! - [`session`]: applies batches to the store in arrival order
//! - [`buffer`]: coalesces text deltas per agent before they hit messages
//! - [`extract`]: finds activity markers in agent text
//! - [`timeline`]: turns chunks and markers into deduplicated events
//!
//! [`follow()`] runs all of it for one session.

pub mod buffer;
pub mod extract;
pub mod follow;
pub mod poller;
pub mod session;
pub mod timeline;

pub use buffer::{Flush, TokenBuffer};
pub use extract::{Activity, ActivityExtractor, ActivityKind, MarkerExtractor};
pub use follow::{follow, FollowOptions, FollowSummary};
pub use poller::{PollConfig, PollOutcome, PollReport, PollingDriver};
pub use session::StreamSession;
pub use timeline::{KeyedEvent, TimelineBuilder, TimelineChange, TimelineLog};
