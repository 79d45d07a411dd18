//! Event log and state reconstruction.
//!
//! # Invariants
//! - Sequence numbers start at 1 and are strictly increasing with no gaps.
//! - Events and snapshots are immutable once created.
//! - A snapshot is taken exactly when `seq % snapshot_interval == 0`.
//! - Queries and reconstruction see retained in-memory events only; mirrored
//!   events are read back through explicit calls.

mod error;
mod event;
mod log;
mod reconstruct;
mod snapshot;

pub use error::TimelineError;
pub use event::{Event, EventKind, EventType, NewEvent};
pub use log::{EVENT_KEY_PREFIX, EventLog, EventLogConfig, EventQuery, SNAPSHOT_KEY_PREFIX};
pub use reconstruct::{ReconstructOptions, Reconstruction};
pub use snapshot::Snapshot;

pub fn crate_info() -> &'static str {
    "chronostate-timeline v0.1.0"
}
