//! Worker synchronization: a background task owns the authoritative state
//! and answers each dispatched action with a minimal patch delta.
//!
//! # Invariants
//! - Delta versions increase by exactly one per successful dispatch.
//! - A handle's mirror equals the worker state at the mirror's version.
//! - A failed reducer leaves the worker state and version untouched.

mod error;
mod registry;
mod worker;

pub use error::SyncError;
pub use registry::{Reducer, ReducerRegistry};
pub use worker::{Delta, WorkerConfig, WorkerHandle, spawn_worker};

pub fn crate_info() -> &'static str {
    "chronostate-sync v0.1.0"
}
