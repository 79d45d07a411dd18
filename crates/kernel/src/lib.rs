//! Engine kernel: the single writer that ties persisted atoms, the event log
//! and reconstruction together.
//!
//! # Invariants
//! - Every mutation goes through the engine and is logged as exactly one event.
//! - The in-memory atom value is authoritative; storage follows it.
//! - Hydration, persistence and the event mirror share one storage driver.

pub mod config;
pub mod engine;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineError};

pub fn crate_info() -> &'static str {
    "chronostate-kernel v0.1.0"
}
