use chronostate_patch::PatchError;
use chronostate_persist::DriverError;

#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("event stream out of order: expected seq {expected}, found {found}")]
    OutOfOrder { expected: u64, found: u64 },
    #[error("corrupt timeline entry {key:?}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("replaying seq {seq} for {key:?} failed: {source}")]
    Replay {
        seq: u64,
        key: String,
        #[source]
        source: PatchError,
    },
}
