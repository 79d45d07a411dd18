use chronostate_patch::PatchError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("no reducer registered for {0:?}")]
    UnknownReducer(String),
    #[error("reducer {action:?} failed: {reason}")]
    Reducer { action: String, reason: String },
    #[error("delta version gap: expected {expected}, got {found}")]
    VersionGap { expected: u64, found: u64 },
    #[error("delta did not apply to the mirror: {0}")]
    Patch(#[from] PatchError),
    #[error("worker task is gone")]
    WorkerGone,
}
