use crate::compress::CompressionError;

/// Errors surfaced by a storage driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("unreadable entry {key:?}: {reason}")]
    Malformed { key: String, reason: String },
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Errors from the persist/load pipeline and the hydration controller.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("no persisted value for {key:?}")]
    NotFound { key: String },
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("corrupt payload for {key:?}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("chunk {index} of {key:?} is missing")]
    MissingChunk { key: String, index: usize },
    #[error("{count} chunks exceeds the limit of {max}")]
    TooManyChunks { count: usize, max: usize },
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),
    #[error("background task for {key:?} did not complete: {reason}")]
    Task { key: String, reason: String },
    #[error("fire-and-forget persist needs a running tokio runtime")]
    NoRuntime,
}

impl PersistError {
    pub(crate) fn corrupt(key: &str, reason: impl Into<String>) -> Self {
        PersistError::Corrupt {
            key: key.to_owned(),
            reason: reason.into(),
        }
    }
}
