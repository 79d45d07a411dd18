use chronostate_common::{Path, Value};
use serde::{Deserialize, Serialize};

/// A single structural edit addressed by path.
///
/// Paths serialize in their encoded string form, so decoding a patch with a
/// malformed path fails before anything is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Replace or create the node at `path`.
    Set { path: Path, value: Value },
    /// Remove the node at `path`.
    Delete { path: Path },
    /// Edit the sequence at `path`: remove `delete_count` items at `index`,
    /// then insert `insert` there.
    Splice {
        path: Path,
        index: usize,
        delete_count: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        insert: Vec<Value>,
    },
    /// Overwrite `data.len()` bytes of the blob at `path`, starting at `offset`.
    BinaryChunk {
        path: Path,
        offset: usize,
        data: Vec<u8>,
    },
}

/// An ordered list of ops, applied as a left fold.
pub type Patch = Vec<PatchOp>;

impl PatchOp {
    pub fn set(path: Path, value: impl Into<Value>) -> Self {
        PatchOp::Set {
            path,
            value: value.into(),
        }
    }

    pub fn delete(path: Path) -> Self {
        PatchOp::Delete { path }
    }

    /// The location this op edits.
    pub fn path(&self) -> &Path {
        match self {
            PatchOp::Set { path, .. }
            | PatchOp::Delete { path }
            | PatchOp::Splice { path, .. }
            | PatchOp::BinaryChunk { path, .. } => path,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            PatchOp::Set { .. } => "set",
            PatchOp::Delete { .. } => "delete",
            PatchOp::Splice { .. } => "splice",
            PatchOp::BinaryChunk { .. } => "binary_chunk",
        }
    }
}
