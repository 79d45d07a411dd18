use chronostate_common::{Path, PathSegment, Value};

use crate::op::PatchOp;

/// Errors from applying a patch. Any error aborts the whole `apply` call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("no node at {path:?}")]
    PathNotFound { path: String },
    #[error("{op} at {path:?} expects a {expected}, found {found}")]
    TypeMismatch {
        op: &'static str,
        path: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("{op} at {path:?} is out of range: {position} > {len}")]
    OutOfRange {
        op: &'static str,
        path: String,
        position: usize,
        len: usize,
    },
}

/// Apply `ops` in order to a copy of `value`.
///
/// Each op sees the result of the previous one. The caller's value is never
/// modified; on error the partially edited copy is dropped, so the caller
/// still holds the last known-good value.
pub fn apply(value: &Value, ops: &[PatchOp]) -> Result<Value, PatchError> {
    let mut working = value.clone();
    for (position, op) in ops.iter().enumerate() {
        if let Err(err) = apply_in_place(&mut working, op) {
            tracing::debug!(position, op = op.kind_name(), path = %op.path(), %err, "patch aborted");
            return Err(err);
        }
    }
    Ok(working)
}

/// Apply a single op to a copy of `value`.
pub fn apply_op(value: &Value, op: &PatchOp) -> Result<Value, PatchError> {
    apply(value, std::slice::from_ref(op))
}

fn apply_in_place(root: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    match op {
        PatchOp::Set { path, value } => {
            let Some((parent, last)) = path.split_last() else {
                *root = value.clone();
                return Ok(());
            };
            match (resolve_mut(root, parent, path)?, last) {
                (Value::Map(entries), PathSegment::Key(key)) => {
                    entries.insert(key.clone(), value.clone());
                }
                (Value::List(items), PathSegment::Index(index)) => {
                    let len = items.len();
                    if *index < len {
                        items[*index] = value.clone();
                    } else if *index == len {
                        items.push(value.clone());
                    } else {
                        return Err(out_of_range("set", path, *index, len));
                    }
                }
                (container, segment) => return Err(mismatch("set", path, container_for(segment), container)),
            }
        }
        PatchOp::Delete { path } => {
            let Some((parent, last)) = path.split_last() else {
                *root = Value::Null;
                return Ok(());
            };
            match (resolve_mut(root, parent, path)?, last) {
                (Value::Map(entries), PathSegment::Key(key)) => {
                    entries.remove(key);
                }
                (Value::List(items), PathSegment::Index(index)) => {
                    if *index >= items.len() {
                        return Err(out_of_range("delete", path, *index, items.len()));
                    }
                    items.remove(*index);
                }
                (container, segment) => {
                    return Err(mismatch("delete", path, container_for(segment), container));
                }
            }
        }
        PatchOp::Splice {
            path,
            index,
            delete_count,
            insert,
        } => match resolve_mut(root, path.segments(), path)? {
            Value::List(items) => {
                let len = items.len();
                if *index > len {
                    return Err(out_of_range("splice", path, *index, len));
                }
                let end = index.saturating_add(*delete_count).min(len);
                items.splice(*index..end, insert.iter().cloned());
            }
            other => return Err(mismatch("splice", path, "list", other)),
        },
        PatchOp::BinaryChunk { path, offset, data } => match resolve_mut(root, path.segments(), path)? {
            Value::Bytes(blob) => {
                let len = blob.len();
                let end = offset.saturating_add(data.len());
                if end > len {
                    return Err(out_of_range("binary_chunk", path, end, len));
                }
                blob[*offset..end].copy_from_slice(data);
            }
            other => return Err(mismatch("binary_chunk", path, "bytes", other)),
        },
    }
    Ok(())
}

fn resolve_mut<'a>(
    root: &'a mut Value,
    segments: &[PathSegment],
    full: &Path,
) -> Result<&'a mut Value, PatchError> {
    let mut node = root;
    for segment in segments {
        node = match node.child_mut(segment) {
            Some(child) => child,
            None => {
                return Err(PatchError::PathNotFound {
                    path: full.encode(),
                });
            }
        };
    }
    Ok(node)
}

fn container_for(segment: &PathSegment) -> &'static str {
    match segment {
        PathSegment::Key(_) => "map",
        PathSegment::Index(_) => "list",
    }
}

fn mismatch(op: &'static str, path: &Path, expected: &'static str, found: &Value) -> PatchError {
    PatchError::TypeMismatch {
        op,
        path: path.encode(),
        expected,
        found: found.type_name(),
    }
}

fn out_of_range(op: &'static str, path: &Path, position: usize, len: usize) -> PatchError {
    PatchError::OutOfRange {
        op,
        path: path.encode(),
        position,
        len,
    }
}
