use chronostate_common::{Path, PathSegment, Value};

use crate::op::PatchOp;

/// Knobs for [`diff_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Describe changes between two equal-length blobs as `BinaryChunk`
    /// overwrites of the differing byte ranges instead of one `Set`.
    pub binary_ranges: bool,
}

/// Structural diff with default options.
pub fn diff(old: &Value, new: &Value) -> Vec<PatchOp> {
    diff_with(old, new, DiffOptions::default())
}

/// Structural diff of `old` into `new`.
///
/// Walks both trees once. Equal subtrees emit nothing; a change of kind emits
/// a single `Set` at that node. Sequences are compared index by index, maps
/// key by key in key order. When a sequence shrinks, the `Delete`s for its
/// tail come after the walk in descending index order, so applying the ops
/// front to back never addresses a shifted element.
pub fn diff_with(old: &Value, new: &Value, options: DiffOptions) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    let mut path = Vec::new();
    walk(old, new, &mut path, &mut ops, options);
    tracing::trace!(ops = ops.len(), "diff complete");
    ops
}

fn walk(
    old: &Value,
    new: &Value,
    path: &mut Vec<PathSegment>,
    ops: &mut Vec<PatchOp>,
    options: DiffOptions,
) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::List(old_items), Value::List(new_items)) => {
            let common = old_items.len().min(new_items.len());
            for (index, (a, b)) in old_items.iter().zip(new_items).enumerate() {
                path.push(PathSegment::Index(index));
                walk(a, b, path, ops, options);
                path.pop();
            }
            for (index, item) in new_items.iter().enumerate().skip(common) {
                ops.push(PatchOp::Set {
                    path: at(path, PathSegment::Index(index)),
                    value: item.clone(),
                });
            }
            for index in (common..old_items.len()).rev() {
                ops.push(PatchOp::Delete {
                    path: at(path, PathSegment::Index(index)),
                });
            }
        }
        (Value::Map(old_entries), Value::Map(new_entries)) => {
            for key in old_entries.keys() {
                if !new_entries.contains_key(key) {
                    ops.push(PatchOp::Delete {
                        path: at(path, PathSegment::Key(key.clone())),
                    });
                }
            }
            for (key, value) in new_entries {
                path.push(PathSegment::Key(key.clone()));
                match old_entries.get(key) {
                    Some(previous) => walk(previous, value, path, ops, options),
                    None => ops.push(PatchOp::Set {
                        path: Path::new(path.clone()),
                        value: value.clone(),
                    }),
                }
                path.pop();
            }
        }
        (Value::Bytes(a), Value::Bytes(b)) if options.binary_ranges && a.len() == b.len() => {
            for (offset, data) in differing_ranges(a, b) {
                ops.push(PatchOp::BinaryChunk {
                    path: Path::new(path.clone()),
                    offset,
                    data,
                });
            }
        }
        _ => ops.push(PatchOp::Set {
            path: Path::new(path.clone()),
            value: new.clone(),
        }),
    }
}

fn at(parent: &[PathSegment], segment: PathSegment) -> Path {
    let mut segments = parent.to_vec();
    segments.push(segment);
    Path::new(segments)
}

/// Maximal runs where `a` and `b` differ, as (offset, bytes from `b`).
fn differing_ranges(a: &[u8], b: &[u8]) -> Vec<(usize, Vec<u8>)> {
    let mut ranges = Vec::new();
    let mut start: Option<usize> = None;
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        match (x != y, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                ranges.push((s, b[s..i].to_vec()));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        ranges.push((s, b[s..].to_vec()));
    }
    ranges
}
