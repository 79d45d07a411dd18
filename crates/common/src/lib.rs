//! Shared types: the nested `Value` tree and `Path` addressing into it.
//!
//! # Invariants
//! - `Path::decode(&p.encode()) == Ok(p)` for every path.
//! - Map iteration order is the key order, so anything walking a `Value` is deterministic.

mod path;
mod value;

pub use path::{Path, PathError, PathSegment};
pub use value::Value;

pub fn crate_info() -> &'static str {
    "chronostate-common v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("common"));
    }
}
