//! Patch engine: structural diff of two value trees into path-addressed
//! operations, and immutable application of such operations.
//!
//! # Invariants
//! - `apply(a, diff(a, b)) == b` for all values.
//! - `diff` is a deterministic linear walk, not a minimal edit script.
//! - `apply` is all-or-nothing: a failing op leaves the caller's value untouched.

mod apply;
mod diff;
mod op;

pub use apply::{PatchError, apply, apply_op};
pub use diff::{DiffOptions, diff, diff_with};
pub use op::{Patch, PatchOp};

pub fn crate_info() -> &'static str {
    "chronostate-patch v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("patch"));
    }
}
