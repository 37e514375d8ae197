//! Document model
//!
//! JSON objects with dotted-path access, flattening, structural diffs and
//! predicate evaluation.

mod diff;
mod document;
mod filter;
pub mod path;

pub use diff::{apply as apply_changes, diff, FieldChange, PatchOp};
pub use document::{value_to_key, Document};
pub use filter::{
    compare_values, matches_all, resolve, to_f64, values_equal, Where, WhereOp, SELF_REF_PREFIX,
};
