//! Query planning
//!
//! Turns a query's predicates and sort keys into an [`Explain`]: the index
//! to scan plus its bounds. The optimizer is a trait so embedders can swap
//! in their own selection rules.

mod ast;
mod explain;
mod optimizer;

pub use ast::{AggregateFunction, Join, OrderBy, Query, Select, SortDirection, SELECT_ALL};
pub use explain::Explain;
pub use optimizer::{DefaultOptimizer, Optimizer};
