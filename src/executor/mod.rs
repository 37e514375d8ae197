//! Query execution
//!
//! The engine drives an index scan chosen by the optimizer, then joins,
//! filters, aggregates, sorts and paginates in memory.

mod aggregate;
mod executor;
mod result;
mod sorter;

pub use aggregate::{aggregate, group_by, reduce};
pub use executor::QueryEngine;
pub use result::{Page, PageStats};
pub use sorter::ResultSorter;
