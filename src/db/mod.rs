//! Database facade

mod database;

pub(crate) use database::DbInner;
pub use database::{Database, SCHEMA_KIND};
