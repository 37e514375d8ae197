//! Transactions and the persist engine
//!
//! Commands mutate documents inside a [`Transaction`]; each one keeps every
//! index consistent, enforces unique and foreign key constraints and stages
//! a change record.

mod command;
mod persist;
mod transaction;

pub use command::{Action, Command};
pub use transaction::{Transaction, TxState};
