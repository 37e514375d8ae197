//! # Key-Value Errors

use thiserror::Error;

/// Result type for key-value adapter operations
pub type KvResult<T> = Result<T, KvError>;

/// Errors raised by a key-value adapter
#[derive(Debug, Clone, Error)]
pub enum KvError {
    /// Store has been closed
    #[error("Store is closed")]
    Closed,

    /// Write attempted in a read-only transaction
    #[error("Transaction is read-only")]
    ReadOnly,

    /// Transaction already committed or rolled back
    #[error("Transaction already finished")]
    Finished,

    /// Timed out waiting for the writer slot
    #[error("Store is busy")]
    Busy,

    /// Lock bookkeeping failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// Backend-specific failure
    #[error("Backend error: {0}")]
    Backend(String),
}
