//! Request Context
//!
//! Context carried through every transaction and query.
//! Contains caller metadata, the internal flag and a cancel token.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{DbError, DbResult};

/// Context carried through the execution pipeline
#[derive(Debug, Clone)]
pub struct Context {
    /// Request ID for tracing
    pub request_id: Uuid,

    /// Caller metadata, recorded on commands and change records
    pub metadata: BTreeMap<String, Value>,

    /// Internal contexts bypass authorization, read-only and lock checks
    internal: bool,

    cancel: CancelToken,

    started_at: Instant,
}

impl Context {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            metadata: BTreeMap::new(),
            internal: false,
            cancel: CancelToken::new(),
            started_at: Instant::now(),
        }
    }

    /// Context used by the engine for its own writes
    pub fn internal() -> Self {
        Self::new().as_internal()
    }

    pub fn as_internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Add caller metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    /// Shares `token` so cancelling it stops work under this context
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with `Cancelled` once the token fired
    pub fn check_cancelled(&self) -> DbResult<()> {
        if self.is_cancelled() {
            Err(DbError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Get elapsed time in microseconds
    pub fn elapsed_micros(&self) -> u128 {
        self.started_at.elapsed().as_micros()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
