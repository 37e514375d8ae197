//! Error Types
//!
//! Unified error handling for documents, indexes, transactions and queries.
//! Every variant maps onto an [`ErrorKind`] so callers can branch on the
//! category without matching individual variants.

use serde::Serialize;
use thiserror::Error;

use crate::kv::KvError;

/// Crate result type
pub type DbResult<T> = Result<T, DbError>;

/// Error categories callers are expected to branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad query or command shape, schema violation
    Validation,
    /// Missing document or collection
    NotFound,
    /// Authorization denial or locked collection
    Forbidden,
    /// Write conflicts with existing state
    Conflict,
    /// Duplicate value on a unique index
    UniqueConstraintViolation,
    /// Referenced document does not exist
    ForeignKeyViolation,
    /// Storage or encoding failure
    Internal,
    /// The caller cancelled the operation
    Cancelled,
}

/// Database error
#[derive(Debug, Clone, Error)]
pub enum DbError {
    // ==================
    // Validation Errors
    // ==================
    /// Invalid document, schema, query or command
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown where operator
    #[error("Invalid operator: '{0}'")]
    InvalidOperator(String),

    /// Operation attempted on a committed or rolled back transaction
    #[error("Transaction is already {0}")]
    TransactionClosed(&'static str),

    // ==================
    // Lookup Errors
    // ==================
    /// Collection is not registered
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// Document does not exist
    #[error("Document not found: {collection}/{id}")]
    DocumentNotFound { collection: String, id: String },

    // ==================
    // Access Errors
    // ==================
    /// Authorization hook denied the command
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Collection is locked for index maintenance
    #[error("Collection is locked: {0}")]
    CollectionLocked(String),

    // ==================
    // Constraint Errors
    // ==================
    /// Document already exists
    #[error("Document already exists: {collection}/{id}")]
    AlreadyExists { collection: String, id: String },

    /// Another document holds the same unique index value
    #[error("Unique constraint violation on {collection}.{index}: value held by document {existing_id}")]
    UniqueConstraintViolation {
        collection: String,
        index: String,
        existing_id: String,
    },

    /// Referenced document is missing
    #[error("Foreign key violation on {collection}.{field}: {target_collection}/{target_id} does not exist")]
    ForeignKeyViolation {
        collection: String,
        field: String,
        target_collection: String,
        target_id: String,
    },

    // ==================
    // Internal Errors
    // ==================
    /// Key-value adapter failure
    #[error("Storage error: {0}")]
    Storage(#[from] KvError),

    /// Serialization or key decoding failure
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Invariant broken inside the engine
    #[error("Internal error: {0}")]
    Internal(String),

    /// Cancelled through the request context
    #[error("Operation cancelled")]
    Cancelled,
}

impl DbError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a document not found error
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::DocumentNotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidOperator(_) | Self::TransactionClosed(_) => {
                ErrorKind::Validation
            }
            Self::UnknownCollection(_) | Self::DocumentNotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden(_) | Self::CollectionLocked(_) => ErrorKind::Forbidden,
            Self::AlreadyExists { .. } => ErrorKind::Conflict,
            Self::UniqueConstraintViolation { .. } => ErrorKind::UniqueConstraintViolation,
            Self::ForeignKeyViolation { .. } => ErrorKind::ForeignKeyViolation,
            Self::Storage(_) | Self::Encoding(_) | Self::Internal(_) => ErrorKind::Internal,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidOperator(_) => "INVALID_OPERATOR",
            Self::TransactionClosed(_) => "TRANSACTION_CLOSED",
            Self::UnknownCollection(_) => "UNKNOWN_COLLECTION",
            Self::DocumentNotFound { .. } => "DOCUMENT_NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::CollectionLocked(_) => "COLLECTION_LOCKED",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::UniqueConstraintViolation { .. } => "UNIQUE_CONSTRAINT_VIOLATION",
            Self::ForeignKeyViolation { .. } => "FOREIGN_KEY_VIOLATION",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Encoding(_) => "ENCODING_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Shorthand for `kind() == ErrorKind::NotFound`
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

impl From<regex::Error> for DbError {
    fn from(e: regex::Error) -> Self {
        Self::Validation(format!("invalid regular expression: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(DbError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(
            DbError::InvalidOperator("like".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(DbError::not_found("user", "1").kind(), ErrorKind::NotFound);
        assert_eq!(
            DbError::UnknownCollection("nope".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            DbError::CollectionLocked("user".into()).kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(DbError::internal("boom").kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_codes_and_retry() {
        let err = DbError::UniqueConstraintViolation {
            collection: "user".into(),
            index: "email_idx".into(),
            existing_id: "1".into(),
        };
        assert_eq!(err.code(), "UNIQUE_CONSTRAINT_VIOLATION");
        assert!(!err.is_retryable());

        let err: DbError = KvError::Closed.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = DbError::not_found("user", "42");
        assert_eq!(err.to_string(), "Document not found: user/42");
    }
}
