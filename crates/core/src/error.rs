//! Backend error taxonomy
//!
//! Errors surfaced by the storage backend are classified so callers can
//! tell "retry with a fresh fork" apart from "this request is invalid" and
//! from infrastructure failures that must propagate uninterpreted.

use crate::path::PathKey;
use thiserror::Error;

/// Result alias for operations crossing the storage-dialect port.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// An error reported by the storage backend, pre-classified.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A transient condition (e.g. a serialization failure reported by the
    /// SQL engine). The caller may retry the whole transaction.
    #[error("transient backend conflict: {0}")]
    Transient(String),

    /// The user's request violates a backend constraint and will never
    /// succeed as written.
    #[error("backend rejected the request: {0}")]
    UserError(String),

    /// An unclassified infrastructure failure; propagated uninterpreted.
    #[error("backend failure: {0}")]
    Internal(String),
}

impl BackendError {
    /// Whether the failed operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Raised when row ids are requested for a doc part that is not present in
/// the committed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown doc part {database}.{collection}.{path}")]
pub struct UnknownDocPart {
    /// Database name
    pub database: String,
    /// Collection name
    pub collection: String,
    /// Doc part path key
    pub path: PathKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(BackendError::Transient("deadlock".into()).is_retryable());
        assert!(!BackendError::UserError("duplicate key".into()).is_retryable());
        assert!(!BackendError::Internal("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_unknown_doc_part_display() {
        let err = UnknownDocPart {
            database: "db".into(),
            collection: "col".into(),
            path: PathKey::root().child("tags"),
        };
        assert_eq!(err.to_string(), "unknown doc part db.col.tags");
    }
}
