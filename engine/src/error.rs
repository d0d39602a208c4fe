//! Error types for the Till engine.

use crate::{Adapter, DocId, Revision};
use thiserror::Error;

/// All possible errors from the document store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("field '{field}' must be one of [{allowed}], got {got}")]
    NotAllowed {
        field: String,
        allowed: String,
        got: String,
    },

    #[error("invalid revision token: {0}")]
    InvalidRevision(String),

    #[error("unknown storage adapter: {0}")]
    UnknownAdapter(String),

    #[error("invalid store name: {0:?}")]
    InvalidName(String),

    // Write errors
    #[error("document not found: {0}")]
    DocumentNotFound(DocId),

    #[error("document update conflict on {id}: expected {}, current {}", fmt_rev(.expected), fmt_rev(.actual))]
    RevisionConflict {
        id: DocId,
        expected: Option<Revision>,
        actual: Option<Revision>,
    },

    // Storage errors
    #[error("storage quota exceeded for '{name}': limit is {limit} documents")]
    QuotaExceeded { name: String, limit: usize },

    #[error("adapter '{0}' does not support purge")]
    PurgeUnsupported(Adapter),

    #[error("store '{0}' has been destroyed")]
    Destroyed(String),
}

fn fmt_rev(rev: &Option<Revision>) -> String {
    rev.as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

impl Error {
    /// True for errors raised by body validation, before the store is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidDocument(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
                | Error::NotAllowed { .. }
                | Error::InvalidRevision(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
