//! Unified error handling for the data layer.

use serde::Serialize;
use std::fmt;
use till_engine::DocId;

use crate::config::ConfigError;

/// Why a write was rejected as conflicting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ConflictKind {
    /// Another record already holds a value that must be unique
    Duplicate { field: String, value: String },
    /// The revision sent with the write is not the current one
    StaleRevision { id: DocId },
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::Duplicate { field, value } => {
                write!(f, "{field} \"{value}\" is already taken")
            }
            ConflictKind::StaleRevision { id } => write!(f, "{id} was changed since it was read"),
        }
    }
}

/// How a replication failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicationErrorKind {
    /// Network blip or unavailable remote; safe to retry
    Transient,
    /// Credentials rejected (401)
    Unauthorized,
    /// Credentials valid but access refused (403)
    Forbidden,
}

/// A replication failure reported by the remote or the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind:?} replication error: {message}")]
#[serde(rename_all = "camelCase")]
pub struct ReplicationError {
    pub kind: ReplicationErrorKind,
    pub message: String,
}

impl ReplicationError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ReplicationErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            kind: ReplicationErrorKind::Unauthorized,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            kind: ReplicationErrorKind::Forbidden,
            message: message.into(),
        }
    }

    /// Authorization failures are escalated, never retried.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.kind,
            ReplicationErrorKind::Unauthorized | ReplicationErrorKind::Forbidden
        )
    }
}

/// Data layer error type.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(ConflictKind),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error("Sync is disabled for {0}")]
    SyncDisabled(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DataError {
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DataError::Conflict(ConflictKind::Duplicate {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DataError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DataError::NotFound(_))
    }

    /// Message suitable for showing to the person at the till.
    pub fn user_message(&self) -> String {
        match self {
            DataError::Validation(msg) => format!("Please check the form: {msg}"),
            DataError::Conflict(ConflictKind::Duplicate { field, value }) => {
                format!("A record with {field} \"{value}\" already exists")
            }
            DataError::Conflict(ConflictKind::StaleRevision { .. }) => {
                "This record was changed elsewhere. Reload it and try again".to_string()
            }
            DataError::NotFound(_) => "Record not found".to_string(),
            DataError::Replication(e) if e.is_auth_failure() => {
                "Your session has expired. Please reconnect".to_string()
            }
            DataError::SyncDisabled(_) => "Sync is turned off on this device".to_string(),
            DataError::Storage(_) | DataError::Replication(_) | DataError::Config(_) => {
                "Something went wrong. Please try again or check the sync status".to_string()
            }
        }
    }
}

impl From<till_engine::Error> for DataError {
    fn from(err: till_engine::Error) -> Self {
        use till_engine::Error as E;
        match err {
            e if e.is_validation() => DataError::Validation(e.to_string()),
            E::RevisionConflict { id, .. } => DataError::Conflict(ConflictKind::StaleRevision { id }),
            E::DocumentNotFound(id) => DataError::NotFound(id),
            e => DataError::Storage(e.to_string()),
        }
    }
}

/// Result type alias for data layer calls.
pub type Result<T> = std::result::Result<T, DataError>;
