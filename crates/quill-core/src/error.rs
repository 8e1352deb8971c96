//! Error types for quill-core

use thiserror::Error;

use crate::models::RecordKind;

/// Result type alias using quill-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in local store and storage operations
#[derive(Error, Debug)]
pub enum Error {
    /// `SQLite` error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found (or tombstoned)
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of the missing record
        kind: RecordKind,
        /// Identifier that was looked up
        id: String,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A single stored record could not be decoded
    #[error("Corrupted {kind} record {id}: {reason}")]
    Corrupted {
        /// Kind of the unreadable record
        kind: RecordKind,
        /// Identifier of the unreadable record
        id: String,
        /// Decoder message
        reason: String,
    },
}

impl Error {
    pub(crate) fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Returns `true` when this error only concerns one unreadable record.
    pub const fn is_record_local(&self) -> bool {
        matches!(self, Self::Corrupted { .. } | Self::NotFound { .. })
    }
}
