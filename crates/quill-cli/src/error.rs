use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] quill_core::Error),
    #[error(transparent)]
    Start(#[from] quill_core::StartError),
    #[error(transparent)]
    Ledger(#[from] quill_core::LedgerError),
    #[error(transparent)]
    Sync(#[from] quill_core::SyncError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No note content provided")]
    EmptyContent,
    #[error("Folder name cannot be empty")]
    EmptyFolderName,
    #[error("ID cannot be empty")]
    EmptyId,
    #[error("{kind} not found for id/prefix: {query}")]
    NotFound { kind: &'static str, query: String },
    #[error("{0}")]
    AmbiguousId(String),
    #[error("Referral ledger mismatch: {credits} credits stored, {expected} expected")]
    LedgerMismatch { credits: u64, expected: u64 },
}
