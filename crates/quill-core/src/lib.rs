//! quill-core - Core library for Quill
//!
//! This crate contains the local-first engine behind every Quill interface:
//! the device-local store with its change tracker, the background sync
//! scheduler and conflict resolver, the durable anonymous identity, and the
//! referral credit ledger.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod models;
pub mod referral;
pub mod store;
pub mod sync;
pub mod util;

pub use client::{Client, StartError};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use identity::{Identity, IdentityError, IdentityProvider, IdentitySource};
pub use models::{Folder, FolderId, Note, NoteId, ReferralEvent, User, UserId};
pub use referral::{AwardOutcome, LedgerAudit, LedgerError, ReferralLedger};
pub use store::{ApplyOutcome, LocalStore};
pub use sync::{
    ConnectivityMonitor, MemoryReplica, RemoteReplica, SyncError, SyncHandle, SyncPhase,
    SyncReport, SyncScheduler, SyncStatus, SyncWarning,
};
