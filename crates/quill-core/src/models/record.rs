//! Record kinds and the syncable record contract

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::UserId;

/// Kind of record held by the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Note,
    Folder,
    User,
}

impl RecordKind {
    /// Stable storage tag for this kind
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Folder => "folder",
            Self::User => "user",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" => Ok(Self::Note),
            "folder" => Ok(Self::Folder),
            "user" => Ok(Self::User),
            other => Err(format!("unknown record kind '{other}'")),
        }
    }
}

/// A record that is created and mutated through the local store and replicated
/// to the owner's partition of the remote replica.
///
/// The store owns `updated_at` and `revision`; callers never set them directly.
pub trait SyncRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    /// Fields that exist only on this device and are stripped before replication.
    const LOCAL_ONLY_FIELDS: &'static [&'static str] = &["revision"];

    fn record_id(&self) -> String;
    fn owner_id(&self) -> UserId;
    fn updated_at(&self) -> i64;
    fn revision(&self) -> u64;
    fn stamp(&mut self, updated_at: i64, revision: u64);

    /// Carry device-local state over when a remote version replaces `local`.
    fn keep_local_state(&mut self, _local: &Self) {}

    /// Document body as stored in the remote replica.
    fn to_document(&self) -> serde_json::Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            for field in Self::LOCAL_ONLY_FIELDS {
                object.remove(*field);
            }
        }
        Ok(value)
    }
}
