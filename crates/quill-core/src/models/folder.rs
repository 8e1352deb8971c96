//! Folder model

use serde::{Deserialize, Serialize};

use super::{FolderId, RecordKind, SyncRecord, UserId};

/// A named container for notes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub owner_id: UserId,
    pub name: String,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    #[serde(default)]
    pub revision: u64,
}

impl Folder {
    /// Create a new folder; surrounding whitespace is trimmed from the name
    #[must_use]
    pub fn new(owner_id: UserId, name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: FolderId::new(),
            owner_id,
            name: name.into().trim().to_string(),
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }
}

impl SyncRecord for Folder {
    const KIND: RecordKind = RecordKind::Folder;

    fn record_id(&self) -> String {
        self.id.as_str()
    }

    fn owner_id(&self) -> UserId {
        self.owner_id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn stamp(&mut self, updated_at: i64, revision: u64) {
        self.updated_at = updated_at;
        self.revision = revision;
    }
}
