//! Per-record sync bookkeeping

use serde::{Deserialize, Serialize};

use super::RecordKind;

/// Sync state kept beside every replicated record. Never user-visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub kind: RecordKind,
    pub record_id: String,
    /// Record has mutations the remote replica has not acknowledged
    pub dirty: bool,
    pub last_synced_revision: u64,
    /// Last time the record was drained into a push batch (Unix ms)
    pub last_push_attempt_at: Option<i64>,
    pub push_failure_count: u32,
}
