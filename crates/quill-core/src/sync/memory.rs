//! In-process remote replica
//!
//! Implements the full [`RemoteReplica`] contract over plain maps. The CLI
//! persists it as a JSON snapshot between runs, and tests use its offline
//! switch and call counters for fault injection.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::models::{RecordKind, UserId};
use crate::sync::remote::{
    ChangeCursor, ChangePage, DocKey, DocWrite, Precondition, PushOutcome, Rejection,
    RemoteChange, RemoteError, RemoteRecord, RemoteReplica, VersionedDoc,
};
use crate::sync::resolver::Stamp;

/// Largest accepted document body, in bytes of JSON
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 1024 * 1024;

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ReplicaState {
    /// Last sequence number handed out, across all partitions
    seq: ChangeCursor,
    /// owner id -> "kind/id" -> latest change
    partitions: BTreeMap<String, BTreeMap<String, RemoteChange>>,
    /// "collection/id" -> document
    documents: BTreeMap<String, StoredDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDoc {
    key: DocKey,
    version: u64,
    data: Value,
}

pub struct MemoryReplica {
    state: Mutex<ReplicaState>,
    notices: Mutex<HashMap<UserId, broadcast::Sender<ChangeCursor>>>,
    online: AtomicBool,
    max_document_bytes: usize,
    put_batch_calls: AtomicUsize,
    commit_calls: AtomicUsize,
}

impl Default for MemoryReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReplica {
    pub fn new() -> Self {
        Self::from_state(ReplicaState::default())
    }

    fn from_state(state: ReplicaState) -> Self {
        Self {
            state: Mutex::new(state),
            notices: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            put_batch_calls: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn with_max_document_bytes(mut self, max: usize) -> Self {
        self.max_document_bytes = max;
        self
    }

    /// Load a replica snapshot; a missing file yields an empty replica.
    pub fn load_snapshot(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)?;
        let state: ReplicaState = serde_json::from_str(&raw)?;
        tracing::debug!(
            path = %path.display(),
            documents = state.documents.len(),
            "Loaded replica snapshot"
        );
        Ok(Self::from_state(state))
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_string_pretty(&*self.state.lock())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, payload)?;
        Ok(())
    }

    /// Simulate losing or regaining the network
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn put_batch_calls(&self) -> usize {
        self.put_batch_calls.load(Ordering::SeqCst)
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Latest stored version of one replicated record
    pub fn record(&self, owner_id: UserId, kind: RecordKind, id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .partitions
            .get(&owner_id.as_str())
            .and_then(|partition| partition.get(&record_key(kind, id)))
            .map(|change| change.record.clone())
    }

    /// Every live record in `owner_id`'s partition
    pub fn live_records(&self, owner_id: UserId) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .partitions
            .get(&owner_id.as_str())
            .map(|partition| {
                partition
                    .values()
                    .filter(|change| !change.record.deleted)
                    .map(|change| change.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn document(&self, key: &DocKey) -> Option<VersionedDoc> {
        self.state
            .lock()
            .documents
            .get(&key.to_string())
            .map(|doc| VersionedDoc {
                version: doc.version,
                data: doc.data.clone(),
            })
    }

    fn ensure_online(&self) -> std::result::Result<(), RemoteError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("replica offline".to_string()))
        }
    }

    fn validate(&self, record: &RemoteRecord, owner_id: UserId) -> Option<String> {
        if record.owner_id != owner_id {
            return Some("record belongs to another owner".to_string());
        }
        if record.deleted {
            return None;
        }
        if !record.document.is_object() {
            return Some("document must be an object".to_string());
        }
        let size = serde_json::to_vec(&record.document).map_or(usize::MAX, |bytes| bytes.len());
        (size > self.max_document_bytes)
            .then(|| format!("document is {size} bytes, limit is {}", self.max_document_bytes))
    }

    fn notify(&self, owner_id: UserId, cursor: ChangeCursor) {
        if let Some(sender) = self.notices.lock().get(&owner_id) {
            // No live listeners is fine
            let _ = sender.send(cursor);
        }
    }
}

fn record_key(kind: RecordKind, id: &str) -> String {
    format!("{kind}/{id}")
}

#[async_trait]
impl RemoteReplica for MemoryReplica {
    async fn put_batch(
        &self,
        owner_id: UserId,
        records: Vec<RemoteRecord>,
    ) -> std::result::Result<PushOutcome, RemoteError> {
        self.put_batch_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.ensure_online()?;

        let mut rejected = Vec::new();
        let mut written = false;
        let cursor = {
            let mut state = self.state.lock();
            for record in records {
                if let Some(reason) = self.validate(&record, owner_id) {
                    rejected.push(Rejection {
                        kind: record.kind,
                        id: record.id,
                        reason,
                    });
                    continue;
                }

                let key = record_key(record.kind, &record.id);
                let stale = state
                    .partitions
                    .get(&owner_id.as_str())
                    .and_then(|partition| partition.get(&key))
                    .is_some_and(|existing| {
                        Stamp::new(existing.record.updated_at, &existing.record.id)
                            .supersedes(&Stamp::new(record.updated_at, &record.id))
                    });
                if stale {
                    tracing::debug!(kind = %record.kind, id = %record.id, "Ignoring older write");
                    continue;
                }

                state.seq += 1;
                let seq = state.seq;
                state
                    .partitions
                    .entry(owner_id.as_str())
                    .or_default()
                    .insert(key, RemoteChange { seq, record });
                written = true;
            }
            state.seq
        };

        if written {
            self.notify(owner_id, cursor);
        }
        Ok(PushOutcome { rejected })
    }

    async fn query_changed_since(
        &self,
        owner_id: UserId,
        cursor: ChangeCursor,
        limit: usize,
    ) -> std::result::Result<ChangePage, RemoteError> {
        tokio::task::yield_now().await;
        self.ensure_online()?;

        let state = self.state.lock();
        let mut newer: Vec<RemoteChange> = state
            .partitions
            .get(&owner_id.as_str())
            .map(|partition| {
                partition
                    .values()
                    .filter(|change| change.seq > cursor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        newer.sort_by_key(|change| change.seq);

        let has_more = newer.len() > limit;
        newer.truncate(limit);
        let next_cursor = newer.last().map_or(cursor, |change| change.seq);
        Ok(ChangePage {
            changes: newer,
            cursor: next_cursor,
            has_more,
        })
    }

    async fn get_documents(
        &self,
        keys: &[DocKey],
    ) -> std::result::Result<Vec<Option<VersionedDoc>>, RemoteError> {
        tokio::task::yield_now().await;
        self.ensure_online()?;

        let state = self.state.lock();
        Ok(keys
            .iter()
            .map(|key| {
                state.documents.get(&key.to_string()).map(|doc| VersionedDoc {
                    version: doc.version,
                    data: doc.data.clone(),
                })
            })
            .collect())
    }

    async fn find_documents(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> std::result::Result<Vec<(DocKey, VersionedDoc)>, RemoteError> {
        tokio::task::yield_now().await;
        self.ensure_online()?;

        let state = self.state.lock();
        Ok(state
            .documents
            .values()
            .filter(|doc| doc.key.collection == collection && doc.data.get(field) == Some(value))
            .map(|doc| {
                (
                    doc.key.clone(),
                    VersionedDoc {
                        version: doc.version,
                        data: doc.data.clone(),
                    },
                )
            })
            .collect())
    }

    async fn commit(
        &self,
        preconditions: Vec<Precondition>,
        writes: Vec<DocWrite>,
    ) -> std::result::Result<(), RemoteError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.ensure_online()?;

        for write in &writes {
            let size = serde_json::to_vec(&write.data).map_or(usize::MAX, |bytes| bytes.len());
            if size > self.max_document_bytes {
                return Err(RemoteError::Rejected(format!(
                    "{} is {size} bytes, limit is {}",
                    write.key, self.max_document_bytes
                )));
            }
        }

        let mut state = self.state.lock();
        let holds = preconditions.iter().all(|condition| {
            state
                .documents
                .get(&condition.key.to_string())
                .map(|doc| doc.version)
                == condition.version
        });
        if !holds {
            return Err(RemoteError::Conflict);
        }

        for write in writes {
            let address = write.key.to_string();
            let version = state.documents.get(&address).map_or(1, |doc| doc.version + 1);
            state.documents.insert(
                address,
                StoredDoc {
                    key: write.key,
                    version,
                    data: write.data,
                },
            );
        }
        Ok(())
    }

    fn listen(&self, owner_id: UserId) -> Option<broadcast::Receiver<ChangeCursor>> {
        let mut notices = self.notices.lock();
        let sender = notices
            .entry(owner_id)
            .or_insert_with(|| broadcast::channel(NOTICE_CAPACITY).0);
        Some(sender.subscribe())
    }
}
