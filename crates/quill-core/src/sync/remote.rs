//! Remote replica contract
//!
//! The remote store is reached through a narrow document API: batched record
//! writes and change feeds partitioned by owner, plus versioned documents with
//! a compare-and-set commit that [`run_transaction`] turns into a
//! read-modify-write transaction.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::{RecordKind, UserId};
use crate::store::PendingChange;

/// Position in an owner's remote change feed. `0` means "from the beginning".
pub type ChangeCursor = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Remote replica unavailable: {0}")]
    Unavailable(String),
    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transaction precondition failed")]
    Conflict,
    #[error("Remote rejected the write: {0}")]
    Rejected(String),
    #[error("Malformed remote document: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Network-like failures that are retried with backoff
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// A replicated record as stored in the owner's partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub kind: RecordKind,
    pub id: String,
    pub owner_id: UserId,
    pub updated_at: i64,
    pub deleted: bool,
    /// Document body; `Null` for tombstones
    pub document: Value,
}

impl From<&PendingChange> for RemoteRecord {
    fn from(change: &PendingChange) -> Self {
        Self {
            kind: change.kind,
            id: change.id.clone(),
            owner_id: change.owner_id,
            updated_at: change.updated_at,
            deleted: change.deleted,
            document: change.document.clone(),
        }
    }
}

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub seq: ChangeCursor,
    pub record: RemoteRecord,
}

/// A page of the change feed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    /// Cursor to resume from
    pub cursor: ChangeCursor,
    pub has_more: bool,
}

/// A record the remote refused to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RecordKind,
    pub id: String,
    pub reason: String,
}

/// Result of a batched write that reached the remote.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PushOutcome {
    pub rejected: Vec<Rejection>,
}

/// Address of a versioned document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Document body plus the version a commit must match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedDoc {
    pub version: u64,
    pub data: Value,
}

/// Expected state of one document at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub key: DocKey,
    /// `None` requires the document to be absent
    pub version: Option<u64>,
}

/// Full replacement of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocWrite {
    pub key: DocKey,
    pub data: Value,
}

impl DocWrite {
    pub fn encode<T: Serialize>(key: DocKey, value: &T) -> Result<Self, RemoteError> {
        let data =
            serde_json::to_value(value).map_err(|error| RemoteError::Malformed(error.to_string()))?;
        Ok(Self { key, data })
    }
}

/// The remote replicated document store.
#[async_trait]
pub trait RemoteReplica: Send + Sync {
    /// Store records in `owner_id`'s partition.
    ///
    /// `Err` means the batch did not reach the store; per-record validation
    /// failures come back in [`PushOutcome::rejected`].
    async fn put_batch(
        &self,
        owner_id: UserId,
        records: Vec<RemoteRecord>,
    ) -> Result<PushOutcome, RemoteError>;

    /// Changes in `owner_id`'s partition after `cursor`, oldest first
    async fn query_changed_since(
        &self,
        owner_id: UserId,
        cursor: ChangeCursor,
        limit: usize,
    ) -> Result<ChangePage, RemoteError>;

    /// Read versioned documents; absent documents come back as `None`
    async fn get_documents(&self, keys: &[DocKey]) -> Result<Vec<Option<VersionedDoc>>, RemoteError>;

    /// Documents of `collection` whose top-level `field` equals `value`
    async fn find_documents(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(DocKey, VersionedDoc)>, RemoteError>;

    /// Apply `writes` atomically if every precondition holds, else `Conflict`
    async fn commit(
        &self,
        preconditions: Vec<Precondition>,
        writes: Vec<DocWrite>,
    ) -> Result<(), RemoteError>;

    /// Notifications of new changes in `owner_id`'s partition, if supported
    fn listen(&self, _owner_id: UserId) -> Option<broadcast::Receiver<ChangeCursor>> {
        None
    }
}

/// Documents read at the start of one transaction attempt.
#[derive(Debug, Clone)]
pub struct TxSnapshot {
    docs: Vec<(DocKey, Option<VersionedDoc>)>,
}

impl TxSnapshot {
    /// Raw body of a document in the read set
    pub fn get(&self, key: &DocKey) -> Option<&Value> {
        self.docs
            .iter()
            .find(|(candidate, _)| candidate == key)
            .and_then(|(_, doc)| doc.as_ref())
            .map(|doc| &doc.data)
    }

    /// Decode a document in the read set
    pub fn decode<T: DeserializeOwned>(&self, key: &DocKey) -> Result<Option<T>, RemoteError> {
        self.get(key)
            .map(|data| {
                serde_json::from_value(data.clone())
                    .map_err(|error| RemoteError::Malformed(format!("{key}: {error}")))
            })
            .transpose()
    }

    fn preconditions(&self) -> Vec<Precondition> {
        self.docs
            .iter()
            .map(|(key, doc)| Precondition {
                key: key.clone(),
                version: doc.as_ref().map(|doc| doc.version),
            })
            .collect()
    }
}

/// What a transaction body decided for one attempt.
#[derive(Debug)]
pub enum TxDecision<T> {
    /// Write these documents, then return the value
    Commit(Vec<DocWrite>, T),
    /// Write nothing and return the value
    Abort(T),
}

/// Run a read-modify-write transaction.
///
/// Reads `read_set`, hands the snapshot to `write_fn`, and commits its writes
/// conditioned on every read document being unchanged. When a concurrent
/// writer got there first the whole attempt is re-run against fresh reads, so
/// `write_fn` always decides on current state and never blindly re-applies.
pub async fn run_transaction<T, F>(
    remote: &dyn RemoteReplica,
    read_set: &[DocKey],
    max_attempts: u32,
    mut write_fn: F,
) -> Result<T, RemoteError>
where
    F: FnMut(&TxSnapshot) -> Result<TxDecision<T>, RemoteError> + Send,
    T: Send,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let docs = remote.get_documents(read_set).await?;
        let snapshot = TxSnapshot {
            docs: read_set.iter().cloned().zip(docs).collect(),
        };

        match write_fn(&snapshot)? {
            TxDecision::Abort(value) => return Ok(value),
            TxDecision::Commit(writes, value) => {
                match remote.commit(snapshot.preconditions(), writes).await {
                    Ok(()) => return Ok(value),
                    Err(RemoteError::Conflict) => {
                        tracing::debug!(attempt, "Transaction conflicted; retrying on fresh reads");
                    }
                    Err(error) => return Err(error),
                }
            }
        }
    }
    Err(RemoteError::Conflict)
}

/// Bound a remote call; an elapsed timer counts as a network failure.
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(RemoteError::Timeout(limit)))
}
