//! Change tracker over the `sync_envelopes` table
//!
//! One envelope row per record coalesces any number of local mutations into a
//! single pending entry. Draining leases entries to a batch instead of
//! deleting them: a leased entry is invisible to the next drain, is settled by
//! `acknowledge`/`discard`, and goes back to the pending set on `requeue`, on
//! drop of the lease, or when the database is reopened after a crash.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{Folder, Note, RecordKind, SyncEnvelope, SyncRecord, UserId};

/// Current state of one dirty record, ready to be pushed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub kind: RecordKind,
    pub id: String,
    pub owner_id: UserId,
    /// Local revision captured at drain time
    pub revision: u64,
    pub updated_at: i64,
    pub deleted: bool,
    /// Replicated document body; `Null` for tombstones
    pub document: Value,
}

/// Tracks dirty records for the sync scheduler.
#[derive(Clone)]
pub struct ChangeTracker {
    db: Database,
}

impl ChangeTracker {
    pub(crate) const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Mark a record dirty inside the caller's transaction.
    ///
    /// An already-dirty record keeps its queue position.
    pub(crate) fn mark_dirty(tx: &Transaction<'_>, kind: RecordKind, id: &str) -> Result<()> {
        tx.execute(
            "INSERT INTO sync_envelopes (kind, record_id, dirty, pending_seq)
             VALUES (?1, ?2, 1, (SELECT COALESCE(MAX(pending_seq), 0) + 1 FROM sync_envelopes))
             ON CONFLICT(kind, record_id) DO UPDATE SET
                 pending_seq = CASE WHEN dirty = 1 THEN pending_seq ELSE excluded.pending_seq END,
                 dirty = 1",
            params![kind.as_str(), id],
        )?;
        Ok(())
    }

    /// Mark a record clean at `revision` inside the caller's transaction.
    pub(crate) fn mark_clean(
        tx: &Transaction<'_>,
        kind: RecordKind,
        id: &str,
        revision: u64,
    ) -> Result<()> {
        tx.execute(
            "INSERT INTO sync_envelopes (kind, record_id, dirty, last_synced_revision)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(kind, record_id) DO UPDATE SET
                 dirty = 0,
                 last_synced_revision = excluded.last_synced_revision,
                 push_failure_count = 0",
            params![kind.as_str(), id, to_sql_revision(revision)],
        )?;
        Ok(())
    }

    /// Whether the record currently has unpushed mutations.
    pub(crate) fn is_dirty(conn: &Connection, kind: RecordKind, id: &str) -> Result<bool> {
        let dirty = conn
            .query_row(
                "SELECT dirty FROM sync_envelopes WHERE kind = ? AND record_id = ?",
                params![kind.as_str(), id],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(dirty.unwrap_or(false))
    }

    /// Release every lease left behind by a previous process.
    pub(crate) fn release_in_flight(&self) -> Result<usize> {
        let conn = self.db.lock();
        let released = conn.execute(
            "UPDATE sync_envelopes SET in_flight_batch = NULL WHERE in_flight_batch IS NOT NULL",
            [],
        )?;
        if released > 0 {
            tracing::info!(released, "Released pending changes left in flight by a previous run");
        }
        Ok(released)
    }

    /// Number of dirty records, leased or not
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_envelopes WHERE dirty = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Sync bookkeeping for one record
    pub fn envelope(&self, kind: RecordKind, id: &str) -> Result<Option<SyncEnvelope>> {
        let conn = self.db.lock();
        let envelope = conn
            .query_row(
                "SELECT dirty, last_synced_revision, last_push_attempt_at, push_failure_count
                 FROM sync_envelopes WHERE kind = ? AND record_id = ?",
                params![kind.as_str(), id],
                |row| {
                    Ok(SyncEnvelope {
                        kind,
                        record_id: id.to_string(),
                        dirty: row.get(0)?,
                        last_synced_revision: from_sql_revision(row.get(1)?),
                        last_push_attempt_at: row.get(2)?,
                        push_failure_count: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(envelope)
    }

    /// Lease up to `max_batch_size` pending entries, oldest first.
    ///
    /// Returns `None` when nothing is pending. Entries whose record cannot be
    /// decoded are cleared and skipped.
    pub fn drain(&self, max_batch_size: usize) -> Result<Option<BatchLease>> {
        let batch_id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let limit = i64::try_from(max_batch_size.max(1)).unwrap_or(i64::MAX);

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let keys = {
            let mut stmt = tx.prepare(
                "SELECT kind, record_id FROM sync_envelopes
                 WHERE dirty = 1 AND in_flight_batch IS NULL
                 ORDER BY pending_seq ASC
                 LIMIT ?",
            )?;
            let rows = stmt.query_map([limit], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut changes = Vec::with_capacity(keys.len());
        for (kind, id) in keys {
            match Self::load_change(&tx, &kind, &id) {
                Ok(Some(change)) => {
                    tx.execute(
                        "UPDATE sync_envelopes SET in_flight_batch = ?, last_push_attempt_at = ?
                         WHERE kind = ? AND record_id = ?",
                        params![batch_id, now, kind, id],
                    )?;
                    changes.push(change);
                }
                Ok(None) => {
                    tx.execute(
                        "DELETE FROM sync_envelopes WHERE kind = ? AND record_id = ?",
                        params![kind, id],
                    )?;
                }
                Err(error) if error.is_record_local() => {
                    tracing::error!(%kind, %id, %error, "Dropping unreadable record from the push queue");
                    tx.execute(
                        "UPDATE sync_envelopes SET dirty = 0 WHERE kind = ? AND record_id = ?",
                        params![kind, id],
                    )?;
                }
                Err(error) => return Err(error),
            }
        }
        tx.commit()?;

        if changes.is_empty() {
            return Ok(None);
        }
        tracing::debug!(batch = %batch_id, size = changes.len(), "Drained pending changes");
        Ok(Some(BatchLease {
            tracker: self.clone(),
            batch_id,
            changes,
            settled: false,
        }))
    }

    fn load_change(tx: &Transaction<'_>, kind: &str, id: &str) -> Result<Option<PendingChange>> {
        let parsed_kind: RecordKind = kind.parse().map_err(Error::InvalidInput)?;
        let row = tx
            .query_row(
                "SELECT owner_id, payload, updated_at, revision, is_deleted
                 FROM records WHERE kind = ? AND id = ?",
                params![kind, id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((owner_id, payload, updated_at, revision, deleted)) = row else {
            return Ok(None);
        };

        let corrupted = |reason: String| Error::Corrupted {
            kind: parsed_kind,
            id: id.to_string(),
            reason,
        };
        let owner_id = owner_id
            .parse::<UserId>()
            .map_err(|error| corrupted(error.to_string()))?;
        let document = if deleted {
            Value::Null
        } else {
            document_for(parsed_kind, &payload).map_err(|error| corrupted(error.to_string()))?
        };

        Ok(Some(PendingChange {
            kind: parsed_kind,
            id: id.to_string(),
            owner_id,
            revision: from_sql_revision(revision),
            updated_at,
            deleted,
            document,
        }))
    }

    /// Settle a pushed batch.
    ///
    /// A change whose record was not mutated again while in flight becomes
    /// clean; an acknowledged tombstone is purged. A record mutated while in
    /// flight stays dirty and rejoins the pending set.
    fn acknowledge(&self, batch_id: &str, changes: &[PendingChange]) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        for change in changes {
            let kind = change.kind.as_str();
            let current: Option<i64> = tx
                .query_row(
                    "SELECT revision FROM records WHERE kind = ? AND id = ?",
                    params![kind, change.id],
                    |row| row.get(0),
                )
                .optional()?;
            let unchanged = current.map(from_sql_revision) == Some(change.revision);

            if unchanged && change.deleted {
                tx.execute(
                    "DELETE FROM records WHERE kind = ? AND id = ?",
                    params![kind, change.id],
                )?;
                tx.execute(
                    "DELETE FROM sync_envelopes WHERE kind = ? AND record_id = ?",
                    params![kind, change.id],
                )?;
            } else if unchanged {
                tx.execute(
                    "UPDATE sync_envelopes
                     SET dirty = 0, last_synced_revision = ?, push_failure_count = 0,
                         in_flight_batch = NULL
                     WHERE kind = ? AND record_id = ? AND in_flight_batch = ?",
                    params![to_sql_revision(change.revision), kind, change.id, batch_id],
                )?;
            } else {
                tx.execute(
                    "UPDATE sync_envelopes
                     SET last_synced_revision = ?, push_failure_count = 0, in_flight_batch = NULL
                     WHERE kind = ? AND record_id = ? AND in_flight_batch = ?",
                    params![to_sql_revision(change.revision), kind, change.id, batch_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Clear the dirty flag of changes the remote refused to store.
    ///
    /// Unfixable writes are not retried; a later local edit makes the
    /// record dirty again.
    fn discard(&self, batch_id: &str, changes: &[PendingChange]) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        for change in changes {
            tx.execute(
                "UPDATE sync_envelopes
                 SET dirty = CASE
                         WHEN (SELECT revision FROM records WHERE kind = ?1 AND id = ?2) = ?3
                         THEN 0 ELSE dirty END,
                     in_flight_batch = NULL
                 WHERE kind = ?1 AND record_id = ?2 AND in_flight_batch = ?4",
                params![
                    change.kind.as_str(),
                    change.id,
                    to_sql_revision(change.revision),
                    batch_id
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Return every entry leased to `batch_id` to the pending set.
    fn requeue(&self, batch_id: &str) -> Result<usize> {
        let conn = self.db.lock();
        let requeued = conn.execute(
            "UPDATE sync_envelopes
             SET in_flight_batch = NULL, push_failure_count = push_failure_count + 1
             WHERE in_flight_batch = ?",
            [batch_id],
        )?;
        Ok(requeued)
    }
}

/// A drained batch owned by the pusher.
///
/// Dropping an unsettled lease re-queues its entries, so a cancelled push is
/// indistinguishable from a failed one.
#[must_use = "an unsettled lease re-queues its batch when dropped"]
pub struct BatchLease {
    tracker: ChangeTracker,
    batch_id: String,
    changes: Vec<PendingChange>,
    settled: bool,
}

impl BatchLease {
    pub fn id(&self) -> &str {
        &self.batch_id
    }

    pub fn changes(&self) -> &[PendingChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Settle the batch after a push: `rejected` ids are discarded, the rest acknowledged.
    pub fn settle(mut self, rejected: &[(RecordKind, String)]) -> Result<()> {
        let (refused, accepted): (Vec<_>, Vec<_>) = self
            .changes
            .iter()
            .cloned()
            .partition(|change| rejected.iter().any(|(kind, id)| *kind == change.kind && *id == change.id));
        self.tracker.acknowledge(&self.batch_id, &accepted)?;
        self.tracker.discard(&self.batch_id, &refused)?;
        self.settled = true;
        Ok(())
    }

    /// Put the batch back into the pending set after a failed push.
    pub fn requeue(mut self) -> Result<usize> {
        let requeued = self.tracker.requeue(&self.batch_id)?;
        self.settled = true;
        Ok(requeued)
    }
}

impl Drop for BatchLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        match self.tracker.requeue(&self.batch_id) {
            Ok(requeued) => {
                tracing::debug!(batch = %self.batch_id, requeued, "Re-queued abandoned batch");
            }
            Err(error) => {
                tracing::error!(batch = %self.batch_id, %error, "Failed to re-queue abandoned batch; it will be released on next open");
            }
        }
    }
}

fn document_for(kind: RecordKind, payload: &str) -> serde_json::Result<Value> {
    match kind {
        RecordKind::Note => serde_json::from_str::<Note>(payload)?.to_document(),
        RecordKind::Folder => serde_json::from_str::<Folder>(payload)?.to_document(),
        RecordKind::User => serde_json::from_str(payload),
    }
}

pub(crate) fn to_sql_revision(revision: u64) -> i64 {
    i64::try_from(revision).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_revision(revision: i64) -> u64 {
    u64::try_from(revision).unwrap_or_default()
}
