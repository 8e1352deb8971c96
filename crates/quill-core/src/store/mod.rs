//! Device-local authoritative store
//!
//! Every operation is synchronous and never touches the network, so readers
//! always see their own writes regardless of connectivity. Mutations stamp
//! `updated_at`/`revision` and mark the record dirty inside the same `SQLite`
//! transaction that writes it.

mod tracker;

use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{Folder, FolderId, Note, NoteId, RecordKind, SyncRecord, User, UserId};
use crate::sync::remote::RemoteRecord;
use crate::sync::resolver::{self, LocalState, Resolution};

pub use tracker::{BatchLease, ChangeTracker, PendingChange};
use tracker::{from_sql_revision, to_sql_revision};

/// Result of applying one pulled remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The remote version replaced (or purged) the local record
    Applied,
    /// The local record won and stays as it is
    KeptLocal,
    /// Nothing to do
    Unchanged,
}

/// Handle to the local store. Cheap to clone; all clones share one database.
#[derive(Clone)]
pub struct LocalStore {
    db: Database,
    tracker: ChangeTracker,
    mutations: Arc<watch::Sender<u64>>,
}

struct StoredRow {
    payload: String,
    updated_at: i64,
    revision: u64,
    is_deleted: bool,
}

impl LocalStore {
    /// Open the store over `db`, releasing batches a crashed run left in flight.
    pub fn open(db: Database) -> Result<Self> {
        let tracker = ChangeTracker::new(db.clone());
        tracker.release_in_flight()?;
        let (mutations, _) = watch::channel(0);
        Ok(Self {
            db,
            tracker,
            mutations: Arc::new(mutations),
        })
    }

    /// Open a store over a fresh in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Database::open_in_memory()?)
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    pub const fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Local mutation counter; changes after every committed `put`/`delete`
    pub fn subscribe_mutations(&self) -> watch::Receiver<u64> {
        self.mutations.subscribe()
    }

    fn notify_mutation(&self) {
        self.mutations.send_modify(|count| *count = count.wrapping_add(1));
    }

    /// Store `record`, stamping its timestamp and revision and marking it dirty.
    ///
    /// Returns the stored value. Putting a tombstoned id revives the record.
    pub fn put<R: SyncRecord>(&self, mut record: R) -> Result<R> {
        let now = chrono::Utc::now().timestamp_millis();
        {
            let mut conn = self.db.lock();
            let tx = conn.transaction()?;
            write_local(&tx, &mut record, now)?;
            tx.commit()?;
        }
        tracing::debug!(
            kind = %R::KIND,
            id = %record.record_id(),
            revision = record.revision(),
            "Stored local mutation"
        );
        self.notify_mutation();
        Ok(record)
    }

    /// Fetch a live record by id
    pub fn get<R: SyncRecord>(&self, id: &str) -> Result<R> {
        let conn = self.db.lock();
        let row = read_row(&conn, R::KIND, id)?;
        match row {
            Some(row) if !row.is_deleted => decode(R::KIND, id, &row.payload),
            _ => Err(Error::not_found(R::KIND, id)),
        }
    }

    /// All live records of one kind matching `predicate`, newest first.
    ///
    /// Rows that cannot be decoded are logged and skipped.
    pub fn query<R: SyncRecord>(&self, predicate: impl Fn(&R) -> bool) -> Result<Vec<R>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, payload FROM records
             WHERE kind = ? AND is_deleted = 0
             ORDER BY updated_at DESC, id ASC",
        )?;
        let rows = stmt
            .query_map([R::KIND.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, payload) in rows {
            match decode::<R>(R::KIND, &id, &payload) {
                Ok(record) if predicate(&record) => records.push(record),
                Ok(_) => {}
                Err(error) => tracing::warn!(%error, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }

    /// Tombstone a record. The row is purged once the remote acknowledges the
    /// deletion.
    ///
    /// Deleting a folder clears `folder_id` on every note that referenced it.
    pub fn delete<R: SyncRecord>(&self, id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        {
            let mut conn = self.db.lock();
            let tx = conn.transaction()?;
            tombstone(&tx, R::KIND, id, now)?;
            if R::KIND == RecordKind::Folder {
                let detached = detach_folder(&tx, id, now)?;
                if detached > 0 {
                    tracing::debug!(folder = %id, detached, "Detached notes from deleted folder");
                }
            }
            tx.commit()?;
        }
        tracing::debug!(kind = %R::KIND, %id, "Tombstoned local record");
        self.notify_mutation();
        Ok(())
    }

    pub fn note(&self, id: &NoteId) -> Result<Note> {
        self.get(&id.as_str())
    }

    pub fn folder(&self, id: &FolderId) -> Result<Folder> {
        self.get(&id.as_str())
    }

    /// Cache the user profile read from the remote. Never marked dirty.
    pub fn cache_user(&self, user: &User) -> Result<()> {
        let payload = serde_json::to_string(user)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR REPLACE INTO records (kind, id, owner_id, payload, updated_at, revision, is_deleted)
             VALUES (?, ?, ?, ?, ?, 0, 0)",
            params![
                RecordKind::User.as_str(),
                user.id.as_str(),
                user.id.as_str(),
                payload,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Cached user profile
    pub fn user(&self, id: &UserId) -> Result<User> {
        let id = id.as_str();
        let conn = self.db.lock();
        match read_row(&conn, RecordKind::User, &id)? {
            Some(row) => decode(RecordKind::User, &id, &row.payload),
            None => Err(Error::not_found(RecordKind::User, id)),
        }
    }

    /// Apply one pulled record through the conflict resolver.
    ///
    /// User documents never flow through this path and are ignored.
    pub fn apply_remote(&self, incoming: &RemoteRecord) -> Result<ApplyOutcome> {
        let outcome = {
            let mut conn = self.db.lock();
            let tx = conn.transaction()?;
            let outcome = match incoming.kind {
                RecordKind::Note => apply_typed::<Note>(&tx, incoming)?,
                RecordKind::Folder => apply_typed::<Folder>(&tx, incoming)?,
                RecordKind::User => ApplyOutcome::Unchanged,
            };
            tx.commit()?;
            outcome
        };
        tracing::debug!(
            kind = %incoming.kind,
            id = %incoming.id,
            ?outcome,
            "Applied remote change"
        );
        Ok(outcome)
    }
}

fn read_row(conn: &rusqlite::Connection, kind: RecordKind, id: &str) -> Result<Option<StoredRow>> {
    let row = conn
        .query_row(
            "SELECT payload, updated_at, revision, is_deleted FROM records WHERE kind = ? AND id = ?",
            params![kind.as_str(), id],
            |row| {
                Ok(StoredRow {
                    payload: row.get(0)?,
                    updated_at: row.get(1)?,
                    revision: from_sql_revision(row.get(2)?),
                    is_deleted: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn decode<T: DeserializeOwned>(kind: RecordKind, id: &str, payload: &str) -> Result<T> {
    serde_json::from_str(payload).map_err(|error| Error::Corrupted {
        kind,
        id: id.to_string(),
        reason: error.to_string(),
    })
}

fn store_row<R: SyncRecord>(tx: &Transaction<'_>, record: &R) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO records (kind, id, owner_id, payload, updated_at, revision, is_deleted)
         VALUES (?, ?, ?, ?, ?, ?, 0)",
        params![
            R::KIND.as_str(),
            record.record_id(),
            record.owner_id().as_str(),
            serde_json::to_string(record)?,
            record.updated_at(),
            to_sql_revision(record.revision())
        ],
    )?;
    Ok(())
}

/// Stamp and write a local mutation, then mark it dirty.
///
/// `updated_at` never moves backwards for one record, even if the wall clock does.
fn write_local<R: SyncRecord>(tx: &Transaction<'_>, record: &mut R, now: i64) -> Result<()> {
    let id = record.record_id();
    if id.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{} id must not be empty", R::KIND)));
    }
    let (updated_at, revision) = match read_row(tx, R::KIND, &id)? {
        Some(previous) => (
            now.max(previous.updated_at.saturating_add(1)),
            previous.revision.saturating_add(1),
        ),
        None => (now.max(record.updated_at()), record.revision().saturating_add(1)),
    };
    record.stamp(updated_at, revision);
    store_row(tx, record)?;
    ChangeTracker::mark_dirty(tx, R::KIND, &id)
}

fn tombstone(tx: &Transaction<'_>, kind: RecordKind, id: &str, now: i64) -> Result<()> {
    let previous = read_row(tx, kind, id)?;
    let Some(previous) = previous.filter(|row| !row.is_deleted) else {
        return Err(Error::not_found(kind, id));
    };
    tx.execute(
        "UPDATE records SET is_deleted = 1, updated_at = ?, revision = ? WHERE kind = ? AND id = ?",
        params![
            now.max(previous.updated_at.saturating_add(1)),
            to_sql_revision(previous.revision.saturating_add(1)),
            kind.as_str(),
            id
        ],
    )?;
    ChangeTracker::mark_dirty(tx, kind, id)
}

/// Null out `folder_id` on live notes pointing at `folder_id`, as local mutations.
fn detach_folder(tx: &Transaction<'_>, folder_id: &str, now: i64) -> Result<usize> {
    let rows = {
        let mut stmt = tx.prepare(
            "SELECT id, payload FROM records
             WHERE kind = 'note' AND is_deleted = 0
               AND json_extract(payload, '$.folder_id') = ?",
        )?;
        let rows = stmt.query_map([folder_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut detached = 0;
    for (id, payload) in rows {
        match decode::<Note>(RecordKind::Note, &id, &payload) {
            Ok(mut note) => {
                note.folder_id = None;
                write_local(tx, &mut note, now)?;
                detached += 1;
            }
            Err(error) => tracing::warn!(%error, "Cannot detach unreadable note from folder"),
        }
    }
    Ok(detached)
}

fn apply_typed<R: SyncRecord>(tx: &Transaction<'_>, incoming: &RemoteRecord) -> Result<ApplyOutcome> {
    let local = read_row(tx, R::KIND, &incoming.id)?;
    let dirty = ChangeTracker::is_dirty(tx, R::KIND, &incoming.id)?;
    let local_state = local.as_ref().map(|row| LocalState {
        updated_at: row.updated_at,
        dirty,
    });

    match resolver::resolve(local_state, incoming.updated_at) {
        Resolution::KeepLocal => return Ok(ApplyOutcome::KeptLocal),
        Resolution::AlreadyCurrent => return Ok(ApplyOutcome::Unchanged),
        Resolution::ApplyRemote => {}
    }

    let next_revision = local.as_ref().map_or(1, |row| row.revision.saturating_add(1));

    if incoming.deleted {
        if local.is_none() {
            return Ok(ApplyOutcome::Unchanged);
        }
        tx.execute(
            "DELETE FROM records WHERE kind = ? AND id = ?",
            params![R::KIND.as_str(), incoming.id],
        )?;
        tx.execute(
            "DELETE FROM sync_envelopes WHERE kind = ? AND record_id = ?",
            params![R::KIND.as_str(), incoming.id],
        )?;
        if R::KIND == RecordKind::Folder {
            detach_folder(tx, &incoming.id, chrono::Utc::now().timestamp_millis())?;
        }
        return Ok(ApplyOutcome::Applied);
    }

    let mut record: R = serde_json::from_value(incoming.document.clone())?;
    if record.record_id() != incoming.id || record.owner_id() != incoming.owner_id {
        return Err(Error::InvalidInput(format!(
            "remote {} {} does not match its envelope",
            R::KIND,
            incoming.id
        )));
    }
    if let Some(previous) = local.as_ref().filter(|row| !row.is_deleted) {
        match decode::<R>(R::KIND, &incoming.id, &previous.payload) {
            Ok(previous) => record.keep_local_state(&previous),
            Err(error) => tracing::warn!(%error, "Replacing unreadable local record"),
        }
    }
    record.stamp(incoming.updated_at, next_revision);
    store_row(tx, &record)?;
    ChangeTracker::mark_clean(tx, R::KIND, &incoming.id, next_revision)?;
    Ok(ApplyOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setup() -> (LocalStore, UserId) {
        (LocalStore::open_in_memory().unwrap(), UserId::new())
    }

    fn remote_version(note: &Note, updated_at: i64) -> RemoteRecord {
        let mut remote = note.clone();
        remote.updated_at = updated_at;
        RemoteRecord {
            kind: RecordKind::Note,
            id: note.id.as_str(),
            owner_id: note.owner_id,
            updated_at,
            deleted: false,
            document: remote.to_document().unwrap(),
        }
    }

    #[test]
    fn put_then_get_reads_own_write() {
        let (store, owner) = setup();
        let stored = store.put(Note::new(owner, "Title", "Hello")).unwrap();
        assert_eq!(stored.revision, 1);

        let fetched = store.note(&stored.id).unwrap();
        assert_eq!(fetched, stored);
        assert!(store.tracker().envelope(RecordKind::Note, &stored.id.as_str()).unwrap().unwrap().dirty);
    }

    #[test]
    fn put_stamps_monotonic_timestamp_and_revision() {
        let (store, owner) = setup();
        let mut note = store.put(Note::new(owner, "", "v1")).unwrap();
        let first = note.clone();
        for version in 2..=5 {
            note.content = format!("v{version}");
            note = store.put(note).unwrap();
        }
        assert_eq!(note.revision, 5);
        assert!(note.updated_at >= first.updated_at + 4);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (store, _) = setup();
        let error = store.note(&NoteId::new()).unwrap_err();
        assert!(matches!(error, Error::NotFound { kind: RecordKind::Note, .. }));
    }

    #[test]
    fn query_filters_and_orders_newest_first() {
        let (store, owner) = setup();
        store.put(Note::new(owner, "", "about #rust")).unwrap();
        let mut newer = Note::new(owner, "", "also #rust");
        newer.updated_at += 60_000;
        let newer = store.put(newer).unwrap();
        store.put(Note::new(owner, "", "untagged")).unwrap();

        let rust = store.query::<Note>(|note| note.has_tag("rust")).unwrap();
        assert_eq!(rust.len(), 2);
        assert_eq!(rust[0].id, newer.id);
    }

    #[test]
    fn delete_tombstones_until_acknowledged() {
        let (store, owner) = setup();
        let note = store.put(Note::new(owner, "", "bye")).unwrap();
        store.delete::<Note>(&note.id.as_str()).unwrap();

        assert!(store.note(&note.id).is_err());
        assert!(store.query::<Note>(|_| true).unwrap().is_empty());
        // The tombstone is still queued for push
        let lease = store.tracker().drain(10).unwrap().unwrap();
        assert_eq!(lease.len(), 1);
        assert!(lease.changes()[0].deleted);
        lease.settle(&[]).unwrap();

        let remaining: i64 = store
            .database()
            .lock()
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let (store, _) = setup();
        assert!(store.delete::<Note>(&NoteId::new().as_str()).is_err());
    }

    #[test]
    fn deleting_folder_detaches_notes() {
        let (store, owner) = setup();
        let folder = store.put(Folder::new(owner, "Biology")).unwrap();
        let mut note = Note::new(owner, "", "cells");
        note.folder_id = Some(folder.id);
        let note = store.put(note).unwrap();

        store.delete::<Folder>(&folder.id.as_str()).unwrap();

        let detached = store.note(&note.id).unwrap();
        assert_eq!(detached.folder_id, None);
        assert!(detached.revision > note.revision);
        assert!(store.folder(&folder.id).is_err());
    }

    #[test]
    fn corrupted_row_only_affects_that_record() {
        let (store, owner) = setup();
        let good = store.put(Note::new(owner, "", "fine")).unwrap();
        let bad = store.put(Note::new(owner, "", "soon broken")).unwrap();
        store
            .database()
            .lock()
            .execute(
                "UPDATE records SET payload = '{not json' WHERE id = ?",
                [bad.id.as_str()],
            )
            .unwrap();

        assert!(matches!(store.note(&bad.id), Err(Error::Corrupted { .. })));
        let notes = store.query::<Note>(|_| true).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, good.id);
    }

    #[test]
    fn newer_remote_overwrites_and_clears_dirty() {
        let (store, owner) = setup();
        let mut local = Note::new(owner, "", "local");
        local.processing.is_processing = true;
        let local = store.put(local).unwrap();

        let mut incoming = remote_version(&local, local.updated_at + 1_000);
        incoming.document["content"] = "remote".into();
        assert_eq!(store.apply_remote(&incoming).unwrap(), ApplyOutcome::Applied);

        let stored = store.note(&local.id).unwrap();
        assert_eq!(stored.content, "remote");
        assert_eq!(stored.updated_at, local.updated_at + 1_000);
        assert!(stored.processing.is_processing, "local processing state survives");
        let envelope = store.tracker().envelope(RecordKind::Note, &local.id.as_str()).unwrap().unwrap();
        assert!(!envelope.dirty);
    }

    #[test]
    fn dirty_local_survives_older_or_equal_remote() {
        let (store, owner) = setup();
        let local = store.put(Note::new(owner, "", "local edit")).unwrap();

        for stamp in [local.updated_at, local.updated_at - 500] {
            let mut incoming = remote_version(&local, stamp);
            incoming.document["content"] = "stale remote".into();
            assert_eq!(store.apply_remote(&incoming).unwrap(), ApplyOutcome::KeptLocal);
        }
        assert_eq!(store.note(&local.id).unwrap().content, "local edit");
        assert_eq!(store.tracker().pending_count().unwrap(), 1);
    }

    #[test]
    fn remote_tombstone_purges_clean_local() {
        let (store, owner) = setup();
        let note = store.put(Note::new(owner, "", "shared")).unwrap();
        store.tracker().drain(10).unwrap().unwrap().settle(&[]).unwrap();

        let tombstone = RemoteRecord {
            deleted: true,
            document: serde_json::Value::Null,
            ..remote_version(&note, note.updated_at + 1)
        };
        assert_eq!(store.apply_remote(&tombstone).unwrap(), ApplyOutcome::Applied);
        assert!(store.note(&note.id).is_err());
    }

    #[test]
    fn user_cache_roundtrip() {
        let (store, owner) = setup();
        let mut user = User::new(owner);
        user.referral_code = Some("ABCD2345".into());
        store.cache_user(&user).unwrap();
        assert_eq!(store.user(&owner).unwrap(), user);
        assert_eq!(store.tracker().pending_count().unwrap(), 0);
    }

    #[test]
    fn mutations_are_signalled() {
        let (store, owner) = setup();
        let rx = store.subscribe_mutations();
        store.put(Note::new(owner, "", "a")).unwrap();
        store.put(Note::new(owner, "", "b")).unwrap();
        assert_eq!(*rx.borrow(), 2);
    }
}
