//! Durable local key-value storage
//!
//! Holds the resolved anonymous identity and the last-seen remote change
//! cursor. Platform stores restore asynchronously, so every implementation
//! exposes a restore signal next to its synchronous reads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use tokio::sync::watch;

use super::Database;
use crate::error::Result;

/// Restore progress of a durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    /// Reads may still return a stale or empty view
    Pending,
    /// Reads reflect everything persisted by earlier runs
    Restored,
}

/// Trait for durable key-value storage operations
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value durably
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Subscribe to the restore signal
    fn restore_signal(&self) -> watch::Receiver<RestoreState>;
}

/// `SQLite` implementation of `KeyValueStore`, sharing the local database.
///
/// `SQLite` reads are durable as soon as the file is open, so the restore
/// signal starts out `Restored`.
#[derive(Clone)]
pub struct SqliteKeyValueStore {
    db: Database,
    restored: Arc<watch::Sender<RestoreState>>,
}

impl SqliteKeyValueStore {
    /// Create a new store over the given database
    pub fn new(db: Database) -> Self {
        let (restored, _) = watch::channel(RestoreState::Restored);
        Self {
            db,
            restored: Arc::new(restored),
        }
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.db.lock();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    fn restore_signal(&self) -> watch::Receiver<RestoreState> {
        self.restored.subscribe()
    }
}

/// In-memory `KeyValueStore` that can simulate a late restore.
///
/// Created with [`MemoryKeyValueStore::unrestored`], reads return an empty
/// view until [`MemoryKeyValueStore::restore`] delivers the persisted entries,
/// which mirrors platform stores whose first callback fires before restoration.
#[derive(Clone)]
pub struct MemoryKeyValueStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
    restored: Arc<watch::Sender<RestoreState>>,
}

impl MemoryKeyValueStore {
    /// An empty store that is already restored
    pub fn new() -> Self {
        let (restored, _) = watch::channel(RestoreState::Restored);
        Self {
            entries: Arc::default(),
            restored: Arc::new(restored),
        }
    }

    /// An empty store whose restore has not happened yet
    pub fn unrestored() -> Self {
        let (restored, _) = watch::channel(RestoreState::Pending);
        Self {
            entries: Arc::default(),
            restored: Arc::new(restored),
        }
    }

    /// Deliver previously persisted entries and fire the restore signal
    pub fn restore(&self, persisted: impl IntoIterator<Item = (String, String)>) {
        self.entries.lock().extend(persisted);
        self.restored.send_replace(RestoreState::Restored);
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn restore_signal(&self) -> watch::Receiver<RestoreState> {
        self.restored.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_store_roundtrip_and_overwrite() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteKeyValueStore::new(db);

        assert_eq!(store.get("identity").unwrap(), None);
        store.set("identity", "a").unwrap();
        store.set("identity", "b").unwrap();
        assert_eq!(store.get("identity").unwrap().as_deref(), Some("b"));
        assert_eq!(*store.restore_signal().borrow(), RestoreState::Restored);
    }

    #[test]
    fn memory_store_hides_entries_until_restored() {
        let store = MemoryKeyValueStore::unrestored();
        let signal = store.restore_signal();
        assert_eq!(*signal.borrow(), RestoreState::Pending);
        assert_eq!(store.get("identity").unwrap(), None);

        store.restore([("identity".to_string(), "persisted".to_string())]);
        assert_eq!(*signal.borrow(), RestoreState::Restored);
        assert_eq!(store.get("identity").unwrap().as_deref(), Some("persisted"));
    }
}
