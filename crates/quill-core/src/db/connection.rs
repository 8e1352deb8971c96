//! Database connection management

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use super::migrations;
use crate::error::{Error, Result};

/// Shared handle to the device-local `SQLite` database.
///
/// Every clone points at the same connection; the mutex is the single
/// serialization point for foreground edits and background sync.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically. A file that is not a database is moved
    /// aside and replaced with a fresh one.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = match Self::open_connection(&path) {
            Ok(conn) => conn,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local database at {} is unreadable: {}. Moving it aside.",
                    path.display(),
                    error
                );
                Self::quarantine_corrupted_db_file(&path)?;
                Self::open_connection(&path)?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        migrations::run(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        let mut conn = Connection::open(path)?;
        Self::configure(&conn)?;
        migrations::run(&mut conn)?;
        Ok(conn)
    }

    /// Configure `SQLite` for a single-writer local store
    fn configure(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn is_corrupted_db_error(error: &Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        message.contains("file is not a database") || message.contains("malformed")
    }

    fn quarantine_corrupted_db_file(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let timestamp = chrono::Utc::now().timestamp_millis();
        let file_name = path
            .file_name()
            .map_or_else(|| "quill.db".into(), |name| name.to_string_lossy());
        let backup_path = path.with_file_name(format!("{file_name}.corrupt-{timestamp}"));
        std::fs::rename(path, &backup_path)?;
        tracing::warn!(
            "Moved corrupted local DB file from {} to {}",
            path.display(),
            backup_path.display()
        );
        Ok(())
    }

    /// Lock the connection. Never held across an `.await`.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Filesystem path, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
