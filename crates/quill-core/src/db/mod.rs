//! Database layer for Quill

mod connection;
mod kv;
mod migrations;

pub use connection::Database;
pub use kv::{KeyValueStore, MemoryKeyValueStore, RestoreState, SqliteKeyValueStore};
