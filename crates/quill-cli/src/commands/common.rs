use std::env;
use std::ffi::OsString;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use quill_core::models::{Folder, FolderId, Note, NoteId};
use quill_core::{
    Client, ConnectivityMonitor, EngineConfig, LocalStore, MemoryReplica, SyncReport,
};
use serde::Serialize;

use crate::error::CliError;

/// Where one invocation keeps its state
#[derive(Debug, Clone)]
pub struct Paths {
    pub db_path: PathBuf,
    pub remote_path: PathBuf,
    pub config_path: PathBuf,
    pub offline: bool,
}

impl Paths {
    pub fn resolve(
        db_path: Option<PathBuf>,
        remote_path: Option<PathBuf>,
        config_path: Option<PathBuf>,
        offline: bool,
    ) -> Self {
        Self {
            db_path: pick_path(db_path, env::var_os("QUILL_DB_PATH"), || {
                data_dir().join("quill.db")
            }),
            remote_path: pick_path(remote_path, env::var_os("QUILL_REMOTE_PATH"), || {
                data_dir().join("replica.json")
            }),
            config_path: pick_path(config_path, env::var_os("QUILL_CONFIG"), || {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("quill")
                    .join("config.json")
            }),
            offline,
        }
    }
}

pub fn pick_path(
    explicit: Option<PathBuf>,
    from_env: Option<OsString>,
    fallback: impl FnOnce() -> PathBuf,
) -> PathBuf {
    explicit
        .or_else(|| from_env.filter(|value| !value.is_empty()).map(PathBuf::from))
        .unwrap_or_else(fallback)
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quill")
}

/// A running engine plus the replica snapshot it syncs against.
pub struct Session {
    client: Client,
    remote: Arc<MemoryReplica>,
    remote_path: PathBuf,
    offline: bool,
}

impl Session {
    pub async fn open(paths: &Paths) -> Result<Self, CliError> {
        ensure_parent(&paths.db_path)?;
        let config = EngineConfig::load_from_path(&paths.config_path)?;
        let remote = Arc::new(MemoryReplica::load_snapshot(&paths.remote_path)?);
        remote.set_online(!paths.offline);
        let connectivity = ConnectivityMonitor::new(!paths.offline);

        let client = Client::open(&paths.db_path, remote.clone(), connectivity, config).await?;
        Ok(Self {
            client,
            remote,
            remote_path: paths.remote_path.clone(),
            offline: paths.offline,
        })
    }

    pub const fn client(&self) -> &Client {
        &self.client
    }

    pub const fn store(&self) -> &LocalStore {
        self.client.store()
    }

    pub const fn is_offline(&self) -> bool {
        self.offline
    }

    /// Flush pending changes, stop the engine, and persist the replica.
    ///
    /// A failed flush is not an error: the changes stay queued locally.
    pub async fn close(self) -> Result<Option<SyncReport>, CliError> {
        let report = if self.offline {
            None
        } else {
            match self.client.sync().flush_now().await {
                Ok(report) => {
                    for warning in &report.warnings {
                        tracing::warn!(
                            kind = %warning.kind,
                            id = %warning.id,
                            "Remote rejected record: {}",
                            warning.reason
                        );
                    }
                    Some(report)
                }
                Err(error) => {
                    tracing::warn!(%error, "Sync failed; changes stay queued");
                    None
                }
            }
        };

        self.client.shutdown().await;
        if !self.offline {
            self.remote.save_snapshot(&self.remote_path)?;
        }
        Ok(report)
    }
}

#[derive(Debug, Serialize)]
pub struct NoteListItem {
    pub id: String,
    pub title: String,
    pub preview: String,
    pub content: String,
    pub folder_id: Option<String>,
    pub tags: Vec<String>,
    pub is_pinned: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub relative_time: String,
}

pub fn note_to_list_item(note: &Note) -> NoteListItem {
    let now_ms = Utc::now().timestamp_millis();
    NoteListItem {
        id: note.id.to_string(),
        title: note.title.clone(),
        preview: note_preview(note, 80),
        content: note.content.clone(),
        folder_id: note.folder_id.map(|id| id.to_string()),
        tags: note.all_tags(),
        is_pinned: note.is_pinned,
        created_at: note.created_at,
        updated_at: note.updated_at,
        relative_time: format_relative_time(note.updated_at, now_ms),
    }
}

pub fn format_note_lines(notes: &[Note]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    notes
        .iter()
        .map(|note| {
            let short_id = short_id(&note.id.to_string());
            let pin = if note.is_pinned { '*' } else { ' ' };
            let preview = note_preview(note, 40);
            let relative_time = format_relative_time(note.updated_at, now_ms);
            let tags = render_tags(note);

            if tags.is_empty() {
                format!("{short_id:<13} {pin} {preview:<40}  {relative_time}")
            } else {
                format!("{short_id:<13} {pin} {preview:<40}  {relative_time:<10}  {tags}")
            }
        })
        .collect()
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

/// Single-line preview of the title, or the content when untitled
pub fn note_preview(note: &Note, max_chars: usize) -> String {
    let source = note.title_preview(usize::MAX);
    let collapsed = source.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn render_tags(note: &Note) -> String {
    note.all_tags()
        .into_iter()
        .map(|tag| format!("#{tag}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < year {
        format!("{}w ago", diff / week)
    } else {
        format!("{}y ago", diff / year)
    }
}

/// Content from arguments, else from piped stdin
pub fn resolve_note_content(content_parts: &[String]) -> Result<String, CliError> {
    if let Some(content) = normalize_content(&content_parts.join(" ")) {
        return Ok(content);
    }

    if let Some(content) = read_piped_stdin()? {
        return Ok(content);
    }

    Err(CliError::EmptyContent)
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyId)
    } else {
        Ok(trimmed.to_lowercase())
    }
}

fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}

/// Look a note up by full id or unique id prefix
pub fn resolve_note(store: &LocalStore, query: &str) -> Result<Note, CliError> {
    let query = normalize_identifier(query)?;
    if let Ok(id) = query.parse::<NoteId>() {
        match store.note(&id) {
            Ok(note) => return Ok(note),
            Err(quill_core::Error::NotFound { .. }) => {}
            Err(error) => return Err(error.into()),
        }
    }

    let matches = store.query::<Note>(|note| note.id.as_str().starts_with(&query))?;
    pick_unique("Note", &query, matches, |note| note.id.as_str())
}

/// Look a folder up by full id or unique id prefix
pub fn resolve_folder(store: &LocalStore, query: &str) -> Result<Folder, CliError> {
    let query = normalize_identifier(query)?;
    if let Ok(id) = query.parse::<FolderId>() {
        match store.folder(&id) {
            Ok(folder) => return Ok(folder),
            Err(quill_core::Error::NotFound { .. }) => {}
            Err(error) => return Err(error.into()),
        }
    }

    let matches = store.query::<Folder>(|folder| folder.id.as_str().starts_with(&query))?;
    pick_unique("Folder", &query, matches, |folder| folder.id.as_str())
}

pub fn pick_unique<R>(
    kind: &'static str,
    query: &str,
    mut matches: Vec<R>,
    id_of: impl Fn(&R) -> String,
) -> Result<R, CliError> {
    match matches.len() {
        0 => Err(CliError::NotFound {
            kind,
            query: query.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|record| short_id(&id_of(record)))
                .collect::<Vec<_>>()
                .join(", ");

            Err(CliError::AmbiguousId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn ensure_parent(path: &Path) -> Result<(), CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
