//! Note model

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

use super::{FolderId, NoteId, RecordKind, SyncRecord, UserId};

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([a-zA-Z][a-zA-Z0-9_-]*)").expect("Invalid regex"));

/// Generated study material attached to a note.
///
/// The sync engine treats these fields as an opaque payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredContent {
    pub summary: Option<String>,
    pub key_points: Vec<String>,
    pub table: Option<serde_json::Value>,
    pub transcript: Option<String>,
}

/// Local generation state. Never replicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingState {
    pub is_processing: bool,
    /// Percent complete, 0-100
    pub progress: u8,
    pub error: Option<String>,
}

/// A note in the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Unique identifier
    pub id: NoteId,
    /// Identity of the owning install
    pub owner_id: UserId,
    pub title: String,
    /// Plain text content
    pub content: String,
    /// Containing folder, if any
    pub folder_id: Option<FolderId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub structured: StructuredContent,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub processing: ProcessingState,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms), monotonic per note
    pub updated_at: i64,
    /// Local mutation counter
    #[serde(default)]
    pub revision: u64,
}

impl Note {
    /// Create a new note with the given title and content
    #[must_use]
    pub fn new(owner_id: UserId, title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: NoteId::new(),
            owner_id,
            title: title.into(),
            content: content.into(),
            folder_id: None,
            tags: Vec::new(),
            structured: StructuredContent::default(),
            is_pinned: false,
            processing: ProcessingState::default(),
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Explicit tags merged with the inline #tags found in the content
    #[must_use]
    pub fn all_tags(&self) -> Vec<String> {
        let mut tags: BTreeSet<String> = self.tags.iter().map(|tag| tag.to_lowercase()).collect();
        tags.extend(extract_tags(&self.content));
        tags.into_iter().collect()
    }

    /// Check whether the note carries `tag`, explicitly or inline
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        let tag = tag.trim_start_matches('#').to_lowercase();
        self.all_tags().iter().any(|candidate| *candidate == tag)
    }

    /// Title, or the first line of content when untitled, truncated to `max_len` characters
    #[must_use]
    pub fn title_preview(&self, max_len: usize) -> String {
        let source = if self.title.trim().is_empty() {
            self.content.lines().next().unwrap_or("")
        } else {
            self.title.trim()
        };
        source.chars().take(max_len).collect()
    }

    /// Check if note is empty (whitespace-only counts as empty)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.trim().is_empty() && self.content.trim().is_empty()
    }
}

impl SyncRecord for Note {
    const KIND: RecordKind = RecordKind::Note;
    const LOCAL_ONLY_FIELDS: &'static [&'static str] = &["revision", "processing"];

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

    fn keep_local_state(&mut self, local: &Self) {
        self.processing = local.processing.clone();
    }
}

/// Order notes pinned-first, then most recently updated first
pub fn sort_for_display(notes: &mut [Note]) {
    notes.sort_by(|a, b| {
        b.is_pinned
            .cmp(&a.is_pinned)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Extract #tags from text
///
/// Valid tags match the pattern: `#[a-zA-Z][a-zA-Z0-9_-]*`
/// Tags are returned in lowercase, deduplicated and sorted.
///
/// # Examples
///
/// ```
/// use quill_core::models::extract_tags;
///
/// let tags = extract_tags("Hello #world this is #Rust-lang");
/// assert_eq!(tags, vec!["rust-lang".to_string(), "world".to_string()]);
/// ```
#[must_use]
pub fn extract_tags(text: &str) -> Vec<String> {
    TAG_PATTERN
        .captures_iter(text)
        .map(|cap| cap[1].to_lowercase())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
