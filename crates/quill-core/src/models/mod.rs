//! Data models for Quill

mod envelope;
mod folder;
mod ids;
mod note;
mod record;
mod user;

pub use envelope::SyncEnvelope;
pub use folder::Folder;
pub use ids::{FolderId, NoteId, UserId};
pub use note::{extract_tags, sort_for_display, Note, ProcessingState, StructuredContent};
pub use record::{RecordKind, SyncRecord};
pub use user::{ReferralEvent, User};
