use quill_core::models::Note;

use crate::commands::common::{resolve_folder, resolve_note_content, Paths, Session};
use crate::error::CliError;

pub struct AddOptions<'a> {
    pub content: &'a [String],
    pub title: Option<&'a str>,
    pub folder: Option<&'a str>,
    pub tags: &'a [String],
    pub pin: bool,
}

pub async fn run_add(options: AddOptions<'_>, paths: &Paths) -> Result<(), CliError> {
    let content = resolve_note_content(options.content)?;
    let session = Session::open(paths).await?;
    let store = session.store();

    let mut note = Note::new(
        session.client().owner_id(),
        options.title.map(str::trim).unwrap_or_default(),
        content,
    );
    if let Some(folder) = options.folder {
        note.folder_id = Some(resolve_folder(store, folder)?.id);
    }
    note.tags = options
        .tags
        .iter()
        .map(|tag| tag.trim().trim_start_matches('#').to_string())
        .filter(|tag| !tag.is_empty())
        .collect();
    note.is_pinned = options.pin;

    let note = store.put(note)?;
    println!("{}", note.id);
    session.close().await?;
    Ok(())
}
