use quill_core::models::{sort_for_display, Note};

use crate::commands::common::{
    format_note_lines, note_to_list_item, print_json, resolve_folder, Paths, Session,
};
use crate::error::CliError;

pub async fn run_list(
    limit: usize,
    tag: Option<&str>,
    folder: Option<&str>,
    json: bool,
    paths: &Paths,
) -> Result<(), CliError> {
    let session = Session::open(paths).await?;
    let notes = list_notes(&session, tag, folder, limit)?;

    if json {
        let items = notes.iter().map(note_to_list_item).collect::<Vec<_>>();
        print_json(&items)?;
    } else if notes.is_empty() {
        println!("No notes yet. Create one with: quill add \"Your note\"");
    } else {
        for line in format_note_lines(&notes) {
            println!("{line}");
        }
    }

    session.close().await?;
    Ok(())
}

pub fn list_notes(
    session: &Session,
    tag: Option<&str>,
    folder: Option<&str>,
    limit: usize,
) -> Result<Vec<Note>, CliError> {
    let store = session.store();
    let folder_id = folder
        .map(|query| resolve_folder(store, query).map(|folder| folder.id))
        .transpose()?;

    let mut notes = store.query::<Note>(|note| {
        tag.is_none_or(|tag| note.has_tag(tag))
            && folder_id.is_none_or(|folder_id| note.folder_id == Some(folder_id))
    })?;
    sort_for_display(&mut notes);
    notes.truncate(limit);
    Ok(notes)
}
