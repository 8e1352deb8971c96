use crate::commands::common::{resolve_note, resolve_note_content, Paths, Session};
use crate::error::CliError;

pub async fn run_edit(
    id: &str,
    content: &[String],
    title: Option<&str>,
    paths: &Paths,
) -> Result<(), CliError> {
    let edited_content = resolve_note_content(content)?;
    let session = Session::open(paths).await?;
    let store = session.store();
    let mut note = resolve_note(store, id)?;

    let edited_title = title.map_or_else(|| note.title.clone(), |title| title.trim().to_string());
    if edited_content == note.content && edited_title == note.title {
        println!("{}", note.id);
    } else {
        note.content = edited_content;
        note.title = edited_title;
        let updated = store.put(note)?;
        println!("{}", updated.id);
    }

    session.close().await?;
    Ok(())
}
