use quill_core::models::Note;

use crate::commands::common::{resolve_note, Paths, Session};
use crate::error::CliError;

pub async fn run_delete(id: &str, paths: &Paths) -> Result<(), CliError> {
    let session = Session::open(paths).await?;
    let note = resolve_note(session.store(), id)?;
    session.store().delete::<Note>(&note.id.as_str())?;
    println!("Deleted note {}", note.id);
    session.close().await?;
    Ok(())
}
