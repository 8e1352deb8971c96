use crate::commands::common::{resolve_note, Paths, Session};
use crate::error::CliError;

pub async fn run_pin(id: &str, pinned: bool, paths: &Paths) -> Result<(), CliError> {
    let session = Session::open(paths).await?;
    let mut note = resolve_note(session.store(), id)?;

    if note.is_pinned != pinned {
        note.is_pinned = pinned;
        note = session.store().put(note)?;
    }
    println!("{} {}", if pinned { "Pinned" } else { "Unpinned" }, note.id);
    session.close().await?;
    Ok(())
}
