use quill_core::models::{Folder, Note};
use serde::Serialize;

use crate::commands::common::{
    format_timestamp, normalize_content, print_json, resolve_folder, short_id, Paths, Session,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct FolderListItem {
    pub id: String,
    pub name: String,
    pub notes: usize,
    pub updated_at: i64,
}

pub async fn run_folder_add(name_parts: &[String], paths: &Paths) -> Result<(), CliError> {
    let name = normalize_content(&name_parts.join(" ")).ok_or(CliError::EmptyFolderName)?;
    let session = Session::open(paths).await?;
    let folder = session
        .store()
        .put(Folder::new(session.client().owner_id(), name))?;
    println!("{}", folder.id);
    session.close().await?;
    Ok(())
}

pub async fn run_folder_list(json: bool, paths: &Paths) -> Result<(), CliError> {
    let session = Session::open(paths).await?;
    let items = list_folders(&session)?;

    if json {
        print_json(&items)?;
    } else if items.is_empty() {
        println!("No folders yet. Create one with: quill folder add \"Name\"");
    } else {
        for item in &items {
            println!(
                "{:<13}  {:<30}  {:>4} notes  {}",
                short_id(&item.id),
                item.name,
                item.notes,
                format_timestamp(item.updated_at)
            );
        }
    }

    session.close().await?;
    Ok(())
}

pub fn list_folders(session: &Session) -> Result<Vec<FolderListItem>, CliError> {
    let store = session.store();
    let notes = store.query::<Note>(|note| note.folder_id.is_some())?;
    let mut folders = store.query::<Folder>(|_| true)?;
    folders.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));

    Ok(folders
        .into_iter()
        .map(|folder| FolderListItem {
            id: folder.id.to_string(),
            notes: notes
                .iter()
                .filter(|note| note.folder_id == Some(folder.id))
                .count(),
            name: folder.name,
            updated_at: folder.updated_at,
        })
        .collect())
}

pub async fn run_folder_delete(id: &str, paths: &Paths) -> Result<(), CliError> {
    let session = Session::open(paths).await?;
    let folder = resolve_folder(session.store(), id)?;
    session.store().delete::<Folder>(&folder.id.as_str())?;
    println!("Deleted folder {} ({})", folder.name, folder.id);
    session.close().await?;
    Ok(())
}
