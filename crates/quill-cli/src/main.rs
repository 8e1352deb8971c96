//! Quill CLI - local-first notes from the terminal
//!
//! Every invocation restores the install's identity, performs one operation
//! against the local store, and flushes pending changes before exiting.

mod cli;
mod commands;
mod error;
#[cfg(test)]
mod tests;

use clap::{CommandFactory, Parser};

use crate::cli::{Cli, Commands, FolderCommands, ReferralCommands};
use crate::commands::add::{run_add, AddOptions};
use crate::commands::common::Paths;
use crate::commands::delete::run_delete;
use crate::commands::edit::run_edit;
use crate::commands::folder::{run_folder_add, run_folder_delete, run_folder_list};
use crate::commands::list::run_list;
use crate::commands::pin::run_pin;
use crate::commands::referral::{
    run_referral_audit, run_referral_code, run_referral_qualify, run_referral_redeem,
};
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::commands::whoami::run_whoami;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "quill=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = Paths::resolve(cli.db_path, cli.remote_path, cli.config, cli.offline);

    match cli.command {
        Some(Commands::Add {
            content,
            title,
            folder,
            tags,
            pin,
        }) => {
            let options = AddOptions {
                content: &content,
                title: title.as_deref(),
                folder: folder.as_deref(),
                tags: &tags,
                pin,
            };
            run_add(options, &paths).await?;
        }
        Some(Commands::List {
            limit,
            tag,
            folder,
            json,
        }) => {
            run_list(limit, tag.as_deref(), folder.as_deref(), json, &paths).await?;
        }
        Some(Commands::Edit { id, content, title }) => {
            run_edit(&id, &content, title.as_deref(), &paths).await?;
        }
        Some(Commands::Delete { id }) => run_delete(&id, &paths).await?,
        Some(Commands::Pin { id, off }) => run_pin(&id, !off, &paths).await?,
        Some(Commands::Folder { command }) => match command {
            FolderCommands::Add { name } => run_folder_add(&name, &paths).await?,
            FolderCommands::List { json } => run_folder_list(json, &paths).await?,
            FolderCommands::Delete { id } => run_folder_delete(&id, &paths).await?,
        },
        Some(Commands::Sync { json }) => run_sync(json, &paths).await?,
        Some(Commands::Status { json }) => run_status(json, &paths).await?,
        Some(Commands::Referral { command }) => match command {
            ReferralCommands::Code => run_referral_code(&paths).await?,
            ReferralCommands::Redeem { code } => run_referral_redeem(&code, &paths).await?,
            ReferralCommands::Qualify => run_referral_qualify(&paths).await?,
            ReferralCommands::Audit { json } => run_referral_audit(json, &paths).await?,
        },
        Some(Commands::Whoami) => run_whoami(&paths).await?,
        None => {
            // Quick capture mode: quill "my thought"
            if cli.note.is_empty() {
                Cli::command().print_help()?;
                println!();
            } else {
                let options = AddOptions {
                    content: &cli.note,
                    title: None,
                    folder: None,
                    tags: &[],
                    pin: false,
                };
                run_add(options, &paths).await?;
            }
        }
    }

    Ok(())
}
