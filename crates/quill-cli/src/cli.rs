use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Local-first notes that sync in the background")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Path to the replica snapshot shared between devices
    #[arg(long, global = true, value_name = "PATH")]
    pub remote_path: Option<PathBuf>,

    /// Engine configuration file (JSON)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Work against the local database only
    #[arg(long, global = true)]
    pub offline: bool,

    /// Quick capture: quill "my thought here"
    #[arg(trailing_var_arg = true)]
    pub note: Vec<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new note
    #[command(alias = "new")]
    Add {
        /// Note content
        content: Vec<String>,
        /// Note title
        #[arg(short, long)]
        title: Option<String>,
        /// Folder ID or unique ID prefix
        #[arg(long)]
        folder: Option<String>,
        /// Extra tag (repeatable); inline #tags are picked up automatically
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Pin the note
        #[arg(long)]
        pin: bool,
    },
    /// List notes, pinned first
    List {
        /// Number of notes to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Filter notes by tag name
        #[arg(long)]
        tag: Option<String>,
        /// Only notes in this folder (ID or unique ID prefix)
        #[arg(long)]
        folder: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace the content of an existing note
    Edit {
        /// Note ID or unique ID prefix
        id: String,
        /// New content
        content: Vec<String>,
        /// New title
        #[arg(short, long)]
        title: Option<String>,
    },
    /// Delete an existing note
    Delete {
        /// Note ID or unique ID prefix
        id: String,
    },
    /// Pin or unpin a note
    Pin {
        /// Note ID or unique ID prefix
        id: String,
        /// Unpin instead
        #[arg(long)]
        off: bool,
    },
    /// Manage folders
    Folder {
        #[command(subcommand)]
        command: FolderCommands,
    },
    /// Push pending changes and pull remote ones now
    Sync {
        /// Output the cycle report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show background sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Referral codes and credits
    Referral {
        #[command(subcommand)]
        command: ReferralCommands,
    },
    /// Show this install's anonymous identity
    Whoami,
}

#[derive(Subcommand)]
pub enum FolderCommands {
    /// Create a folder
    Add {
        /// Folder name
        name: Vec<String>,
    },
    /// List folders with their note counts
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a folder; its notes stay but lose the folder
    Delete {
        /// Folder ID or unique ID prefix
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ReferralCommands {
    /// Print your referral code
    Code,
    /// Redeem someone else's referral code
    Redeem {
        /// Referral code
        code: String,
    },
    /// Mark your referral as qualified, crediting whoever referred you
    Qualify,
    /// Recompute your credits from awarded referrals
    Audit {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
