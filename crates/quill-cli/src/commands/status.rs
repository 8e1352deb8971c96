use quill_core::SyncStatus;

use crate::commands::common::{format_timestamp, print_json, Paths, Session};
use crate::error::CliError;

pub async fn run_status(json: bool, paths: &Paths) -> Result<(), CliError> {
    let session = Session::open(paths).await?;
    let mut status = session.client().sync().status();
    status.pending = session.store().tracker().pending_count()?;

    if json {
        print_json(&status)?;
    } else {
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }

    session.close().await?;
    Ok(())
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    let mut lines = vec![
        format!("phase:    {}", status.phase),
        format!("online:   {}", if status.online { "yes" } else { "no" }),
        format!("pending:  {}", status.pending),
    ];
    if let Some(synced_at) = status.last_synced_at {
        lines.push(format!("synced:   {}", format_timestamp(synced_at)));
    }
    if status.consecutive_failures > 0 {
        lines.push(format!("failures: {}", status.consecutive_failures));
    }
    if let Some(error) = &status.last_error {
        lines.push(format!("error:    {error}"));
    }
    if status.stalled {
        lines.push("Sync is stalled; check connectivity or the replica path.".to_string());
    }
    lines
}
