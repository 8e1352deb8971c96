use quill_core::SyncReport;

use crate::commands::common::{print_json, Paths, Session};
use crate::error::CliError;

pub async fn run_sync(json: bool, paths: &Paths) -> Result<(), CliError> {
    let session = Session::open(paths).await?;

    if session.is_offline() {
        let pending = session.store().tracker().pending_count()?;
        session.close().await?;
        println!("Offline; {pending} change(s) queued for the next sync.");
        return Ok(());
    }

    let flushed = session.client().sync().flush_now().await;
    session.close().await?;
    let report = flushed?;

    if json {
        print_json(&report)?;
    } else {
        for line in format_sync_report(&report) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn format_sync_report(report: &SyncReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Sync complete: pushed {}, pulled {}, applied {}.",
        report.pushed, report.pulled, report.applied
    )];
    lines.extend(report.warnings.iter().map(|warning| {
        format!(
            "  rejected {} {}: {}",
            warning.kind, warning.id, warning.reason
        )
    }));
    lines
}
