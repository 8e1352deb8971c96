use std::ffi::OsString;
use std::path::{Path, PathBuf};

use pretty_assertions::assert_eq;
use quill_core::models::{Folder, Note, RecordKind, UserId};
use quill_core::{LedgerAudit, MemoryReplica, SyncPhase, SyncStatus};
use tempfile::tempdir;

use crate::commands::add::{run_add, AddOptions};
use crate::commands::common::{
    format_relative_time, normalize_content, normalize_identifier, note_preview, pick_path,
    pick_unique, resolve_note, Paths, Session,
};
use crate::commands::folder::{list_folders, run_folder_add, run_folder_delete};
use crate::commands::list::list_notes;
use crate::commands::referral::{check_audit, run_referral_qualify, run_referral_redeem};
use crate::commands::status::format_status_lines;
use crate::commands::sync::run_sync;
use crate::error::CliError;

fn device_paths(dir: &Path, device: &str) -> Paths {
    Paths {
        db_path: dir.join(format!("{device}.db")),
        remote_path: dir.join("replica.json"),
        config_path: dir.join("config.json"),
        offline: false,
    }
}

fn add_options<'a>(content: &'a [String], tags: &'a [String]) -> AddOptions<'a> {
    AddOptions {
        content,
        title: None,
        folder: None,
        tags,
        pin: false,
    }
}

#[test]
fn normalize_content_trims_and_rejects_empty() {
    assert_eq!(normalize_content("  hello  "), Some("hello".to_string()));
    assert_eq!(normalize_content(" \n\t "), None);
}

#[test]
fn normalize_identifier_lowercases_and_rejects_empty() {
    assert_eq!(normalize_identifier(" 0192ABC ").unwrap(), "0192abc");
    assert!(matches!(normalize_identifier("   "), Err(CliError::EmptyId)));
}

#[test]
fn pick_path_prefers_flag_then_environment() {
    let fallback = || PathBuf::from("/default/quill.db");
    assert_eq!(
        pick_path(
            Some(PathBuf::from("/flag.db")),
            Some(OsString::from("/env.db")),
            fallback
        ),
        PathBuf::from("/flag.db")
    );
    assert_eq!(
        pick_path(None, Some(OsString::from("/env.db")), fallback),
        PathBuf::from("/env.db")
    );
    assert_eq!(
        pick_path(None, Some(OsString::new()), fallback),
        PathBuf::from("/default/quill.db")
    );
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
}

#[test]
fn note_preview_prefers_title_and_truncates() {
    let owner = UserId::new();
    let untitled = Note::new(owner, "", "This is a very long sentence that should be shortened");
    assert_eq!(note_preview(&untitled, 20), "This is a very lo...");

    let titled = Note::new(owner, "  Lab   report ", "body text");
    assert_eq!(note_preview(&titled, 20), "Lab report");
}

#[test]
fn pick_unique_reports_missing_and_ambiguous_prefixes() {
    let missing = pick_unique("Note", "abc", Vec::<String>::new(), Clone::clone).unwrap_err();
    assert_eq!(missing.to_string(), "Note not found for id/prefix: abc");

    let ambiguous = pick_unique(
        "Note",
        "01",
        vec!["0123456789abcdef".to_string(), "0198765432fedcba".to_string()],
        Clone::clone,
    )
    .unwrap_err();
    assert!(ambiguous.to_string().contains("0123456789abc, 0198765432fed"));
}

#[test]
fn status_lines_flag_a_stalled_scheduler() {
    let status = SyncStatus {
        phase: SyncPhase::Backoff,
        online: false,
        pending: 3,
        consecutive_failures: 8,
        stalled: true,
        last_error: Some("Remote is unreachable".to_string()),
        last_synced_at: None,
        cycles: 9,
    };
    let lines = format_status_lines(&status);
    assert!(lines.contains(&"pending:  3".to_string()));
    assert!(lines.contains(&"failures: 8".to_string()));
    assert!(lines.iter().any(|line| line.contains("stalled")));
}

#[test]
fn audit_mismatch_is_an_error() {
    let consistent = LedgerAudit {
        user_id: UserId::new(),
        credits: 2,
        awarded_referrals: 2,
        expected_credits: 2,
    };
    assert!(check_audit(&consistent).is_ok());

    let broken = LedgerAudit {
        credits: 3,
        ..consistent
    };
    assert!(matches!(
        check_audit(&broken),
        Err(CliError::LedgerMismatch {
            credits: 3,
            expected: 2
        })
    ));
}

#[tokio::test]
async fn notes_survive_restart_with_the_same_identity() {
    let tmp = tempdir().unwrap();
    let paths = device_paths(tmp.path(), "laptop");

    let tags = vec!["#Exam".to_string()];
    run_add(add_options(&["Revise".to_string(), "optics".to_string()], &tags), &paths)
        .await
        .unwrap();
    run_add(add_options(&["Buy milk #errands".to_string()], &[]), &paths)
        .await
        .unwrap();

    let first_owner = {
        let session = Session::open(&paths).await.unwrap();
        let owner = session.client().owner_id();
        session.close().await.unwrap();
        owner
    };

    let session = Session::open(&paths).await.unwrap();
    assert_eq!(session.client().owner_id(), first_owner);

    let all = list_notes(&session, None, None, 10).unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|note| note.owner_id == first_owner));

    let exam = list_notes(&session, Some("exam"), None, 10).unwrap();
    assert_eq!(exam.len(), 1);
    assert_eq!(exam[0].content, "Revise optics");

    let errands = list_notes(&session, Some("#errands"), None, 10).unwrap();
    assert_eq!(errands.len(), 1);

    let found = resolve_note(session.store(), &exam[0].id.to_string()).unwrap();
    assert_eq!(found.id, exam[0].id);
    assert!(matches!(
        resolve_note(session.store(), "zzzz"),
        Err(CliError::NotFound { .. })
    ));
    session.close().await.unwrap();
}

#[tokio::test]
async fn offline_notes_reach_the_replica_on_the_next_sync() {
    let tmp = tempdir().unwrap();
    let online = device_paths(tmp.path(), "phone");
    let offline = Paths {
        offline: true,
        ..online.clone()
    };

    run_add(add_options(&["written on a train".to_string()], &[]), &offline)
        .await
        .unwrap();
    assert!(!online.remote_path.exists());

    let (owner, note_id) = {
        let session = Session::open(&offline).await.unwrap();
        let notes = list_notes(&session, None, None, 10).unwrap();
        assert_eq!(session.store().tracker().pending_count().unwrap(), 1);
        let ids = (session.client().owner_id(), notes[0].id);
        session.close().await.unwrap();
        ids
    };

    run_sync(false, &online).await.unwrap();

    let replica = MemoryReplica::load_snapshot(&online.remote_path).unwrap();
    let record = replica
        .record(owner, RecordKind::Note, &note_id.as_str())
        .unwrap();
    assert!(!record.deleted);
    assert_eq!(record.document["content"], "written on a train");

    let session = Session::open(&online).await.unwrap();
    assert_eq!(session.store().tracker().pending_count().unwrap(), 0);
    session.close().await.unwrap();
}

#[tokio::test]
async fn deleting_a_folder_keeps_its_notes() {
    let tmp = tempdir().unwrap();
    let paths = device_paths(tmp.path(), "desktop");

    run_folder_add(&["Physics".to_string()], &paths).await.unwrap();
    let folder_id = {
        let session = Session::open(&paths).await.unwrap();
        let folders = session.store().query::<Folder>(|_| true).unwrap();
        session.close().await.unwrap();
        folders[0].id.to_string()
    };

    let content = vec!["Newton's laws".to_string()];
    let options = AddOptions {
        folder: Some(&folder_id),
        ..add_options(&content, &[])
    };
    run_add(options, &paths).await.unwrap();

    {
        let session = Session::open(&paths).await.unwrap();
        let folders = list_folders(&session).unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].notes, 1);
        let filed = list_notes(&session, None, Some(&folder_id), 10).unwrap();
        assert_eq!(filed.len(), 1);
        session.close().await.unwrap();
    }

    run_folder_delete(&folder_id, &paths).await.unwrap();

    let session = Session::open(&paths).await.unwrap();
    assert!(list_folders(&session).unwrap().is_empty());
    let notes = list_notes(&session, None, None, 10).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].folder_id, None);
    session.close().await.unwrap();
}

#[tokio::test]
async fn referral_between_two_installs_credits_once() {
    let tmp = tempdir().unwrap();
    let referrer_paths = device_paths(tmp.path(), "referrer");
    let referee_paths = device_paths(tmp.path(), "referee");

    let (referrer, code) = {
        let session = Session::open(&referrer_paths).await.unwrap();
        let profile = session.client().profile().unwrap();
        session.close().await.unwrap();
        (profile.id, profile.referral_code.unwrap())
    };

    run_referral_redeem(&code.to_lowercase(), &referee_paths)
        .await
        .unwrap();
    let again = run_referral_redeem(&code, &referee_paths).await.unwrap_err();
    assert!(matches!(
        again,
        CliError::Ledger(quill_core::LedgerError::AlreadyUsed)
    ));

    run_referral_qualify(&referee_paths).await.unwrap();
    run_referral_qualify(&referee_paths).await.unwrap();

    let session = Session::open(&referrer_paths).await.unwrap();
    assert_eq!(session.client().profile().unwrap().credits, 1);
    let audit = session.client().ledger().audit(referrer).await.unwrap();
    assert_eq!(audit.awarded_referrals, 1);
    assert!(check_audit(&audit).is_ok());
    session.close().await.unwrap();
}
