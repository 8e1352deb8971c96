//! Background sync scheduler
//!
//! One task drives the state machine
//! `Idle -> Scheduled -> Pushing -> Pulling -> Idle`, entering `Backoff` when
//! a cycle fails. Local mutations (re)start a debounce timer, so a burst of
//! edits produces one push. An offline-to-online transition skips any pending
//! backoff and schedules a cycle right away.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SyncSettings;
use crate::db::KeyValueStore;
use crate::error::Error;
use crate::models::{RecordKind, UserId};
use crate::store::{ApplyOutcome, LocalStore};
use crate::sync::backoff::Backoff;
use crate::sync::connectivity::ConnectivityMonitor;
use crate::sync::remote::{with_timeout, ChangeCursor, RemoteError, RemoteRecord, RemoteReplica};
use crate::util::compact_text;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] Error),
    #[error("Device is offline")]
    Offline,
    #[error("Sync scheduler has stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Scheduled,
    Pushing,
    Pulling,
    Backoff,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Scheduled => "scheduled",
            Self::Pushing => "pushing",
            Self::Pulling => "pulling",
            Self::Backoff => "backoff",
        };
        f.write_str(label)
    }
}

/// Snapshot of the scheduler, published after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub online: bool,
    /// Dirty records not yet acknowledged by the remote
    pub pending: usize,
    pub consecutive_failures: u32,
    /// Failures reached the surfacing ceiling
    pub stalled: bool,
    pub last_error: Option<String>,
    pub last_synced_at: Option<i64>,
    /// Completed cycles since start
    pub cycles: u64,
}

/// A record the remote refused; its dirty flag has been cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncWarning {
    pub kind: RecordKind,
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Records acknowledged by the remote
    pub pushed: usize,
    /// Remote changes read
    pub pulled: usize,
    /// Remote changes that replaced local state
    pub applied: usize,
    pub warnings: Vec<SyncWarning>,
}

enum Command {
    Flush(oneshot::Sender<Result<SyncReport, SyncError>>),
}

/// Pushes dirty records and pulls remote changes for one owner.
pub struct SyncScheduler {
    store: LocalStore,
    remote: Arc<dyn RemoteReplica>,
    kv: Arc<dyn KeyValueStore>,
    connectivity: ConnectivityMonitor,
    owner_id: UserId,
    settings: SyncSettings,
    backoff: Backoff,
    status: Arc<watch::Sender<SyncStatus>>,
}

impl SyncScheduler {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteReplica>,
        kv: Arc<dyn KeyValueStore>,
        connectivity: ConnectivityMonitor,
        owner_id: UserId,
        settings: SyncSettings,
    ) -> Self {
        let initial = SyncStatus {
            phase: SyncPhase::Idle,
            online: connectivity.is_online(),
            pending: store.tracker().pending_count().unwrap_or_default(),
            consecutive_failures: 0,
            stalled: false,
            last_error: None,
            last_synced_at: None,
            cycles: 0,
        };
        let (status, _) = watch::channel(initial);
        Self {
            store,
            remote,
            kv,
            connectivity,
            owner_id,
            backoff: Backoff::from_settings(&settings),
            settings,
            status: Arc::new(status),
        }
    }

    /// Start the background task.
    pub fn spawn(self) -> SyncHandle {
        let (commands, command_rx) = mpsc::channel(8);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let status = self.status.subscribe();
        let task = tokio::spawn(self.run(command_rx, shutdown_rx));
        SyncHandle {
            commands,
            status,
            shutdown,
            task: Some(task),
        }
    }

    fn cursor_key(&self) -> String {
        format!("sync.cursor.{}", self.owner_id)
    }

    fn load_cursor(&self) -> Result<ChangeCursor, SyncError> {
        let cursor = self
            .kv
            .get(&self.cursor_key())?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();
        Ok(cursor)
    }

    fn publish(&self, update: impl FnOnce(&mut SyncStatus)) {
        let pending = self.store.tracker().pending_count();
        self.status.send_modify(|status| {
            update(status);
            if let Ok(pending) = pending {
                status.pending = pending;
            }
        });
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.publish(|status| status.phase = phase);
    }

    /// Run one push-then-pull cycle now.
    pub async fn run_cycle(&self) -> Result<SyncReport, SyncError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        let mut report = SyncReport::default();

        self.set_phase(SyncPhase::Pushing);
        self.push(&mut report).await?;

        self.set_phase(SyncPhase::Pulling);
        self.pull(&mut report).await?;

        tracing::debug!(
            pushed = report.pushed,
            pulled = report.pulled,
            applied = report.applied,
            warnings = report.warnings.len(),
            "Sync cycle finished"
        );
        Ok(report)
    }

    async fn push(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let timeout = self.settings.network_timeout();
        while let Some(lease) = self.store.tracker().drain(self.settings.batch_size)? {
            let mut rejected = Vec::new();
            let mut records = Vec::with_capacity(lease.len());
            for change in lease.changes() {
                if change.owner_id == self.owner_id {
                    records.push(RemoteRecord::from(change));
                } else {
                    rejected.push(SyncWarning {
                        kind: change.kind,
                        id: change.id.clone(),
                        reason: "record belongs to another identity".to_string(),
                    });
                }
            }

            let outcome = if records.is_empty() {
                Default::default()
            } else {
                match with_timeout(timeout, self.remote.put_batch(self.owner_id, records)).await {
                    Ok(outcome) => outcome,
                    Err(error) if error.is_transient() => {
                        let requeued = lease.requeue()?;
                        tracing::debug!(requeued, %error, "Push failed; batch re-queued");
                        return Err(error.into());
                    }
                    // Non-transient failures drop the whole batch as rejected
                    Err(error) => {
                        let reason = compact_text(&error.to_string());
                        rejected.extend(
                            lease
                                .changes()
                                .iter()
                                .filter(|change| change.owner_id == self.owner_id)
                                .map(|change| SyncWarning {
                                    kind: change.kind,
                                    id: change.id.clone(),
                                    reason: reason.clone(),
                                }),
                        );
                        Default::default()
                    }
                }
            };

            rejected.extend(outcome.rejected.into_iter().map(|rejection| SyncWarning {
                kind: rejection.kind,
                id: rejection.id,
                reason: rejection.reason,
            }));
            for warning in &rejected {
                tracing::warn!(
                    kind = %warning.kind,
                    id = %warning.id,
                    reason = %warning.reason,
                    "Remote rejected write; dropping it from the push queue"
                );
            }

            let refused: BTreeSet<(RecordKind, String)> = rejected
                .iter()
                .map(|warning| (warning.kind, warning.id.clone()))
                .collect();
            report.pushed += lease
                .changes()
                .iter()
                .filter(|change| !refused.contains(&(change.kind, change.id.clone())))
                .count();
            lease.settle(&refused.into_iter().collect::<Vec<_>>())?;
            report.warnings.extend(rejected);
        }
        Ok(())
    }

    async fn pull(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let timeout = self.settings.network_timeout();
        let mut cursor = self.load_cursor()?;
        loop {
            let page = with_timeout(
                timeout,
                self.remote
                    .query_changed_since(self.owner_id, cursor, self.settings.pull_page_size),
            )
            .await?;

            for change in &page.changes {
                report.pulled += 1;
                match self.store.apply_remote(&change.record) {
                    Ok(ApplyOutcome::Applied) => report.applied += 1,
                    Ok(ApplyOutcome::KeptLocal | ApplyOutcome::Unchanged) => {}
                    Err(error @ (Error::Database(_) | Error::Io(_))) => return Err(error.into()),
                    Err(error) => {
                        tracing::warn!(
                            kind = %change.record.kind,
                            id = %change.record.id,
                            %error,
                            "Skipping unusable remote change"
                        );
                    }
                }
            }

            if page.cursor > cursor {
                cursor = page.cursor;
                self.kv.set(&self.cursor_key(), &cursor.to_string())?;
            }
            if !page.has_more || page.changes.is_empty() {
                return Ok(());
            }
        }
    }

    /// Fold a cycle result into the failure count and next deadline.
    fn settle_cycle(
        &self,
        result: &Result<SyncReport, SyncError>,
        failures: &mut u32,
    ) -> Option<Instant> {
        match result {
            Ok(_) => {
                *failures = 0;
                let pending = self.store.tracker().pending_count().unwrap_or_default();
                let phase = if pending > 0 {
                    SyncPhase::Scheduled
                } else {
                    SyncPhase::Idle
                };
                self.publish(|status| {
                    status.phase = phase;
                    status.consecutive_failures = 0;
                    status.stalled = false;
                    status.last_error = None;
                    status.last_synced_at = Some(chrono::Utc::now().timestamp_millis());
                    status.cycles += 1;
                });
                (pending > 0).then(|| Instant::now() + self.settings.debounce())
            }
            Err(SyncError::Offline | SyncError::Stopped) => {
                self.set_phase(SyncPhase::Idle);
                None
            }
            Err(error) => {
                *failures = failures.saturating_add(1);
                let delay = self.backoff.delay(*failures);
                let stalled = *failures >= self.settings.surface_after_failures;
                if *failures == self.settings.surface_after_failures {
                    tracing::error!(failures = *failures, %error, "Sync keeps failing");
                } else {
                    tracing::warn!(failures = *failures, ?delay, %error, "Sync cycle failed; backing off");
                }
                let message = compact_text(&error.to_string());
                let failures = *failures;
                self.publish(|status| {
                    status.phase = SyncPhase::Backoff;
                    status.consecutive_failures = failures;
                    status.stalled = stalled;
                    status.last_error = Some(message);
                });
                Some(Instant::now() + delay)
            }
        }
    }

    /// Run a cycle unless shutdown arrives first. Dropping the cycle drops
    /// its batch lease, which re-queues the batch.
    async fn cycle_or_shutdown(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Result<SyncReport, SyncError>> {
        tokio::select! {
            result = self.run_cycle() => Some(result),
            _ = shutdown.changed() => {
                tracing::info!("Sync cycle cancelled by shutdown");
                None
            }
        }
    }

    async fn run(self, mut commands: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        let mut mutations = self.store.subscribe_mutations();
        let mut online = self.connectivity.subscribe();
        let mut notices = self.remote.listen(self.owner_id);
        let mut failures = 0;
        let mut deadline = Some(Instant::now());
        self.set_phase(SyncPhase::Scheduled);
        tracing::debug!(owner = %self.owner_id, "Sync scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                command = commands.recv() => {
                    let Some(Command::Flush(reply)) = command else { break };
                    let Some(result) = self.cycle_or_shutdown(&mut shutdown).await else { break };
                    deadline = self.settle_cycle(&result, &mut failures);
                    // The caller may have given up waiting
                    let _ = reply.send(result);
                }
                Ok(()) = online.changed() => {
                    let is_online = *online.borrow_and_update();
                    self.publish(|status| status.online = is_online);
                    if is_online {
                        deadline = Some(Instant::now());
                        self.set_phase(SyncPhase::Scheduled);
                    }
                }
                Ok(()) = mutations.changed() => {
                    deadline = Some(Instant::now() + self.settings.debounce());
                    self.set_phase(SyncPhase::Scheduled);
                }
                Some(seq) = next_notice(&mut notices) => {
                    let seen = self.load_cursor().unwrap_or_default();
                    if seq > seen && deadline.is_none() {
                        deadline = Some(Instant::now() + self.settings.debounce());
                        self.set_phase(SyncPhase::Scheduled);
                    }
                }
                () = sleep_until(deadline) => {
                    deadline = None;
                    if !self.connectivity.is_online() {
                        self.set_phase(SyncPhase::Idle);
                        continue;
                    }
                    let Some(result) = self.cycle_or_shutdown(&mut shutdown).await else { break };
                    deadline = self.settle_cycle(&result, &mut failures);
                }
            }
        }

        self.set_phase(SyncPhase::Idle);
        tracing::debug!(owner = %self.owner_id, "Sync scheduler stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Next change notice; a lagged receiver still means "something changed".
async fn next_notice(
    notices: &mut Option<broadcast::Receiver<ChangeCursor>>,
) -> Option<ChangeCursor> {
    let Some(receiver) = notices.as_mut() else {
        return std::future::pending().await;
    };
    match receiver.recv().await {
        Ok(seq) => Some(seq),
        Err(broadcast::error::RecvError::Lagged(_)) => Some(ChangeCursor::MAX),
        Err(broadcast::error::RecvError::Closed) => {
            *notices = None;
            None
        }
    }
}

/// Handle to a running scheduler.
///
/// Dropping the handle stops the task; [`SyncHandle::shutdown`] also waits
/// for it to finish.
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SyncStatus>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Push and pull immediately, bypassing the debounce window.
    pub async fn flush_now(&self) -> Result<SyncReport, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Flush(reply))
            .await
            .map_err(|_| SyncError::Stopped)?;
        response.await.map_err(|_| SyncError::Stopped)?
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop the scheduler, cancelling any cycle in flight.
    pub async fn shutdown(mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                tracing::error!(%error, "Sync scheduler task failed");
            }
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    use super::*;
    use crate::db::MemoryKeyValueStore;
    use crate::models::Note;
    use crate::sync::memory::MemoryReplica;
    use crate::sync::remote::{ChangePage, DocKey, DocWrite, Precondition, PushOutcome, VersionedDoc};
    use pretty_assertions::assert_eq;

    #[derive(Clone)]
    enum PushFailure {
        Reject(String),
        Hang,
    }

    /// A replica whose pushes can be made to fail on demand
    #[derive(Default)]
    struct ScriptedReplica {
        inner: MemoryReplica,
        failure: Mutex<Option<PushFailure>>,
        put_calls: AtomicUsize,
    }

    impl ScriptedReplica {
        fn fail_pushes(&self, failure: Option<PushFailure>) {
            *self.failure.lock() = failure;
        }

        fn put_calls(&self) -> usize {
            self.put_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteReplica for ScriptedReplica {
        async fn put_batch(
            &self,
            owner_id: UserId,
            records: Vec<RemoteRecord>,
        ) -> Result<PushOutcome, RemoteError> {
            self.put_calls.fetch_add(1, Ordering::SeqCst);
            let failure = self.failure.lock().clone();
            match failure {
                Some(PushFailure::Reject(reason)) => Err(RemoteError::Rejected(reason)),
                Some(PushFailure::Hang) => std::future::pending().await,
                None => self.inner.put_batch(owner_id, records).await,
            }
        }

        async fn query_changed_since(
            &self,
            owner_id: UserId,
            cursor: ChangeCursor,
            limit: usize,
        ) -> Result<ChangePage, RemoteError> {
            self.inner.query_changed_since(owner_id, cursor, limit).await
        }

        async fn get_documents(
            &self,
            keys: &[DocKey],
        ) -> Result<Vec<Option<VersionedDoc>>, RemoteError> {
            self.inner.get_documents(keys).await
        }

        async fn find_documents(
            &self,
            collection: &str,
            field: &str,
            value: &Value,
        ) -> Result<Vec<(DocKey, VersionedDoc)>, RemoteError> {
            self.inner.find_documents(collection, field, value).await
        }

        async fn commit(
            &self,
            preconditions: Vec<Precondition>,
            writes: Vec<DocWrite>,
        ) -> Result<(), RemoteError> {
            self.inner.commit(preconditions, writes).await
        }

        fn listen(&self, owner_id: UserId) -> Option<broadcast::Receiver<ChangeCursor>> {
            self.inner.listen(owner_id)
        }
    }

    fn start_scripted(
        settings: SyncSettings,
    ) -> (LocalStore, Arc<ScriptedReplica>, UserId, SyncHandle) {
        let store = LocalStore::open_in_memory().unwrap();
        let remote = Arc::new(ScriptedReplica::default());
        let owner = UserId::new();
        let handle = SyncScheduler::new(
            store.clone(),
            remote.clone(),
            Arc::new(MemoryKeyValueStore::new()),
            ConnectivityMonitor::new(true),
            owner,
            settings,
        )
        .spawn();
        (store, remote, owner, handle)
    }

    struct Harness {
        store: LocalStore,
        remote: Arc<MemoryReplica>,
        connectivity: ConnectivityMonitor,
        owner: UserId,
        handle: SyncHandle,
    }

    fn start() -> Harness {
        let store = LocalStore::open_in_memory().unwrap();
        let remote = Arc::new(MemoryReplica::new());
        let connectivity = ConnectivityMonitor::new(true);
        let owner = UserId::new();
        let handle = SyncScheduler::new(
            store.clone(),
            remote.clone(),
            Arc::new(MemoryKeyValueStore::new()),
            connectivity.clone(),
            owner,
            SyncSettings::default(),
        )
        .spawn();
        Harness {
            store,
            remote,
            connectivity,
            owner,
            handle,
        }
    }

    async fn wait_for_cycles(handle: &SyncHandle, cycles: u64) -> SyncStatus {
        handle
            .subscribe_status()
            .wait_for(|status| status.cycles >= cycles && status.phase == SyncPhase::Idle)
            .await
            .unwrap()
            .clone()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_edits_is_pushed_once() {
        let h = start();
        wait_for_cycles(&h.handle, 1).await;

        let mut note = h.store.put(Note::new(h.owner, "", "draft 0")).unwrap();
        for version in 1..10 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            note.content = format!("draft {version}");
            note = h.store.put(note).unwrap();
        }
        assert_eq!(h.remote.put_batch_calls(), 0, "debounce window keeps resetting");

        let status = wait_for_cycles(&h.handle, 2).await;
        assert_eq!(status.pending, 0);
        assert_eq!(h.remote.put_batch_calls(), 1);
        let stored = h
            .remote
            .record(h.owner, RecordKind::Note, &note.id.as_str())
            .unwrap();
        assert_eq!(stored.document["content"], "draft 9");
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_remote_backs_off_and_recovers_when_online() {
        let h = start();
        wait_for_cycles(&h.handle, 1).await;

        h.remote.set_online(false);
        let note = h.store.put(Note::new(h.owner, "", "written offline")).unwrap();
        let status = h
            .handle
            .subscribe_status()
            .wait_for(|status| status.phase == SyncPhase::Backoff)
            .await
            .unwrap()
            .clone();
        assert!(status.consecutive_failures >= 1);
        assert_eq!(status.pending, 1);
        assert!(h.store.note(&note.id).is_ok(), "local read never depends on the remote");

        h.remote.set_online(true);
        h.connectivity.set_online(false);
        h.connectivity.set_online(true);

        let status = wait_for_cycles(&h.handle, 2).await;
        assert_eq!(status.consecutive_failures, 0);
        assert!(h
            .remote
            .record(h.owner, RecordKind::Note, &note.id.as_str())
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_now_reports_offline() {
        let h = start();
        h.connectivity.set_online(false);
        h.store.put(Note::new(h.owner, "", "queued")).unwrap();

        let error = h.handle.flush_now().await.unwrap_err();
        assert!(matches!(error, SyncError::Offline));
        assert_eq!(h.remote.put_batch_calls(), 0);
        assert_eq!(h.store.tracker().pending_count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_now_pushes_immediately_and_surfaces_rejections() {
        let store = LocalStore::open_in_memory().unwrap();
        let remote = Arc::new(MemoryReplica::new().with_max_document_bytes(512));
        let owner = UserId::new();
        let handle = SyncScheduler::new(
            store.clone(),
            remote.clone(),
            Arc::new(MemoryKeyValueStore::new()),
            ConnectivityMonitor::new(true),
            owner,
            SyncSettings::default(),
        )
        .spawn();

        let small = store.put(Note::new(owner, "", "fits")).unwrap();
        let large = store.put(Note::new(owner, "", "x".repeat(2_000))).unwrap();

        let report = handle.flush_now().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].id, large.id.as_str());
        assert!(remote.record(owner, RecordKind::Note, &small.id.as_str()).is_some());
        assert_eq!(store.tracker().pending_count().unwrap(), 0, "rejected writes are not retried");
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_are_surfaced_as_stalled() {
        let store = LocalStore::open_in_memory().unwrap();
        let remote = Arc::new(MemoryReplica::new());
        remote.set_online(false);
        let owner = UserId::new();
        let settings = SyncSettings {
            surface_after_failures: 3,
            ..SyncSettings::default()
        };
        let handle = SyncScheduler::new(
            store.clone(),
            remote,
            Arc::new(MemoryKeyValueStore::new()),
            ConnectivityMonitor::new(true),
            owner,
            settings,
        )
        .spawn();
        store.put(Note::new(owner, "", "never lands")).unwrap();

        let status = handle
            .subscribe_status()
            .wait_for(|status| status.stalled)
            .await
            .unwrap()
            .clone();
        assert!(status.consecutive_failures >= 3);
        assert!(status.last_error.is_some());
        assert_eq!(store.tracker().pending_count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_batches_are_dropped_without_backoff() {
        let settings = SyncSettings {
            batch_size: 1,
            ..SyncSettings::default()
        };
        let (store, remote, owner, handle) = start_scripted(settings);
        wait_for_cycles(&handle, 1).await;
        remote.fail_pushes(Some(PushFailure::Reject("quota exceeded".to_string())));

        for content in ["one", "two", "three"] {
            store.put(Note::new(owner, "", content)).unwrap();
        }
        let report = handle.flush_now().await.unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(report.warnings.len(), 3);
        assert!(report.warnings.iter().all(|warning| warning.reason.contains("quota exceeded")));
        assert_eq!(remote.put_calls(), 3);
        assert_eq!(store.tracker().pending_count().unwrap(), 0);

        let status = handle.status();
        assert_eq!(status.consecutive_failures, 0);
        assert_ne!(status.phase, SyncPhase::Backoff);

        let report = handle.flush_now().await.unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(remote.put_calls(), 3, "dropped writes are not pushed again");
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_push_times_out_and_keeps_the_batch() {
        let (store, remote, owner, handle) = start_scripted(SyncSettings::default());
        wait_for_cycles(&handle, 1).await;
        remote.fail_pushes(Some(PushFailure::Hang));

        let note = store.put(Note::new(owner, "", "slow network")).unwrap();
        let status = handle
            .subscribe_status()
            .wait_for(|status| status.phase == SyncPhase::Backoff)
            .await
            .unwrap()
            .clone();
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.unwrap().contains("timed out"));
        assert_eq!(status.pending, 1);
        assert_eq!(store.tracker().pending_count().unwrap(), 1);

        remote.fail_pushes(None);
        handle.flush_now().await.unwrap();
        assert_eq!(store.tracker().pending_count().unwrap(), 0);
        assert!(remote
            .inner
            .record(owner, RecordKind::Note, &note.id.as_str())
            .is_some());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_push_requeues_the_batch() {
        let settings = SyncSettings {
            network_timeout_ms: 24 * 60 * 60 * 1_000,
            ..SyncSettings::default()
        };
        let (store, remote, owner, handle) = start_scripted(settings);
        wait_for_cycles(&handle, 1).await;
        remote.fail_pushes(Some(PushFailure::Hang));

        store.put(Note::new(owner, "", "in flight")).unwrap();
        handle
            .subscribe_status()
            .wait_for(|status| status.phase == SyncPhase::Pushing)
            .await
            .unwrap();
        assert_eq!(remote.put_calls(), 1);

        handle.shutdown().await;
        assert_eq!(store.tracker().pending_count().unwrap(), 1);
        let lease = store.tracker().drain(10).unwrap().unwrap();
        assert_eq!(lease.len(), 1);
        assert_eq!(lease.changes()[0].document["content"], "in flight");
    }
}
