//! Exactly-once referral credits across devices sharing one replica.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use quill_core::config::ReferralSettings;
use quill_core::models::UserId;
use quill_core::sync::{
    ChangeCursor, ChangePage, DocKey, DocWrite, Precondition, PushOutcome, RemoteError,
    RemoteRecord, VersionedDoc,
};
use quill_core::{
    AwardOutcome, LedgerError, LocalStore, MemoryReplica, ReferralLedger, RemoteReplica,
};
use serde_json::Value;

fn ledger_on(remote: &Arc<MemoryReplica>) -> ReferralLedger {
    ReferralLedger::new(
        remote.clone(),
        LocalStore::open_in_memory().unwrap(),
        ReferralSettings::default(),
    )
}

/// Loses the connection right after the next successful commit
struct DropsAfterCommit {
    inner: Arc<MemoryReplica>,
    armed: AtomicBool,
    dropped: AtomicBool,
}

impl DropsAfterCommit {
    fn new(inner: Arc<MemoryReplica>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.dropped.load(Ordering::SeqCst) {
            Err(RemoteError::Unavailable("connection dropped".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteReplica for DropsAfterCommit {
    async fn put_batch(
        &self,
        owner_id: UserId,
        records: Vec<RemoteRecord>,
    ) -> Result<PushOutcome, RemoteError> {
        self.check()?;
        self.inner.put_batch(owner_id, records).await
    }

    async fn query_changed_since(
        &self,
        owner_id: UserId,
        cursor: ChangeCursor,
        limit: usize,
    ) -> Result<ChangePage, RemoteError> {
        self.check()?;
        self.inner.query_changed_since(owner_id, cursor, limit).await
    }

    async fn get_documents(&self, keys: &[DocKey]) -> Result<Vec<Option<VersionedDoc>>, RemoteError> {
        self.check()?;
        self.inner.get_documents(keys).await
    }

    async fn find_documents(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(DocKey, VersionedDoc)>, RemoteError> {
        self.check()?;
        self.inner.find_documents(collection, field, value).await
    }

    async fn commit(
        &self,
        preconditions: Vec<Precondition>,
        writes: Vec<DocWrite>,
    ) -> Result<(), RemoteError> {
        self.check()?;
        self.inner.commit(preconditions, writes).await?;
        if self.armed.load(Ordering::SeqCst) {
            self.dropped.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

async fn assert_invariant(ledger: &ReferralLedger, user_id: UserId, expected_credits: u64) {
    let audit = ledger.audit(user_id).await.unwrap();
    assert!(audit.is_consistent(), "ledger invariant broken: {audit:?}");
    assert_eq!(audit.credits, expected_credits);
}

#[tokio::test]
async fn retried_redemption_credits_the_referrer_once() {
    let remote = Arc::new(MemoryReplica::new());
    let referrer_device = ledger_on(&remote);
    let referee_device = ledger_on(&remote);

    let referrer = referrer_device.open_account(UserId::new()).await.unwrap();
    let referee = referee_device.open_account(UserId::new()).await.unwrap();
    let code = referrer.referral_code.clone().unwrap();

    referee_device.redeem(&code, referee.id).await.unwrap();
    assert_invariant(&referrer_device, referrer.id, 0).await;

    referee_device.qualify(referee.id).await.unwrap();
    assert_invariant(&referrer_device, referrer.id, 1).await;

    let commits = remote.commit_calls();
    let retry = referee_device.redeem(&code, referee.id).await.unwrap_err();
    assert!(matches!(retry, LedgerError::AlreadyUsed));
    assert_eq!(remote.commit_calls(), commits, "a refused redemption writes nothing");
    assert_eq!(
        referee_device.qualify(referee.id).await.unwrap(),
        AwardOutcome::AlreadyAwarded
    );
    assert_invariant(&referrer_device, referrer.id, 1).await;

    let refreshed = referrer_device.refresh_profile(referrer.id).await.unwrap();
    assert_eq!(refreshed.credits, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_qualification_from_two_devices_awards_once() {
    let remote = Arc::new(MemoryReplica::new());
    let setup = ledger_on(&remote);
    let referrer = setup.open_account(UserId::new()).await.unwrap();
    let referee = setup.open_account(UserId::new()).await.unwrap();
    setup
        .redeem(referrer.referral_code.as_deref().unwrap(), referee.id)
        .await
        .unwrap();

    let devices: Vec<_> = (0..4).map(|_| Arc::new(ledger_on(&remote))).collect();
    let tasks: Vec<_> = devices
        .iter()
        .cloned()
        .map(|device| tokio::spawn(async move { device.qualify(referee.id).await }))
        .collect();

    let mut awarded = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(AwardOutcome::Awarded { referrer_id, .. }) => {
                assert_eq!(referrer_id, referrer.id);
                awarded += 1;
            }
            Ok(AwardOutcome::AlreadyAwarded) => {}
            // A device that loses every retry gives up without writing
            Err(LedgerError::Remote(error)) => assert!(!error.is_transient()),
            Err(error) => panic!("unexpected ledger error: {error}"),
        }
    }
    assert_eq!(awarded, 1);
    assert_invariant(&setup, referrer.id, 1).await;
}

#[tokio::test]
async fn concurrent_redemptions_by_one_referee_land_once() {
    let remote = Arc::new(MemoryReplica::new());
    let phone = ledger_on(&remote);
    let tablet = ledger_on(&remote);

    let first = phone.open_account(UserId::new()).await.unwrap();
    let second = phone.open_account(UserId::new()).await.unwrap();
    let referee = tablet.open_account(UserId::new()).await.unwrap();

    let (a, b) = tokio::join!(
        phone.redeem(first.referral_code.as_deref().unwrap(), referee.id),
        tablet.redeem(second.referral_code.as_deref().unwrap(), referee.id),
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|result| matches!(result, Err(LedgerError::AlreadyUsed))));
}

#[tokio::test]
async fn own_code_is_always_self_referral() {
    let remote = Arc::new(MemoryReplica::new());
    let ledger = ledger_on(&remote);
    let user = ledger.open_account(UserId::new()).await.unwrap();
    let code = user.referral_code.unwrap();

    for attempt in [code.clone(), code.to_lowercase(), format!("  {code} ")] {
        let error = ledger.redeem(&attempt, user.id).await.unwrap_err();
        assert!(matches!(error, LedgerError::SelfReferral));
    }
    assert_invariant(&ledger, user.id, 0).await;
}

#[tokio::test]
async fn redemption_stands_when_the_profile_refresh_fails() {
    let remote = Arc::new(MemoryReplica::new());
    let healthy = ledger_on(&remote);
    let referrer = healthy.open_account(UserId::new()).await.unwrap();
    let referee = healthy.open_account(UserId::new()).await.unwrap();
    let code = referrer.referral_code.unwrap();

    let flaky = Arc::new(DropsAfterCommit::new(remote.clone()));
    let device = ReferralLedger::new(
        flaky.clone(),
        LocalStore::open_in_memory().unwrap(),
        ReferralSettings::default(),
    );
    flaky.armed.store(true, Ordering::SeqCst);

    let event = device.redeem(&code, referee.id).await.unwrap();
    assert_eq!(event.referrer_id, referrer.id);
    assert!(flaky.dropped.load(Ordering::SeqCst));

    let retry = healthy.redeem(&code, referee.id).await.unwrap_err();
    assert!(matches!(retry, LedgerError::AlreadyUsed));
    let profile = healthy.refresh_profile(referee.id).await.unwrap();
    assert_eq!(profile.used_referral_code, Some(code));
}
