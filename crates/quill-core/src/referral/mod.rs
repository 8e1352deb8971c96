//! Referral credit ledger
//!
//! Codes, redemptions and credits live in three remote collections:
//!
//! - `users/{user_id}`: the [`User`] profile, including its `credits` counter
//! - `referral_codes/{CODE}`: uniqueness registry mapping a code to its owner
//! - `referral_events/{referee_id}`: the [`ReferralEvent`] of one redemption
//!
//! Every write goes through [`run_transaction`], conditioned on the versions
//! of the documents it read. Awarding re-reads the event after a conflict, so
//! a concurrent award that got there first turns the retry into
//! [`AwardOutcome::AlreadyAwarded`] instead of a second increment.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ReferralSettings;
use crate::error::Error;
use crate::models::{ReferralEvent, User, UserId};
use crate::store::LocalStore;
use crate::sync::remote::{
    run_transaction, with_timeout, DocKey, DocWrite, RemoteError, RemoteReplica, TxDecision,
};

pub const USERS: &str = "users";
pub const REFERRAL_CODES: &str = "referral_codes";
pub const REFERRAL_EVENTS: &str = "referral_events";

/// Unambiguous when read aloud or typed: no 0/O, 1/I
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("You cannot redeem your own referral code")]
    SelfReferral,
    #[error("A referral code has already been redeemed for this account")]
    AlreadyUsed,
    #[error("Unknown referral code: {0}")]
    InvalidCode(String),
    #[error("Referral of {0} has not qualified yet")]
    NotQualified(UserId),
    #[error("No account exists for user {0}")]
    UnknownUser(UserId),
    #[error("User {0} has not redeemed a referral code")]
    NoReferral(UserId),
    #[error("No unused referral code found after {0} attempts")]
    CodeSpaceExhausted(u32),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] Error),
}

/// Result of an award attempt. Both variants are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AwardOutcome {
    /// This call credited the referrer
    Awarded { referrer_id: UserId, credits: u64 },
    /// A previous or concurrent call already did
    AlreadyAwarded,
}

/// Recomputed ledger totals for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerAudit {
    pub user_id: UserId,
    pub credits: u64,
    pub awarded_referrals: u64,
    pub expected_credits: u64,
}

impl LedgerAudit {
    pub const fn is_consistent(&self) -> bool {
        self.credits == self.expected_credits
    }
}

/// Registry entry reserving one code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CodeClaim {
    owner_id: UserId,
    claimed_at: i64,
}

fn user_key(id: UserId) -> DocKey {
    DocKey::new(USERS, id.as_str())
}

fn code_key(code: &str) -> DocKey {
    DocKey::new(REFERRAL_CODES, code)
}

fn event_key(referee_id: UserId) -> DocKey {
    DocKey::new(REFERRAL_EVENTS, referee_id.as_str())
}

/// Canonical form of a user-entered code, if it could be one at all.
pub fn normalize_code(raw: &str) -> Option<String> {
    let code: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .map(|c| c.to_ascii_uppercase())
        .collect();
    (!code.is_empty() && code.chars().all(|c| c.is_ascii_alphanumeric())).then_some(code)
}

fn random_code<R: Rng + ?Sized>(length: usize, rng: &mut R) -> String {
    (0..length)
        .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
        .collect()
}

pub struct ReferralLedger {
    remote: Arc<dyn RemoteReplica>,
    store: LocalStore,
    settings: ReferralSettings,
}

impl ReferralLedger {
    pub fn new(remote: Arc<dyn RemoteReplica>, store: LocalStore, settings: ReferralSettings) -> Self {
        Self {
            remote,
            store,
            settings,
        }
    }

    /// Create the remote profile on first run and cache it locally.
    pub async fn open_account(&self, user_id: UserId) -> Result<User, LedgerError> {
        self.generate_code(user_id).await?;
        self.refresh_profile(user_id).await
    }

    /// Read `user_id`'s profile from the remote and cache it.
    pub async fn refresh_profile(&self, user_id: UserId) -> Result<User, LedgerError> {
        let user = self.fetch_user(user_id).await?;
        self.store.cache_user(&user)?;
        Ok(user)
    }

    async fn fetch_user(&self, user_id: UserId) -> Result<User, LedgerError> {
        let key = user_key(user_id);
        let docs = with_timeout(
            self.settings.network_timeout(),
            self.remote.get_documents(std::slice::from_ref(&key)),
        )
        .await?;
        let data = docs
            .into_iter()
            .next()
            .flatten()
            .ok_or(LedgerError::UnknownUser(user_id))?
            .data;
        serde_json::from_value(data)
            .map_err(|error| RemoteError::Malformed(format!("{key}: {error}")).into())
    }

    /// The user's referral code, generating and registering one if needed.
    ///
    /// A fresh code is reserved in the registry in the same transaction that
    /// stores it on the profile; a collision with an existing registration
    /// discards the candidate and tries another.
    pub async fn generate_code(&self, user_id: UserId) -> Result<String, LedgerError> {
        let attempts = self.settings.max_code_attempts.max(1);
        for attempt in 1..=attempts {
            let candidate = random_code(self.settings.code_length, &mut rand::thread_rng());
            let read_set = [user_key(user_id), code_key(&candidate)];

            let outcome = with_timeout(
                self.settings.network_timeout(),
                run_transaction(
                    self.remote.as_ref(),
                    &read_set,
                    self.settings.max_transaction_attempts,
                    |snapshot| {
                        let existing: Option<User> = snapshot.decode(&read_set[0])?;
                        if let Some(code) = existing.as_ref().and_then(|u| u.referral_code.clone()) {
                            return Ok(TxDecision::Abort(Some(code)));
                        }
                        if snapshot.get(&read_set[1]).is_some() {
                            return Ok(TxDecision::Abort(None));
                        }

                        let mut user = existing.unwrap_or_else(|| User::new(user_id));
                        user.referral_code = Some(candidate.clone());
                        let claim = CodeClaim {
                            owner_id: user_id,
                            claimed_at: chrono::Utc::now().timestamp_millis(),
                        };
                        Ok(TxDecision::Commit(
                            vec![
                                DocWrite::encode(read_set[1].clone(), &claim)?,
                                DocWrite::encode(read_set[0].clone(), &user)?,
                            ],
                            Some(candidate.clone()),
                        ))
                    },
                ),
            )
            .await?;

            if let Some(code) = outcome {
                tracing::debug!(%user_id, "Referral code ready");
                return Ok(code);
            }
            tracing::debug!(attempt, "Referral code collision; generating another");
        }
        Err(LedgerError::CodeSpaceExhausted(attempts))
    }

    /// Record that `referee_id` entered `code`.
    ///
    /// A user redeems at most once; the check and the write happen in one
    /// transaction, so concurrent redemptions from two devices cannot both land.
    pub async fn redeem(&self, code: &str, referee_id: UserId) -> Result<ReferralEvent, LedgerError> {
        let code = normalize_code(code).ok_or_else(|| LedgerError::InvalidCode(code.trim().to_string()))?;
        let read_set = [code_key(&code), user_key(referee_id), event_key(referee_id)];

        let result = with_timeout(
            self.settings.network_timeout(),
            run_transaction(
                self.remote.as_ref(),
                &read_set,
                self.settings.max_transaction_attempts,
                |snapshot| {
                    let Some(claim) = snapshot.decode::<CodeClaim>(&read_set[0])? else {
                        return Ok(TxDecision::Abort(Err(LedgerError::InvalidCode(code.clone()))));
                    };
                    if claim.owner_id == referee_id {
                        return Ok(TxDecision::Abort(Err(LedgerError::SelfReferral)));
                    }
                    let Some(mut referee) = snapshot.decode::<User>(&read_set[1])? else {
                        return Ok(TxDecision::Abort(Err(LedgerError::UnknownUser(referee_id))));
                    };
                    if referee.used_referral_code.is_some() || snapshot.get(&read_set[2]).is_some() {
                        return Ok(TxDecision::Abort(Err(LedgerError::AlreadyUsed)));
                    }

                    referee.used_referral_code = Some(code.clone());
                    let event = ReferralEvent::new(claim.owner_id, referee_id, code.clone());
                    Ok(TxDecision::Commit(
                        vec![
                            DocWrite::encode(read_set[1].clone(), &referee)?,
                            DocWrite::encode(read_set[2].clone(), &event)?,
                        ],
                        Ok(event),
                    ))
                },
            ),
        )
        .await?;

        match &result {
            Ok(event) => {
                tracing::info!(referrer = %event.referrer_id, referee = %referee_id, "Referral code redeemed");
                // The redemption is committed; a stale cached profile catches up later
                if let Err(error) = self.refresh_profile(referee_id).await {
                    tracing::warn!(referee = %referee_id, %error, "Could not refresh profile after redemption");
                }
            }
            Err(error) => tracing::debug!(referee = %referee_id, %error, "Referral redemption refused"),
        }
        result
    }

    /// Mark `referee_id`'s referral as qualified, then award the referrer.
    pub async fn qualify(&self, referee_id: UserId) -> Result<AwardOutcome, LedgerError> {
        let key = event_key(referee_id);
        let read_set = [key.clone()];

        let event = with_timeout(
            self.settings.network_timeout(),
            run_transaction(
                self.remote.as_ref(),
                &read_set,
                self.settings.max_transaction_attempts,
                |snapshot| {
                    let Some(mut event) = snapshot.decode::<ReferralEvent>(&key)? else {
                        return Ok(TxDecision::Abort(Err(LedgerError::NoReferral(referee_id))));
                    };
                    if event.is_qualified() {
                        return Ok(TxDecision::Abort(Ok(event)));
                    }
                    event.qualified_at = Some(chrono::Utc::now().timestamp_millis());
                    Ok(TxDecision::Commit(
                        vec![DocWrite::encode(key.clone(), &event)?],
                        Ok(event),
                    ))
                },
            ),
        )
        .await??;

        self.award_credit(&event).await
    }

    /// Credit the referrer of `event` exactly once.
    ///
    /// Reads the event's `credit_awarded` flag and the referrer's counter, and
    /// writes both together only if neither changed since the read.
    pub async fn award_credit(&self, event: &ReferralEvent) -> Result<AwardOutcome, LedgerError> {
        let read_set = [event_key(event.referee_id), user_key(event.referrer_id)];
        let per_referral = self.settings.credits_per_referral;

        let outcome = with_timeout(
            self.settings.network_timeout(),
            run_transaction(
                self.remote.as_ref(),
                &read_set,
                self.settings.max_transaction_attempts,
                |snapshot| {
                    let Some(mut current) = snapshot.decode::<ReferralEvent>(&read_set[0])? else {
                        return Ok(TxDecision::Abort(Err(LedgerError::NoReferral(event.referee_id))));
                    };
                    if current.referrer_id != event.referrer_id {
                        return Err(RemoteError::Malformed(format!(
                            "{} names a different referrer",
                            read_set[0]
                        )));
                    }
                    if current.credit_awarded {
                        return Ok(TxDecision::Abort(Ok(AwardOutcome::AlreadyAwarded)));
                    }
                    if !current.is_qualified() {
                        return Ok(TxDecision::Abort(Err(LedgerError::NotQualified(event.referee_id))));
                    }
                    let Some(mut referrer) = snapshot.decode::<User>(&read_set[1])? else {
                        return Ok(TxDecision::Abort(Err(LedgerError::UnknownUser(event.referrer_id))));
                    };

                    referrer.credits = referrer.credits.saturating_add(per_referral);
                    current.credit_awarded = true;
                    let outcome = AwardOutcome::Awarded {
                        referrer_id: referrer.id,
                        credits: referrer.credits,
                    };
                    Ok(TxDecision::Commit(
                        vec![
                            DocWrite::encode(read_set[1].clone(), &referrer)?,
                            DocWrite::encode(read_set[0].clone(), &current)?,
                        ],
                        Ok(outcome),
                    ))
                },
            ),
        )
        .await??;

        match outcome {
            AwardOutcome::Awarded { referrer_id, credits } => {
                tracing::info!(%referrer_id, referee = %event.referee_id, credits, "Referral credit awarded");
            }
            AwardOutcome::AlreadyAwarded => {
                tracing::debug!(referee = %event.referee_id, "Referral credit already awarded");
            }
        }
        Ok(outcome)
    }

    /// Recompute `user_id`'s credits from its awarded referral events.
    pub async fn audit(&self, user_id: UserId) -> Result<LedgerAudit, LedgerError> {
        let user = self.fetch_user(user_id).await?;
        let events = with_timeout(
            self.settings.network_timeout(),
            self.remote.find_documents(
                REFERRAL_EVENTS,
                "referrer_id",
                &serde_json::Value::String(user_id.as_str()),
            ),
        )
        .await?;

        let mut awarded_referrals = 0_u64;
        for (key, doc) in events {
            let event: ReferralEvent = serde_json::from_value(doc.data)
                .map_err(|error| RemoteError::Malformed(format!("{key}: {error}")))?;
            if event.credit_awarded {
                awarded_referrals += 1;
            }
        }

        let audit = LedgerAudit {
            user_id,
            credits: user.credits,
            awarded_referrals,
            expected_credits: awarded_referrals.saturating_mul(self.settings.credits_per_referral),
        };
        if !audit.is_consistent() {
            tracing::error!(?audit, "Referral ledger invariant violated");
        }
        Ok(audit)
    }
}
