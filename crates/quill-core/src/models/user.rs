//! User profile and referral ledger models

use serde::{Deserialize, Serialize};

use super::UserId;

/// The per-install user profile.
///
/// Created once by account bootstrap and afterwards mutated only by the
/// referral ledger; `credits` never changes through the note sync path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// This user's own shareable code
    pub referral_code: Option<String>,
    /// Code this user redeemed, set at most once
    pub used_referral_code: Option<String>,
    pub credits: u64,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl User {
    #[must_use]
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            referral_code: None,
            used_referral_code: None,
            credits: 0,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// One redemption of a referral code, keyed by the referee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralEvent {
    pub referrer_id: UserId,
    pub referee_id: UserId,
    pub code_used: String,
    /// When the code was redeemed (Unix ms)
    pub redeemed_at: i64,
    /// When the referee completed the qualifying action (Unix ms)
    pub qualified_at: Option<i64>,
    /// Flipped exactly once, in the same write that credits the referrer
    pub credit_awarded: bool,
}

impl ReferralEvent {
    #[must_use]
    pub fn new(referrer_id: UserId, referee_id: UserId, code_used: impl Into<String>) -> Self {
        Self {
            referrer_id,
            referee_id,
            code_used: code_used.into(),
            redeemed_at: chrono::Utc::now().timestamp_millis(),
            qualified_at: None,
            credit_awarded: false,
        }
    }

    pub const fn is_qualified(&self) -> bool {
        self.qualified_at.is_some()
    }
}
