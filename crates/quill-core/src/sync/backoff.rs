//! Exponential backoff with full jitter

use std::time::Duration;

use rand::Rng;

use crate::config::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    factor: u32,
    cap_ms: u64,
}

impl Backoff {
    pub const fn new(base_ms: u64, factor: u32, cap_ms: u64) -> Self {
        Self {
            base_ms,
            factor,
            cap_ms,
        }
    }

    pub const fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(
            settings.backoff_base_ms,
            settings.backoff_factor,
            settings.backoff_cap_ms,
        )
    }

    /// Upper bound of the delay before retry number `attempt` (1-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let growth = u64::from(self.factor).saturating_pow(exponent);
        Duration::from_millis(self.base_ms.saturating_mul(growth).min(self.cap_ms))
    }

    /// Random delay in `[0, ceiling(attempt)]`
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(self.cap_ms);
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }
}
