//! Engine configuration.
//!
//! A single JSON document with one section per component. Every field has a
//! default, so a missing file or an empty object yields a working engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MIN_DEBOUNCE_MS: u64 = 100;
const MAX_DEBOUNCE_MS: u64 = 30_000;

/// Sync scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Quiet period after the last mutation before pushing
    pub debounce_ms: u64,
    /// Maximum records per push batch
    pub batch_size: usize,
    /// Maximum changes per pull page
    pub pull_page_size: usize,
    pub backoff_base_ms: u64,
    pub backoff_factor: u32,
    pub backoff_cap_ms: u64,
    /// Bound on every push/pull call
    pub network_timeout_ms: u64,
    /// Consecutive failures after which sync is reported as stalled
    pub surface_after_failures: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            batch_size: 50,
            pull_page_size: 200,
            backoff_base_ms: 1_000,
            backoff_factor: 2,
            backoff_cap_ms: 60_000,
            network_timeout_ms: 12_000,
            surface_after_failures: 8,
        }
    }
}

impl SyncSettings {
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub const fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}

/// Identity restore tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IdentitySettings {
    /// How long to wait for durable storage to finish restoring
    pub restore_timeout_ms: u64,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            restore_timeout_ms: 3_000,
        }
    }
}

impl IdentitySettings {
    pub const fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }
}

/// Referral ledger tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ReferralSettings {
    pub credits_per_referral: u64,
    pub code_length: usize,
    /// Fresh codes to try before giving up on collisions
    pub max_code_attempts: u32,
    /// Re-runs of one transaction after concurrent-write conflicts
    pub max_transaction_attempts: u32,
    pub network_timeout_ms: u64,
}

impl Default for ReferralSettings {
    fn default() -> Self {
        Self {
            credits_per_referral: 1,
            code_length: 8,
            max_code_attempts: 10,
            max_transaction_attempts: 5,
            network_timeout_ms: 12_000,
        }
    }
}

impl ReferralSettings {
    pub const fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub sync: SyncSettings,
    pub identity: IdentitySettings,
    pub referral: ReferralSettings,
}

impl EngineConfig {
    /// Load configuration from a JSON file; a missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config = Self::parse(&raw).map_err(|error| {
            Error::InvalidInput(format!("config at {}: {error}", path.display()))
        })?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON payload
    pub fn parse(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if !(MIN_DEBOUNCE_MS..=MAX_DEBOUNCE_MS).contains(&sync.debounce_ms) {
            return Err(Error::InvalidInput(format!(
                "sync.debounce_ms must be between {MIN_DEBOUNCE_MS} and {MAX_DEBOUNCE_MS}"
            )));
        }
        if sync.batch_size == 0 || sync.pull_page_size == 0 {
            return Err(Error::InvalidInput(
                "sync.batch_size and sync.pull_page_size must be positive".to_string(),
            ));
        }
        if sync.backoff_base_ms == 0 || sync.backoff_factor < 1 {
            return Err(Error::InvalidInput(
                "sync.backoff_base_ms must be positive and sync.backoff_factor at least 1"
                    .to_string(),
            ));
        }
        if sync.backoff_cap_ms < sync.backoff_base_ms {
            return Err(Error::InvalidInput(
                "sync.backoff_cap_ms must not be below sync.backoff_base_ms".to_string(),
            ));
        }
        if sync.network_timeout_ms == 0 || self.referral.network_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "network timeouts must be positive".to_string(),
            ));
        }
        if !(6..=16).contains(&self.referral.code_length) {
            return Err(Error::InvalidInput(
                "referral.code_length must be between 6 and 16".to_string(),
            ));
        }
        if self.referral.credits_per_referral == 0 {
            return Err(Error::InvalidInput(
                "referral.credits_per_referral must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
