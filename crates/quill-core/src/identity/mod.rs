//! Durable anonymous identity for this install.
//!
//! The identity is the partition key of every remote document the user owns,
//! so minting a fresh one while an old one still exists orphans all prior
//! data. Resolution therefore waits for the durable store to report that its
//! restore has completed before trusting a read, and only mints when nothing
//! turns up within a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::db::{KeyValueStore, RestoreState};
use crate::error::Error;
use crate::models::UserId;

/// Durable key holding the resolved identity
pub const IDENTITY_KEY: &str = "identity.anonymous_id";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Identity storage error: {0}")]
    Storage(#[from] Error),
}

/// Where a resolved identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// Read back from durable storage
    Restored,
    /// Storage restored and held no identity; a new one was minted
    Minted,
    /// Storage never reported a completed restore; a new one was minted
    MintedAfterTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub source: IdentitySource,
}

impl Identity {
    pub const fn is_new(&self) -> bool {
        !matches!(self.source, IdentitySource::Restored)
    }
}

#[derive(Clone)]
pub struct IdentityProvider {
    kv: Arc<dyn KeyValueStore>,
    restore_timeout: Duration,
}

impl IdentityProvider {
    pub fn new(kv: Arc<dyn KeyValueStore>, restore_timeout: Duration) -> Self {
        Self {
            kv,
            restore_timeout,
        }
    }

    /// Restore the persisted identity, minting one only if none exists.
    pub async fn resolve(&self) -> Result<Identity, IdentityError> {
        let restored = self.wait_for_restore().await;

        if let Some(raw) = self.kv.get(IDENTITY_KEY)? {
            match raw.parse::<UserId>() {
                Ok(user_id) => {
                    tracing::debug!(%user_id, "Restored anonymous identity");
                    return Ok(Identity {
                        user_id,
                        source: IdentitySource::Restored,
                    });
                }
                Err(error) => {
                    tracing::error!(%error, "Persisted identity is unreadable; minting a new one");
                }
            }
        }

        let user_id = UserId::new();
        self.kv.set(IDENTITY_KEY, &user_id.as_str())?;
        let source = if restored {
            IdentitySource::Minted
        } else {
            IdentitySource::MintedAfterTimeout
        };
        tracing::info!(%user_id, ?source, "Minted anonymous identity");
        Ok(Identity { user_id, source })
    }

    /// Wait for the store's restore signal. Returns `false` on timeout.
    async fn wait_for_restore(&self) -> bool {
        let mut signal = self.kv.restore_signal();
        let wait = async {
            signal
                .wait_for(|state| *state == RestoreState::Restored)
                .await
                .is_ok()
        };
        match tokio::time::timeout(self.restore_timeout, wait).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!("Storage restore signal closed before restoring");
                false
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.restore_timeout,
                    "Storage restore timed out; a previously persisted identity may be orphaned"
                );
                false
            }
        }
    }
}
