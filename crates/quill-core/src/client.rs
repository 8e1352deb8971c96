//! Engine wiring
//!
//! Startup order matters: the identity is resolved first because it
//! partitions every remote document, then the account is opened and the
//! sync scheduler starts for that owner.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::config::EngineConfig;
use crate::db::{Database, KeyValueStore, SqliteKeyValueStore};
use crate::error::Error;
use crate::identity::{Identity, IdentityError, IdentityProvider};
use crate::models::{User, UserId};
use crate::referral::ReferralLedger;
use crate::store::LocalStore;
use crate::sync::{ConnectivityMonitor, RemoteReplica, SyncHandle, SyncScheduler};

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Store(#[from] Error),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// A running engine for one install.
pub struct Client {
    identity: Identity,
    store: LocalStore,
    connectivity: ConnectivityMonitor,
    ledger: ReferralLedger,
    sync: SyncHandle,
}

impl Client {
    /// Open the `SQLite` database at `path` and start the engine over it.
    pub async fn open(
        path: &Path,
        remote: Arc<dyn RemoteReplica>,
        connectivity: ConnectivityMonitor,
        config: EngineConfig,
    ) -> Result<Self, StartError> {
        let db = Database::open(path)?;
        let store = LocalStore::open(db.clone())?;
        let kv = Arc::new(SqliteKeyValueStore::new(db));
        Self::start(store, kv, remote, connectivity, config).await
    }

    /// Start the engine over already-opened storage.
    ///
    /// An unreachable remote does not prevent startup; the account is opened
    /// on a later run and notes keep working locally.
    pub async fn start(
        store: LocalStore,
        kv: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteReplica>,
        connectivity: ConnectivityMonitor,
        config: EngineConfig,
    ) -> Result<Self, StartError> {
        let identity = IdentityProvider::new(kv.clone(), config.identity.restore_timeout())
            .resolve()
            .await?;

        let ledger = ReferralLedger::new(remote.clone(), store.clone(), config.referral);
        if connectivity.is_online() {
            if let Err(error) = ledger.open_account(identity.user_id).await {
                tracing::warn!(%error, "Could not open remote account; continuing with local data");
            }
        }

        let sync = SyncScheduler::new(
            store.clone(),
            remote,
            kv,
            connectivity.clone(),
            identity.user_id,
            config.sync,
        )
        .spawn();

        tracing::debug!(user_id = %identity.user_id, "Engine started");
        Ok(Self {
            identity,
            store,
            connectivity,
            ledger,
            sync,
        })
    }

    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    pub const fn owner_id(&self) -> UserId {
        self.identity.user_id
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn ledger(&self) -> &ReferralLedger {
        &self.ledger
    }

    pub const fn sync(&self) -> &SyncHandle {
        &self.sync
    }

    pub const fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Cached profile, once the account has been opened on some run
    pub fn profile(&self) -> Option<User> {
        self.store.user(&self.identity.user_id).ok()
    }

    /// Stop background sync, cancelling any cycle in flight.
    pub async fn shutdown(self) {
        self.sync.shutdown().await;
    }
}
