//! Replication between the local store and the remote replica

pub mod backoff;
pub mod connectivity;
pub mod memory;
pub mod remote;
pub mod resolver;
pub mod scheduler;

pub use backoff::Backoff;
pub use connectivity::ConnectivityMonitor;
pub use memory::MemoryReplica;
pub use remote::{
    run_transaction, with_timeout, ChangeCursor, ChangePage, DocKey, DocWrite, Precondition,
    PushOutcome, Rejection, RemoteChange, RemoteError, RemoteRecord, RemoteReplica, TxDecision,
    TxSnapshot, VersionedDoc,
};
pub use resolver::{LocalState, Resolution, Stamp};
pub use scheduler::{SyncError, SyncHandle, SyncPhase, SyncReport, SyncScheduler, SyncStatus, SyncWarning};
