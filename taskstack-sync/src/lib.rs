//! Sync layer for TaskStack.
//!
//! - [`EventApplicator`]: deterministic, idempotent folding of events into
//!   projections (conflict resolution)
//! - [`EventLedger`]: the local write path for entity services
//! - [`SyncManager`]: push-then-pull cycles over a [`SyncTransport`]
//! - [`Bootstrapper`]: resumable initial full pull behind a [`ReadyGate`]
//!
//! # Architecture
//!
//! ```text
//!   entity services ──record──▶ EventLedger ──┐
//!                                             ├──▶ EventApplicator ──▶ LocalStore
//!   SyncTransport ◀──push/pull── SyncManager ─┘
//! ```
//!
//! Writes for one entity are serialized through [`EntityLocks`]; writes for
//! different entities never wait on each other. All DuckDB access runs in
//! `spawn_blocking`.

mod applicator;
mod bootstrap;
mod config;
mod entity_lock;
mod error;
mod http_transport;
mod ledger;
mod manager;
mod reporter;
mod transport;

pub use applicator::{fold, validate, ApplyOutcome, EventApplicator, Fold};
pub use bootstrap::{BootstrapOutcome, BootstrapProgress, Bootstrapper, ReadyGate};
pub use config::SyncConfig;
pub use entity_lock::{EntityGuard, EntityLocks};
pub use error::{ApplyError, SyncError, SyncResult};
pub use http_transport::HttpSyncTransport;
pub use ledger::EventLedger;
pub use manager::{
    ConnectionStatus, PullReport, PushReport, SyncCommand, SyncEvent, SyncHandle, SyncManager,
    SyncPhase, SyncReport,
};
pub use reporter::{ErrorReport, ErrorReporter, TracingReporter};
pub use transport::{PullPage, PullRequest, PushAck, SyncTransport};

use taskstack_storage::StorageError;

/// Runs blocking storage work off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> SyncResult<T>
where
    F: FnOnce() -> SyncResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(SyncError::Storage(StorageError::Task(e.to_string()))),
    }
}
