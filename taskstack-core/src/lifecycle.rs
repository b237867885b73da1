//! Lifecycle of the local store, sync services and attachment transfers.

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use taskstack_storage::LocalStore;
use taskstack_sync::{
    BootstrapProgress, Bootstrapper, ErrorReporter, EventLedger, HttpSyncTransport, ReadyGate,
    SyncCommand, SyncError, SyncHandle, SyncManager, SyncTransport,
};
use taskstack_transfer::{
    DecisionRequest, HttpObjectStore, LocalCache, NetworkMonitor, RemoteObjectStore,
    TransferCoordinator, TransferStore,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn blocking<T, F>(f: F) -> CoreResult<T>
where
    F: FnOnce() -> CoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CoreError::Task(e.to_string()))?
}

/// Collaborators supplied by the host application.
#[derive(Clone, Default)]
pub struct Host {
    /// Reachability as the platform reports it.
    pub network: NetworkMonitor,
    /// Where cellular and quota prompts go. Without it those transfers fail
    /// with a decision-pending error instead of waiting.
    pub decisions: Option<mpsc::Sender<DecisionRequest>>,
    /// Replaces the default tracing reporter for sync errors.
    pub reporter: Option<Arc<dyn ErrorReporter>>,
}

/// The running TaskStack core.
pub struct Core {
    config: CoreConfig,
    store: LocalStore,
    sync: SyncManager,
    ledger: EventLedger,
    bootstrapper: Arc<Bootstrapper>,
    transfers: TransferCoordinator,
    network: NetworkMonitor,
    handle: SyncHandle,
    /// Taken by [`Core::start`].
    commands: Mutex<Option<mpsc::Receiver<SyncCommand>>>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Opens the core against the HTTP sync and object services named in
    /// `config`.
    pub async fn open(config: CoreConfig, host: Host) -> CoreResult<Self> {
        let transport = Arc::new(HttpSyncTransport::new(&config.sync)?);
        let remote = Arc::new(HttpObjectStore::new(&config.transfer)?);
        Self::open_with(config, host, transport, remote).await
    }

    /// Opens the core with explicit network collaborators.
    ///
    /// Local writes whose projection update never committed are replayed
    /// before this returns. Nothing runs in the background until
    /// [`start`](Self::start).
    pub async fn open_with(
        config: CoreConfig,
        host: Host,
        transport: Arc<dyn SyncTransport>,
        remote: Arc<dyn RemoteObjectStore>,
    ) -> CoreResult<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let db_path = config.database_path();
        let transfers_path = config.transfers_path();
        let cache_dir = config.cache_dir();
        let (store, transfer_store, cache) = blocking(move || {
            Ok((
                LocalStore::open(&db_path)?,
                TransferStore::open(&transfers_path)?,
                LocalCache::open(cache_dir)?,
            ))
        })
        .await?;
        info!(
            device = %store.identity().id,
            data_dir = %config.data_dir.display(),
            "opened local store"
        );

        let mut sync = SyncManager::new(store.clone(), transport, config.sync.clone());
        if let Some(reporter) = host.reporter {
            sync = sync.with_reporter(reporter);
        }
        let ledger = sync.ledger();
        let replayed = ledger.reapply_pending().await?;
        if replayed > 0 {
            info!(replayed, "replayed local events left unapplied");
        }

        let mut transfers = TransferCoordinator::new(
            config.transfer.clone(),
            transfer_store,
            remote,
            cache,
            host.network.clone(),
        )?
        .with_ledger(ledger.clone());
        if let Some(decisions) = host.decisions {
            transfers = transfers.with_decisions(decisions);
        }

        let bootstrapper = Arc::new(Bootstrapper::new(sync.clone()));
        let (handle, commands) = SyncHandle::channel();

        Ok(Self {
            config,
            store,
            sync,
            ledger,
            bootstrapper,
            transfers,
            network: host.network,
            handle,
            commands: Mutex::new(Some(commands)),
            sync_task: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    /// Write path for entity services.
    pub fn ledger(&self) -> &EventLedger {
        &self.ledger
    }

    pub fn transfers(&self) -> &TransferCoordinator {
        &self.transfers
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Sends commands to the background sync loop.
    pub fn sync_handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Opens once the initial sync has pulled the whole remote history.
    pub fn ready_gate(&self) -> ReadyGate {
        self.bootstrapper.ready_gate()
    }

    pub fn bootstrap_progress(&self) -> watch::Receiver<BootstrapProgress> {
        self.bootstrapper.progress()
    }

    /// Starts background work: the initial sync followed by the periodic
    /// sync loop, the WiFi queue watcher and automatic downloads. Returns
    /// false if already started.
    pub fn start(&self) -> bool {
        let Some(commands) = lock(&self.commands).take() else {
            return false;
        };

        let task = tokio::spawn(drive_sync(
            self.sync.clone(),
            self.bootstrapper.clone(),
            commands,
        ));
        *lock(&self.sync_task) = Some(task);

        let mut watchers = lock(&self.watchers);
        watchers.push(self.transfers.spawn_network_watcher());
        watchers.push(self.transfers.spawn_auto_download(&self.sync));
        info!("core started");
        true
    }

    /// Deletes every event, projection, checkpoint, bootstrap mark, transfer
    /// record and cached attachment. The device identity is kept. The next
    /// start bootstraps from scratch.
    pub async fn delete_all_local_data(&self) -> CoreResult<()> {
        let store = self.store.clone();
        let transfers = self.transfers.clone();
        blocking(move || {
            store.wipe()?;
            transfers.wipe()?;
            Ok(())
        })
        .await?;
        info!("deleted all local data");
        Ok(())
    }

    /// Stops the sync loop after its current cycle, stops the watchers and
    /// flushes the store to disk.
    pub async fn shutdown(&self) -> CoreResult<()> {
        match self.handle.shutdown().await {
            Ok(()) | Err(SyncError::ChannelClosed) => {}
            Err(e) => return Err(e.into()),
        }
        let task = lock(&self.sync_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("sync task ended abnormally: {e}");
            }
        }
        for watcher in lock(&self.watchers).drain(..) {
            watcher.abort();
        }

        let store = self.store.clone();
        blocking(move || Ok(store.checkpoint_to_disk()?)).await?;
        info!("core shut down");
        Ok(())
    }
}

/// Runs the initial sync until it succeeds, then the periodic loop.
///
/// Commands other than shutdown are ignored while the initial sync runs. A
/// shutdown lets the page in flight finish, and the next start resumes after
/// it.
async fn drive_sync(
    sync: SyncManager,
    bootstrapper: Arc<Bootstrapper>,
    mut commands: mpsc::Receiver<SyncCommand>,
) {
    let retry = sync.config().sync_interval();
    loop {
        let run = bootstrapper.run();
        tokio::pin!(run);
        let mut listening = true;
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                cmd = commands.recv(), if listening => match cmd {
                    Some(SyncCommand::Shutdown) | None => {
                        bootstrapper.stop();
                        listening = false;
                    }
                    Some(other) => debug!(?other, "ignoring sync command during initial sync"),
                },
            }
        };

        if !listening {
            info!(?result, "stopped during initial sync");
            return;
        }
        match result {
            Ok(outcome) => {
                info!(?outcome, "initial sync finished");
                break;
            }
            Err(e) => {
                warn!(kind = e.kind(), "initial sync failed, retrying in {retry:?}: {e}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(retry) => {}
            cmd = commands.recv() => match cmd {
                Some(SyncCommand::Shutdown) | None => return,
                Some(_) => {}
            },
        }
    }

    // Local writes made before or during the initial sync.
    if let Err(e) = sync.manual_push().await {
        debug!("initial push failed: {e}");
    }
    sync.run(commands).await;
}
