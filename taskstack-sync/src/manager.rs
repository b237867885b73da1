//! Sync manager: push-then-pull cycles, connection status, triggers.
//!
//! Phase machine `Idle → Pushing → Pulling → Idle` with [`ConnectionStatus`]
//! as an overlay. A cycle is never cancelled mid-flight; the only
//! cancellation surface is declining to start the next one
//! ([`SyncCommand::Shutdown`]).

use crate::applicator::{ApplyOutcome, EventApplicator};
use crate::config::SyncConfig;
use crate::entity_lock::EntityLocks;
use crate::error::{SyncError, SyncResult};
use crate::ledger::EventLedger;
use crate::reporter::{ErrorReport, ErrorReporter, TracingReporter};
use crate::transport::{PullRequest, SyncTransport};
use crate::blocking;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use taskstack_storage::LocalStore;
use taskstack_types::{EntityId, EventId};
use tokio::sync::{broadcast, mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where the manager is in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Pushing,
    Pulling,
}

/// Reachability of the sync service, as observed by round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PhaseChanged(SyncPhase),
    ConnectionChanged(ConnectionStatus),
    PushCompleted(PushReport),
    PullCompleted(PullReport),
    /// A pulled event changed a projection.
    EntityUpdated { entity_id: EntityId },
    SyncFailed { action: String, kind: String },
}

/// Outcome of one push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub batches: usize,
    pub sent: usize,
    pub acknowledged: usize,
}

/// Outcome of one pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pages: usize,
    pub received: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub deferred: usize,
    pub skipped: usize,
}

impl PullReport {
    fn absorb(&mut self, page: &PageReport) {
        self.pages += 1;
        self.received += page.received;
        self.applied += page.applied;
        self.duplicates += page.duplicates;
        self.deferred += page.deferred;
        self.skipped += page.skipped;
    }
}

/// Outcome of a manual push-then-pull cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub push: PushReport,
    pub pull: PullReport,
}

/// One applied page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PageReport {
    pub received: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub has_more: bool,
    pub total_count: Option<u64>,
    /// Bootstrap progress after this page (bootstrap pulls only).
    pub processed: u64,
}

/// How a page advances persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageMode {
    Incremental,
    Bootstrap,
}

/// Commands accepted by [`SyncManager::run`].
#[derive(Debug)]
pub enum SyncCommand {
    /// Run a manual push-then-pull cycle now.
    SyncNow,
    /// Push pending events now.
    PushNow,
    /// Stop after the current cycle.
    Shutdown,
}

/// Handle to send commands to a running sync loop.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    /// Creates a handle and the receiver to pass to [`SyncManager::run`].
    pub fn channel() -> (Self, mpsc::Receiver<SyncCommand>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        (Self { command_tx }, command_rx)
    }

    pub async fn sync_now(&self) -> SyncResult<()> {
        self.send(SyncCommand::SyncNow).await
    }

    pub async fn push_now(&self) -> SyncResult<()> {
        self.send(SyncCommand::PushNow).await
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(SyncCommand::Shutdown).await
    }

    async fn send(&self, cmd: SyncCommand) -> SyncResult<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// State shared by every clone of a manager.
struct Shared {
    /// Serializes manual cycles and bootstrap against each other.
    cycle_lock: TokioMutex<()>,
    /// Serializes pushes so a batch is never in flight twice.
    push_lock: TokioMutex<()>,
    phase: watch::Sender<SyncPhase>,
    connection: watch::Sender<ConnectionStatus>,
    consecutive_failures: AtomicU32,
    events: broadcast::Sender<SyncEvent>,
}

/// Orchestrates push and pull against a [`SyncTransport`].
///
/// Cheap to clone; clones share locks, status and notifications.
#[derive(Clone)]
pub struct SyncManager {
    store: LocalStore,
    transport: Arc<dyn SyncTransport>,
    applicator: EventApplicator,
    locks: Arc<EntityLocks>,
    reporter: Arc<dyn ErrorReporter>,
    config: SyncConfig,
    shared: Arc<Shared>,
}

impl SyncManager {
    pub fn new(store: LocalStore, transport: Arc<dyn SyncTransport>, config: SyncConfig) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        let (connection, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(256);

        Self {
            applicator: EventApplicator::new(store.clone()),
            store,
            transport,
            locks: Arc::new(EntityLocks::new()),
            reporter: Arc::new(TracingReporter),
            config,
            shared: Arc::new(Shared {
                cycle_lock: TokioMutex::new(()),
                push_lock: TokioMutex::new(()),
                phase,
                connection,
                consecutive_failures: AtomicU32::new(0),
                events,
            }),
        }
    }

    /// Replaces the default [`TracingReporter`].
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Shares an existing entity lock table (e.g. with an [`EventLedger`]).
    pub fn with_locks(mut self, locks: Arc<EntityLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// A ledger for local writes that shares this manager's entity locks
    /// and triggers an immediate push after each write.
    pub fn ledger(&self) -> EventLedger {
        EventLedger::new(self.store.clone(), self.locks.clone())
            .with_reporter(self.reporter.clone())
            .with_sync(self.clone())
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<EntityLocks> {
        &self.locks
    }

    pub fn phase(&self) -> SyncPhase {
        *self.shared.phase.borrow()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.shared.connection.borrow()
    }

    /// Watches connection status transitions.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.connection.subscribe()
    }

    /// Subscribes to sync notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    // ── Manual triggers ──────────────────────────────────────────

    /// Pushes every pending event, then pulls. Push completes fully before
    /// pull starts so the server resolves conflicts before we read back.
    pub async fn manual_sync(&self) -> SyncResult<SyncReport> {
        let _cycle = self.shared.cycle_lock.lock().await;
        info!("manual sync started");

        self.set_phase(SyncPhase::Pushing);
        let push = self.push_guarded().await;
        let push = match self.settle("push", push) {
            Ok(push) => push,
            Err(e) => {
                self.set_phase(SyncPhase::Idle);
                return Err(e);
            }
        };

        self.set_phase(SyncPhase::Pulling);
        let pull = self.pull_all().await;
        self.set_phase(SyncPhase::Idle);
        let pull = self.settle("pull", pull)?;

        info!(
            pushed = push.acknowledged,
            pulled = pull.received,
            applied = pull.applied,
            "manual sync complete"
        );
        Ok(SyncReport { push, pull })
    }

    /// Sends pending events in bounded batches. Only the acknowledged prefix
    /// of each batch is marked synced.
    pub async fn manual_push(&self) -> SyncResult<PushReport> {
        let _cycle = self.shared.cycle_lock.lock().await;
        self.set_phase(SyncPhase::Pushing);
        let result = self.push_guarded().await;
        self.set_phase(SyncPhase::Idle);
        self.settle("push", result)
    }

    /// Pulls and applies remote pages after the checkpoint. The checkpoint
    /// advances only after a whole page is applied.
    pub async fn manual_pull(&self) -> SyncResult<PullReport> {
        let _cycle = self.shared.cycle_lock.lock().await;
        self.set_phase(SyncPhase::Pulling);
        let result = self.pull_all().await;
        self.set_phase(SyncPhase::Idle);
        self.settle("pull", result)
    }

    /// Pushes in the background and returns immediately.
    ///
    /// Not ordered against manual cycles and does not move the phase; the
    /// push lock still keeps a batch from being sent twice concurrently.
    /// Must be called from within a Tokio runtime.
    pub fn trigger_immediate_push(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.push_guarded().await;
            if let Err(e) = this.settle("immediate_push", result) {
                debug!("immediate push failed: {e}");
            }
        })
    }

    // ── Periodic loop ────────────────────────────────────────────

    /// Runs periodic sync until [`SyncCommand::Shutdown`] or the handle is
    /// dropped. Commands and ticks are handled one at a time, so shutdown
    /// takes effect between cycles.
    pub async fn run(&self, mut command_rx: mpsc::Receiver<SyncCommand>) {
        let mut interval = tokio::time::interval(self.config.sync_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip first immediate tick
        interval.tick().await;

        info!("sync loop started (every {:?})", self.config.sync_interval());

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::SyncNow) => {
                            let _ = self.manual_sync().await;
                        }
                        Some(SyncCommand::PushNow) => {
                            let _ = self.manual_push().await;
                        }
                        Some(SyncCommand::Shutdown) => {
                            info!("sync loop shutting down");
                            break;
                        }
                        None => {
                            info!("command channel closed, stopping sync loop");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    debug!("periodic sync tick");
                    let _ = self.manual_sync().await;
                }
            }
        }

        info!("sync loop stopped");
    }

    // ── Push ─────────────────────────────────────────────────────

    async fn push_guarded(&self) -> SyncResult<PushReport> {
        let _push = self.shared.push_lock.lock().await;
        self.mark_attempt();
        self.push_pending().await
    }

    async fn push_pending(&self) -> SyncResult<PushReport> {
        let device_id = self.store.identity().id;
        let batch_size = self.config.push_batch_size.max(1);
        let mut report = PushReport::default();

        loop {
            let store = self.store.clone();
            let batch = blocking(move || Ok(store.events().pending_events(batch_size)?)).await?;
            if batch.is_empty() {
                break;
            }

            let ack = self.transport.push(device_id, &batch).await?;
            let accepted: HashSet<EventId> = ack.accepted.into_iter().collect();
            let prefix: Vec<EventId> = batch
                .iter()
                .take_while(|e| accepted.contains(&e.id))
                .map(|e| e.id)
                .collect();

            let acknowledged = prefix.len();
            if !prefix.is_empty() {
                let store = self.store.clone();
                blocking(move || Ok(store.events().mark_synced(&prefix, Utc::now())?)).await?;
            }

            report.batches += 1;
            report.sent += batch.len();
            report.acknowledged += acknowledged;
            debug!(sent = batch.len(), acknowledged, "pushed batch");

            if acknowledged < batch.len() {
                warn!(
                    sent = batch.len(),
                    acknowledged,
                    "server acknowledged part of a batch, remaining events stay pending"
                );
                break;
            }
        }

        let _ = self.shared.events.send(SyncEvent::PushCompleted(report));
        Ok(report)
    }

    // ── Pull ─────────────────────────────────────────────────────

    async fn pull_all(&self) -> SyncResult<PullReport> {
        self.mark_attempt();
        let mut report = PullReport::default();
        loop {
            let page = self.pull_page(PageMode::Incremental).await?;
            report.absorb(&page);
            if !page.has_more {
                break;
            }
        }
        let _ = self.shared.events.send(SyncEvent::PullCompleted(report));
        Ok(report)
    }

    /// Pulls one page after the checkpoint, applies it in receive order and
    /// only then advances the checkpoint.
    ///
    /// `has_more` in the result is false when the server reports no more
    /// data or the cursor failed to move, so callers cannot loop forever.
    pub(crate) async fn pull_page(&self, mode: PageMode) -> SyncResult<PageReport> {
        let store = self.store.clone();
        let cursor = blocking(move || Ok(store.sync_state().checkpoint()?)).await?;

        let request = PullRequest {
            cursor,
            limit: self.config.pull_page_size.max(1),
            device_id: self.store.identity().id,
        };
        let page = self.transport.pull(&request).await?;

        let mut report = self.apply_page(&page.events).await?;
        report.total_count = page.total_count;

        let advanced = match page.next_cursor {
            Some(next) if cursor.is_none_or(|c| next > c) => {
                let store = self.store.clone();
                let received = report.received as u64;
                match mode {
                    PageMode::Incremental => {
                        blocking(move || Ok(store.sync_state().advance_checkpoint(next)?)).await?;
                    }
                    PageMode::Bootstrap => {
                        report.processed = blocking(move || {
                            Ok(store.sync_state().advance_bootstrap_page(next, received)?)
                        })
                        .await?;
                    }
                }
                true
            }
            _ => false,
        };

        if mode == PageMode::Bootstrap && !advanced {
            // No cursor to persist with; the page still counts for this run.
            let store = self.store.clone();
            let persisted =
                blocking(move || Ok(store.sync_state().bootstrap_events_processed()?)).await?;
            report.processed = persisted + report.received as u64;
        }

        report.has_more = page.has_more && advanced && !page.events.is_empty();
        debug!(
            received = report.received,
            applied = report.applied,
            cursor = ?page.next_cursor,
            "applied page"
        );
        Ok(report)
    }

    /// Stores and applies each event. An unappliable event is skipped and
    /// reported; a storage failure aborts the page.
    async fn apply_page(&self, events: &[taskstack_types::Event]) -> SyncResult<PageReport> {
        let mut report = PageReport {
            received: events.len(),
            ..PageReport::default()
        };

        for event in events {
            let _guard = self.locks.lock(event.entity_id).await;
            let store = self.store.clone();
            let applicator = self.applicator.clone();
            let ev = event.clone();
            let outcome = blocking(move || {
                store.events().insert_remote(&ev, Utc::now())?;
                store.devices().touch(ev.origin_device_id, None, ev.timestamp)?;
                applicator.apply_or_skip(&ev)
            })
            .await?;

            match outcome {
                ApplyOutcome::Applied { replayed } => {
                    report.applied += 1 + replayed;
                    let _ = self.shared.events.send(SyncEvent::EntityUpdated {
                        entity_id: event.entity_id,
                    });
                }
                ApplyOutcome::AlreadyApplied => report.duplicates += 1,
                ApplyOutcome::Deferred => report.deferred += 1,
                ApplyOutcome::Skipped(e) => {
                    report.skipped += 1;
                    self.reporter.report(
                        &ErrorReport::new("apply", "conflict_apply", e.to_string())
                            .with_entity(event.entity_id),
                    );
                }
            }
        }
        Ok(report)
    }

    // ── Status bookkeeping ───────────────────────────────────────

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        let changed = self.shared.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
        if changed {
            let _ = self.shared.events.send(SyncEvent::PhaseChanged(phase));
        }
    }

    fn set_connection(&self, status: ConnectionStatus) {
        let changed = self.shared.connection.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!("sync connection {status:?}");
            let _ = self.shared.events.send(SyncEvent::ConnectionChanged(status));
        }
    }

    /// A round trip is starting; a disconnected manager is now connecting.
    pub(crate) fn mark_attempt(&self) {
        if self.connection_status() == ConnectionStatus::Disconnected {
            self.set_connection(ConnectionStatus::Connecting);
        }
    }

    /// Updates connection status from an outcome and reports failures.
    pub(crate) fn settle<T>(&self, action: &str, result: SyncResult<T>) -> SyncResult<T> {
        match &result {
            Ok(_) => {
                self.shared.consecutive_failures.store(0, Ordering::SeqCst);
                self.set_connection(ConnectionStatus::Connected);
            }
            Err(e) => {
                if e.is_connectivity() {
                    let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= self.config.max_consecutive_failures.max(1) {
                        self.set_connection(ConnectionStatus::Disconnected);
                    }
                }
                self.reporter
                    .report(&ErrorReport::new(action, e.kind(), e.to_string()));
                let _ = self.shared.events.send(SyncEvent::SyncFailed {
                    action: action.to_string(),
                    kind: e.kind().to_string(),
                });
            }
        }
        result
    }

    pub(crate) fn cycle_lock(&self) -> &TokioMutex<()> {
        &self.shared.cycle_lock
    }
}
