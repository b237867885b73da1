//! Initial full pull for a fresh device.
//!
//! The app must not expose partially synced data, so a [`ReadyGate`] stays
//! closed until the whole remote history has been applied. The checkpoint
//! still advances page by page; an interrupted bootstrap resumes from the
//! last completed page instead of starting over. A stop request is honoured
//! between pages, never in the middle of one.

use crate::blocking;
use crate::error::{SyncError, SyncResult};
use crate::manager::{PageMode, SyncManager, SyncPhase};
use std::sync::atomic::{AtomicBool, Ordering};
use taskstack_storage::BootstrapState;
use tokio::sync::watch;
use tracing::{info, warn};

/// Determinate (when the server reports a total) bootstrap progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapProgress {
    pub events_processed: u64,
    pub total: Option<u64>,
    pub complete: bool,
}

impl BootstrapProgress {
    /// Fraction done in `[0, 1]`, or `None` while the total is unknown.
    pub fn ratio(&self) -> Option<f64> {
        if self.complete {
            return Some(1.0);
        }
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.events_processed as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Released once bootstrap completes. Cheap to clone.
#[derive(Clone)]
pub struct ReadyGate {
    rx: watch::Receiver<bool>,
}

impl ReadyGate {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until the bootstrap pull has completed.
    pub async fn wait_ready(&self) -> SyncResult<()> {
        let mut rx = self.rx.clone();
        rx.wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// How [`Bootstrapper::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// A previous run already finished; nothing was pulled.
    AlreadyComplete,
    /// History was pulled (fresh or resumed) and the gate released.
    Completed { pages: usize, events_processed: u64 },
    /// [`Bootstrapper::stop`] was called; the gate stays closed and the next
    /// run resumes after the last applied page.
    Stopped { pages: usize, events_processed: u64 },
}

struct History {
    pages: usize,
    processed: u64,
    stopped: bool,
}

/// Runs the initial full pull and owns the ready gate.
pub struct Bootstrapper {
    manager: SyncManager,
    progress: watch::Sender<BootstrapProgress>,
    ready: watch::Sender<bool>,
    stop: AtomicBool,
}

impl Bootstrapper {
    pub fn new(manager: SyncManager) -> Self {
        let (progress, _) = watch::channel(BootstrapProgress::default());
        let (ready, _) = watch::channel(false);
        Self {
            manager,
            progress,
            ready,
            stop: AtomicBool::new(false),
        }
    }

    /// Stops a running bootstrap after the page in flight is applied. Runs
    /// started afterwards stop before their first page.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn ready_gate(&self) -> ReadyGate {
        ReadyGate {
            rx: self.ready.subscribe(),
        }
    }

    pub fn progress(&self) -> watch::Receiver<BootstrapProgress> {
        self.progress.subscribe()
    }

    /// Whether a bootstrap still has to run (fresh or interrupted).
    pub async fn is_needed(&self) -> SyncResult<bool> {
        let store = self.manager.store().clone();
        let state = blocking(move || Ok(store.sync_state().bootstrap_state()?)).await?;
        Ok(state != BootstrapState::Complete)
    }

    /// Pulls the full remote history, or resumes an interrupted pull.
    ///
    /// On failure the gate stays closed and the persisted state stays
    /// `in_progress`; calling `run` again resumes from the last applied page.
    pub async fn run(&self) -> SyncResult<BootstrapOutcome> {
        let _cycle = self.manager.cycle_lock().lock().await;
        let store = self.manager.store().clone();

        let (state, processed, checkpoint) = blocking(move || {
            let sync_state = store.sync_state();
            Ok((
                sync_state.bootstrap_state()?,
                sync_state.bootstrap_events_processed()?,
                sync_state.checkpoint()?,
            ))
        })
        .await?;

        let start = match state {
            BootstrapState::Complete => {
                self.publish(processed, None, true);
                self.ready.send_replace(true);
                return Ok(BootstrapOutcome::AlreadyComplete);
            }
            BootstrapState::NotStarted => {
                info!("starting initial sync");
                let store = self.manager.store().clone();
                blocking(move || Ok(store.sync_state().begin_bootstrap()?)).await?;
                self.publish(0, None, false);
                0
            }
            BootstrapState::InProgress => {
                info!(?checkpoint, processed, "resuming interrupted initial sync");
                self.publish(processed, None, false);
                processed
            }
        };

        self.manager.mark_attempt();
        self.manager.set_phase(SyncPhase::Pulling);
        let result = self.pull_history(start).await;
        self.manager.set_phase(SyncPhase::Idle);
        let history = match result {
            // Stopped before any round trip; nothing to settle.
            Ok(history) if history.stopped && history.pages == 0 => history,
            other => self.manager.settle("bootstrap", other).inspect_err(|e| {
                warn!("initial sync interrupted: {e}");
            })?,
        };
        let (pages, processed) = (history.pages, history.processed);

        if history.stopped {
            info!(pages, processed, "initial sync stopped");
            return Ok(BootstrapOutcome::Stopped {
                pages,
                events_processed: processed,
            });
        }

        let store = self.manager.store().clone();
        blocking(move || Ok(store.sync_state().complete_bootstrap()?)).await?;

        let total = self.progress.borrow().total;
        self.publish(processed, total, true);
        self.ready.send_replace(true);
        info!(pages, processed, "initial sync complete");

        Ok(BootstrapOutcome::Completed {
            pages,
            events_processed: processed,
        })
    }

    async fn pull_history(&self, mut processed: u64) -> SyncResult<History> {
        let mut pages = 0;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(History {
                    pages,
                    processed,
                    stopped: true,
                });
            }
            let page = self.manager.pull_page(PageMode::Bootstrap).await?;
            pages += 1;
            processed = page.processed;
            let total = page.total_count.or(self.progress.borrow().total);
            self.publish(processed, total, false);
            if !page.has_more {
                return Ok(History {
                    pages,
                    processed,
                    stopped: false,
                });
            }
        }
    }

    fn publish(&self, events_processed: u64, total: Option<u64>, complete: bool) {
        self.progress.send_replace(BootstrapProgress {
            events_processed,
            total,
            complete,
        });
    }
}
