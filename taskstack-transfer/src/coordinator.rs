//! Attachment transfer coordinator.
//!
//! Runs uploads and downloads in their own tasks, independent of the sync
//! cycle. Before any bytes move a transfer passes two gates:
//!
//! 1. **Quota**: the cache usage plus this file must fit the quota, or the
//!    user decides (manage storage, raise quota, cancel).
//! 2. **Network**: offline transfers wait for WiFi; large transfers on
//!    cellular ask the user first (proceed, wait for WiFi, cancel).
//!
//! Admitted transfers then wait for one of `max_concurrent_transfers`
//! permits and move in chunks, persisting progress after each one so an
//! interrupted transfer resumes where it stopped.

use crate::cache::LocalCache;
use crate::config::TransferConfig;
use crate::decision::{CellularDecision, DecisionRequest, QuotaDecision};
use crate::error::{TransferError, TransferResult};
use crate::network::NetworkMonitor;
use crate::policy::{check_quota, should_prompt_cellular, QuotaCheck};
use crate::queue::WifiQueue;
use crate::remote::RemoteObjectStore;
use crate::store::TransferStore;
use crate::types::{
    Attachment, Direction, DownloadOutcome, TransferKey, TransferProgress, TransferRecord,
    TransferState, UploadOutcome, ATTACHMENT_ENTITY,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use taskstack_storage::LocalStore;
use taskstack_sync::{EventLedger, SyncEvent, SyncManager};
use taskstack_types::{EntityId, EventAction};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs SQLite and directory work off the async runtime.
async fn blocking<T, F>(f: F) -> TransferResult<T>
where
    F: FnOnce() -> TransferResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(TransferError::Storage(e.to_string())),
    }
}

/// Cancel token of an admitted or running transfer. The serial tells a
/// guard apart from a later activation of the same key.
struct ActiveEntry {
    serial: u64,
    cancel: CancellationToken,
}

/// State shared by every clone of the coordinator.
struct Shared {
    permits: Semaphore,
    queue: WifiQueue,
    /// Transfers that are admitted or running.
    active: Mutex<HashMap<TransferKey, ActiveEntry>>,
    next_serial: AtomicU64,
    progress: Mutex<HashMap<TransferKey, watch::Sender<TransferProgress>>>,
    skip_cellular_warnings: AtomicBool,
    quota_bytes: AtomicU64,
}

impl Shared {
    fn activate(self: &Arc<Self>, key: TransferKey) -> TransferResult<ActiveGuard> {
        let mut active = lock(&self.active);
        if active.contains_key(&key) {
            return Err(TransferError::AlreadyActive {
                attachment_id: key.attachment_id,
                direction: key.direction,
            });
        }
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        active.insert(
            key,
            ActiveEntry {
                serial,
                cancel: cancel.clone(),
            },
        );
        Ok(ActiveGuard {
            shared: self.clone(),
            key,
            serial,
            cancel,
        })
    }
}

/// Marks a transfer active until dropped.
struct ActiveGuard {
    shared: Arc<Shared>,
    key: TransferKey,
    serial: u64,
    cancel: CancellationToken,
}

impl ActiveGuard {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = lock(&self.shared.active);
        if active
            .get(&self.key)
            .is_some_and(|entry| entry.serial == self.serial)
        {
            active.remove(&self.key);
        }
    }
}

enum Admission {
    Proceed,
    WaitForWifi,
}

struct Finished {
    bytes: u64,
    remote_key: Option<String>,
    local_path: Option<PathBuf>,
}

/// Schedules attachment transfers under quota and network policy.
#[derive(Clone)]
pub struct TransferCoordinator {
    config: TransferConfig,
    store: TransferStore,
    remote: Arc<dyn RemoteObjectStore>,
    cache: LocalCache,
    network: NetworkMonitor,
    decisions: Option<mpsc::Sender<DecisionRequest>>,
    ledger: Option<EventLedger>,
    shared: Arc<Shared>,
}

impl TransferCoordinator {
    /// Creates the coordinator and re-queues transfers that were waiting for
    /// WiFi when the app last stopped.
    pub fn new(
        config: TransferConfig,
        store: TransferStore,
        remote: Arc<dyn RemoteObjectStore>,
        cache: LocalCache,
        network: NetworkMonitor,
    ) -> TransferResult<Self> {
        let shared = Arc::new(Shared {
            permits: Semaphore::new(config.max_concurrent_transfers.max(1)),
            queue: WifiQueue::new(),
            active: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(0),
            progress: Mutex::new(HashMap::new()),
            skip_cellular_warnings: AtomicBool::new(false),
            quota_bytes: AtomicU64::new(config.quota_bytes),
        });

        let waiting = store.list_in_state(TransferState::WaitingForWiFi)?;
        for record in &waiting {
            shared.queue.enqueue(record.key());
        }
        if !waiting.is_empty() {
            info!(count = waiting.len(), "restored transfers waiting for WiFi");
        }

        Ok(Self {
            config,
            store,
            remote,
            cache,
            network,
            decisions: None,
            ledger: None,
            shared,
        })
    }

    /// Routes cellular and quota prompts to the presentation layer. Without
    /// it those gates fail with `CellularDecisionPending`/`QuotaExceeded`.
    pub fn with_decisions(mut self, decisions: mpsc::Sender<DecisionRequest>) -> Self {
        self.decisions = Some(decisions);
        self
    }

    /// Records finished uploads as `attachment.updated` events so the upload
    /// state reaches other devices.
    pub fn with_ledger(mut self, ledger: EventLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Quota in effect, including any raise granted this session.
    pub fn quota_bytes(&self) -> u64 {
        self.shared.quota_bytes.load(Ordering::SeqCst)
    }

    pub fn skips_cellular_warnings(&self) -> bool {
        self.shared.skip_cellular_warnings.load(Ordering::SeqCst)
    }

    pub fn queued_count(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_queued(&self, attachment_id: EntityId, direction: Direction) -> bool {
        self.shared
            .queue
            .contains(&TransferKey::new(attachment_id, direction))
    }

    pub fn record(
        &self,
        attachment_id: EntityId,
        direction: Direction,
    ) -> TransferResult<Option<TransferRecord>> {
        self.store.get(&TransferKey::new(attachment_id, direction))
    }

    pub fn records(&self) -> TransferResult<Vec<TransferRecord>> {
        self.store.list()
    }

    /// Progress of one transfer. Starts from the persisted record.
    pub fn progress(
        &self,
        attachment_id: EntityId,
        direction: Direction,
    ) -> TransferResult<watch::Receiver<TransferProgress>> {
        let key = TransferKey::new(attachment_id, direction);
        if let Some(tx) = lock(&self.shared.progress).get(&key) {
            return Ok(tx.subscribe());
        }
        let initial = match self.store.get(&key)? {
            Some(record) => TransferProgress {
                state: record.state,
                bytes_transferred: record.bytes_transferred,
                total: record.file_size,
            },
            None => TransferProgress {
                state: TransferState::Pending,
                bytes_transferred: 0,
                total: 0,
            },
        };
        let mut progress = lock(&self.shared.progress);
        let tx = progress
            .entry(key)
            .or_insert_with(|| watch::channel(initial).0);
        Ok(tx.subscribe())
    }

    // ── Entry points ─────────────────────────────────────────────

    /// Uploads the attachment's local file, or parks it until WiFi.
    pub async fn upload_attachment(&self, attachment: &Attachment) -> TransferResult<UploadOutcome> {
        let source = attachment.local_path.as_deref().ok_or_else(|| {
            TransferError::InvalidState(format!("attachment {} has no local file", attachment.id))
        })?;
        let remote_key = attachment.upload_key();
        let key = TransferKey::new(attachment.id, Direction::Upload);

        let record = self.prepare(key, attachment.file_size, Some(remote_key.as_str()), Some(source))?;
        if record.state == TransferState::Complete {
            return Ok(UploadOutcome::Uploaded {
                remote_key: record.remote_key.unwrap_or(remote_key),
            });
        }
        if self.shared.queue.contains(&key) {
            return Ok(UploadOutcome::QueuedForWifi);
        }

        let guard = self.shared.activate(key)?;
        match self.admit(&record, &guard).await {
            Ok(Admission::Proceed) => {}
            Ok(Admission::WaitForWifi) => {
                self.park(guard, &record)?;
                return Ok(UploadOutcome::QueuedForWifi);
            }
            Err(e) => return Err(self.abandon(&key, e)),
        }

        let finished = self.execute(record, guard).await?;
        Ok(UploadOutcome::Uploaded {
            remote_key: finished.remote_key.unwrap_or(remote_key),
        })
    }

    /// Downloads the attachment into the cache, or parks it until WiFi.
    /// Returns the cached path straight away if it is already there.
    pub async fn download_attachment(&self, attachment: &Attachment) -> TransferResult<DownloadOutcome> {
        let remote_key = attachment.remote_key.as_deref().ok_or_else(|| {
            TransferError::InvalidState(format!("attachment {} has not been uploaded", attachment.id))
        })?;
        let key = TransferKey::new(attachment.id, Direction::Download);
        let cached = self.cache.path_for(attachment.id);

        let record = self.prepare(key, attachment.file_size, Some(remote_key), None)?;
        if self.cache.contains(attachment.id) {
            if record.state != TransferState::Complete {
                self.store
                    .complete(&key, attachment.file_size, None, Some(cached.as_path()))?;
            }
            return Ok(DownloadOutcome::Downloaded(cached));
        }
        let record = if record.state == TransferState::Complete {
            // Cache was cleared since; fetch it again.
            self.store.set_progress(&key, 0)?;
            self.store.set_state(&key, TransferState::Pending, None)?;
            self.require(&key)?
        } else {
            record
        };
        if self.shared.queue.contains(&key) {
            return Ok(DownloadOutcome::QueuedForWifi);
        }

        let guard = self.shared.activate(key)?;
        match self.admit(&record, &guard).await {
            Ok(Admission::Proceed) => {}
            Ok(Admission::WaitForWifi) => {
                self.park(guard, &record)?;
                return Ok(DownloadOutcome::QueuedForWifi);
            }
            Err(e) => return Err(self.abandon(&key, e)),
        }

        let finished = self.execute(record, guard).await?;
        Ok(DownloadOutcome::Downloaded(finished.local_path.unwrap_or(cached)))
    }

    /// Moves a failed transfer back to `Pending`. Call upload or download
    /// again to run it; it resumes from the recorded progress.
    pub fn retry(&self, attachment_id: EntityId, direction: Direction) -> TransferResult<TransferRecord> {
        let key = TransferKey::new(attachment_id, direction);
        let record = self.require(&key)?;
        if record.state != TransferState::Failed {
            return Err(TransferError::InvalidState(format!(
                "only failed transfers can be retried; {direction} of {attachment_id} is {}",
                record.state
            )));
        }
        self.store.set_state(&key, TransferState::Pending, None)?;
        self.set_progress_state(&key, TransferState::Pending);
        info!(%attachment_id, %direction, "transfer reset for retry");
        self.require(&key)
    }

    /// Stops a transfer and returns it to `Pending`.
    ///
    /// A queued transfer leaves the queue at once. One waiting for a permit
    /// or a decision stops immediately; a running one stops before its next
    /// chunk. Partial download files are kept for resume.
    /// Returns false if nothing was queued or running.
    pub fn cancel(&self, attachment_id: EntityId, direction: Direction) -> TransferResult<bool> {
        let key = TransferKey::new(attachment_id, direction);
        self.shared.queue.remove_then(&key, |was_queued| {
            if was_queued {
                self.store.set_state(&key, TransferState::Pending, None)?;
                self.set_progress_state(&key, TransferState::Pending);
                info!(%attachment_id, %direction, "cancelled queued transfer");
                return Ok(true);
            }
            match lock(&self.shared.active).get(&key) {
                Some(entry) => {
                    entry.cancel.cancel();
                    info!(%attachment_id, %direction, "cancelling transfer");
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Resumes every transfer waiting for WiFi, each on its own task.
    pub fn resume_waiting(&self) -> Vec<JoinHandle<TransferResult<()>>> {
        let mut claimed = Vec::new();
        self.shared.queue.drain_with(|key| match self.shared.activate(key) {
            Ok(guard) => {
                if let Err(e) = self.store.set_state(&key, TransferState::Transferring, None) {
                    warn!(attachment_id = %key.attachment_id, "failed to mark resumed transfer: {e}");
                }
                self.set_progress_state(&key, TransferState::Transferring);
                claimed.push(guard);
            }
            Err(e) => warn!("skipping queued transfer: {e}"),
        });

        if !claimed.is_empty() {
            info!(count = claimed.len(), "resuming transfers queued for WiFi");
        }
        claimed
            .into_iter()
            .map(|guard| {
                let this = self.clone();
                tokio::spawn(async move { this.resume(guard).await })
            })
            .collect()
    }

    /// Drains the WiFi queue whenever the network switches to WiFi.
    pub fn spawn_network_watcher(&self) -> JoinHandle<()> {
        let this = self.clone();
        let mut rx = self.network.subscribe();
        tokio::spawn(async move {
            if rx.borrow_and_update().is_unmetered() {
                this.resume_waiting();
            }
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                if status.is_unmetered() && !this.shared.queue.is_empty() {
                    this.resume_waiting();
                }
            }
        })
    }

    /// Downloads attachments that sync reports as uploaded elsewhere but
    /// missing from the cache.
    pub fn spawn_auto_download(&self, sync: &SyncManager) -> JoinHandle<()> {
        let this = self.clone();
        let store = sync.store().clone();
        let mut events = sync.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SyncEvent::EntityUpdated { entity_id }) => {
                        this.maybe_download(&store, entity_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "auto download lagged behind sync notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Clears the queue, cancels running transfers, and deletes every record
    /// and cached file.
    pub fn wipe(&self) -> TransferResult<()> {
        self.shared.queue.clear();
        for entry in lock(&self.shared.active).values() {
            entry.cancel.cancel();
        }
        self.store.wipe()?;
        self.cache.clear()?;
        lock(&self.shared.progress).clear();
        info!("transfer records and attachment cache wiped");
        Ok(())
    }

    // ── Admission ────────────────────────────────────────────────

    fn prepare(
        &self,
        key: TransferKey,
        file_size: u64,
        remote_key: Option<&str>,
        local_path: Option<&Path>,
    ) -> TransferResult<TransferRecord> {
        let now = Utc::now();
        let record = self.store.get_or_insert(&TransferRecord {
            attachment_id: key.attachment_id,
            direction: key.direction,
            file_size,
            state: TransferState::Pending,
            bytes_transferred: 0,
            last_error: None,
            remote_key: remote_key.map(str::to_string),
            local_path: local_path.map(Path::to_path_buf),
            created_at: now,
            updated_at: now,
        })?;

        match record.state {
            TransferState::Failed => Err(TransferError::InvalidState(format!(
                "{} of attachment {} failed; retry it first",
                key.direction, key.attachment_id
            ))),
            TransferState::Complete => Ok(record),
            _ => {
                self.store
                    .update_target(&key, file_size, remote_key, local_path)?;
                self.require(&key)
            }
        }
    }

    async fn admit(&self, record: &TransferRecord, guard: &ActiveGuard) -> TransferResult<Admission> {
        self.check_quota_gate(record, guard).await?;

        let network = self.network.current();
        if !network.is_connected {
            return Ok(Admission::WaitForWifi);
        }
        if should_prompt_cellular(
            record.file_size,
            self.config.cellular_threshold_bytes,
            network,
            self.skips_cellular_warnings(),
        ) {
            let attachment_id = record.attachment_id;
            let file_size = record.file_size;
            let decision = self
                .ask(guard, |reply| DecisionRequest::Cellular {
                    attachment_id,
                    file_size,
                    reply,
                })
                .await?
                .ok_or(TransferError::CellularDecisionPending)?;
            debug!(%attachment_id, ?decision, "cellular decision");
            match decision {
                CellularDecision::Proceed => {}
                CellularDecision::ProceedForSession => {
                    self.shared
                        .skip_cellular_warnings
                        .store(true, Ordering::SeqCst);
                }
                CellularDecision::WaitForWifi => return Ok(Admission::WaitForWifi),
                CellularDecision::Cancel => return Err(TransferError::Cancelled),
            }
        }

        if guard.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(Admission::Proceed)
    }

    async fn check_quota_gate(&self, record: &TransferRecord, guard: &ActiveGuard) -> TransferResult<()> {
        let cache = self.cache.clone();
        let used_bytes = blocking(move || Ok(cache.used_bytes()?)).await?;
        loop {
            let quota_bytes = self.quota_bytes();
            let check = check_quota(used_bytes, record.file_size, quota_bytes);
            if check == QuotaCheck::Allowed {
                return Ok(());
            }

            let attachment_id = record.attachment_id;
            let file_size = record.file_size;
            let decision = self
                .ask(guard, |reply| DecisionRequest::Quota {
                    attachment_id,
                    file_size,
                    used_bytes,
                    quota_bytes,
                    check,
                    reply,
                })
                .await?;
            debug!(%attachment_id, ?check, ?decision, "quota decision");
            match decision {
                Some(QuotaDecision::RaiseQuota(raised)) if raised > quota_bytes || raised == 0 => {
                    self.shared.quota_bytes.store(raised, Ordering::SeqCst);
                }
                Some(QuotaDecision::Cancel) => return Err(TransferError::Cancelled),
                _ => {
                    return Err(TransferError::QuotaExceeded {
                        used: used_bytes,
                        quota: quota_bytes,
                    })
                }
            }
        }
    }

    /// Sends a decision request and waits for the answer. `None` when no one
    /// is listening or the reply slot was dropped; `Cancelled` if the
    /// transfer is cancelled while the prompt is open.
    async fn ask<D>(
        &self,
        guard: &ActiveGuard,
        build: impl FnOnce(oneshot::Sender<D>) -> DecisionRequest,
    ) -> TransferResult<Option<D>> {
        let Some(decisions) = self.decisions.as_ref() else {
            return Ok(None);
        };
        let (reply, answer) = oneshot::channel();
        let request = build(reply);
        tokio::select! {
            biased;
            _ = guard.cancel.cancelled() => Err(TransferError::Cancelled),
            decision = async {
                if decisions.send(request).await.is_err() {
                    return None;
                }
                answer.await.ok()
            } => Ok(decision),
        }
    }

    /// Queues an admitted transfer for WiFi. The active mark is released
    /// inside the queue lock, so a concurrent cancel or drain sees the
    /// transfer in exactly one place.
    fn park(&self, guard: ActiveGuard, record: &TransferRecord) -> TransferResult<()> {
        let key = guard.key;
        let parked = self.shared.queue.enqueue_with(key, || {
            let cancelled = guard.is_cancelled();
            drop(guard);
            if cancelled {
                return Ok(false);
            }
            self.store
                .set_state(&key, TransferState::WaitingForWiFi, None)?;
            Ok::<_, TransferError>(true)
        })?;

        if !parked {
            return Err(self.abandon(&key, TransferError::Cancelled));
        }
        self.publish(
            &key,
            TransferProgress {
                state: TransferState::WaitingForWiFi,
                bytes_transferred: record.bytes_transferred,
                total: record.file_size,
            },
        );
        info!(attachment_id = %key.attachment_id, direction = %key.direction, "transfer waiting for WiFi");
        Ok(())
    }

    // ── Execution ────────────────────────────────────────────────

    async fn resume(&self, guard: ActiveGuard) -> TransferResult<()> {
        let key = guard.key;
        let record = match self.require(&key) {
            Ok(record) => record,
            Err(e) => return Err(self.abandon(&key, e)),
        };
        self.execute(record, guard).await.map(|_| ()).inspect_err(|e| {
            warn!(attachment_id = %key.attachment_id, direction = %key.direction, "resumed transfer stopped: {e}");
        })
    }

    async fn execute(&self, record: TransferRecord, guard: ActiveGuard) -> TransferResult<Finished> {
        let key = record.key();
        let _permit = tokio::select! {
            biased;
            _ = guard.cancel.cancelled() => {
                return Err(self.abandon(&key, TransferError::Cancelled));
            }
            permit = self.shared.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(self.abandon(&key, TransferError::Cancelled)),
            },
        };

        let store = self.store.clone();
        blocking(move || store.set_state(&key, TransferState::Transferring, None)).await?;
        self.publish(
            &key,
            TransferProgress {
                state: TransferState::Transferring,
                bytes_transferred: record.bytes_transferred,
                total: record.file_size,
            },
        );
        info!(
            attachment_id = %key.attachment_id,
            direction = %key.direction,
            size = record.file_size,
            offset = record.bytes_transferred,
            "transfer started"
        );

        let result = match key.direction {
            Direction::Upload => self.upload_bytes(&record, &guard).await,
            Direction::Download => self.download_bytes(&record, &guard).await,
        };
        let finished = match result {
            Ok(finished) => finished,
            Err(e) => return Err(self.abandon(&key, e)),
        };

        let store = self.store.clone();
        let (bytes, remote_key, local_path) = (
            finished.bytes,
            finished.remote_key.clone(),
            finished.local_path.clone(),
        );
        blocking(move || store.complete(&key, bytes, remote_key.as_deref(), local_path.as_deref()))
            .await?;
        self.publish(
            &key,
            TransferProgress {
                state: TransferState::Complete,
                bytes_transferred: finished.bytes,
                total: finished.bytes,
            },
        );
        info!(attachment_id = %key.attachment_id, direction = %key.direction, bytes = finished.bytes, "transfer complete");

        if let (Direction::Upload, Some(remote_key)) = (key.direction, finished.remote_key.as_deref()) {
            self.announce_upload(key.attachment_id, remote_key).await;
        }
        Ok(finished)
    }

    async fn upload_bytes(&self, record: &TransferRecord, guard: &ActiveGuard) -> TransferResult<Finished> {
        let key = record.key();
        let source = record
            .local_path
            .clone()
            .ok_or_else(|| TransferError::InvalidState("upload has no source file".into()))?;
        let remote_key = record
            .remote_key
            .clone()
            .ok_or_else(|| TransferError::InvalidState("upload has no remote key".into()))?;

        let mut file = File::open(&source).await?;
        let total = file.metadata().await?.len();

        // Never trust local progress beyond what the server confirms.
        let confirmed = self.remote.object_size(&remote_key).await?.unwrap_or(0);
        let mut offset = record.bytes_transferred.min(confirmed).min(total);
        if offset > 0 {
            debug!(attachment_id = %key.attachment_id, offset, "resuming upload");
            file.seek(SeekFrom::Start(offset)).await?;
        }

        let chunk_size = self.config.chunk_size.max(1);
        let mut buf = vec![0u8; chunk_size];
        loop {
            if guard.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let len = (total - offset).min(chunk_size as u64) as usize;
            file.read_exact(&mut buf[..len]).await?;
            self.remote
                .upload_chunk(&remote_key, offset, total, buf[..len].to_vec())
                .await?;
            offset += len as u64;
            self.save_progress(key, offset).await?;
            self.publish_bytes(&key, offset, total);
            if offset >= total {
                break;
            }
        }

        self.cache.import(key.attachment_id, &source).await?;
        Ok(Finished {
            bytes: total,
            remote_key: Some(remote_key),
            local_path: None,
        })
    }

    async fn download_bytes(&self, record: &TransferRecord, guard: &ActiveGuard) -> TransferResult<Finished> {
        let key = record.key();
        let remote_key = record
            .remote_key
            .clone()
            .ok_or_else(|| TransferError::InvalidState("download has no remote key".into()))?;
        let total = self
            .remote
            .object_size(&remote_key)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("remote object {remote_key}")))?;

        let part = self.cache.part_path(key.attachment_id);
        let mut offset = match tokio::fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if offset > total {
            tokio::fs::remove_file(&part).await?;
            offset = 0;
        }
        if offset > 0 {
            debug!(attachment_id = %key.attachment_id, offset, "resuming download from partial file");
        }
        self.save_progress(key, offset).await?;
        self.publish_bytes(&key, offset, total);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part)
            .await?;
        let chunk_size = self.config.chunk_size.max(1) as u64;
        while offset < total {
            if guard.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let want = (total - offset).min(chunk_size);
            let bytes = self.remote.download_range(&remote_key, offset, want).await?;
            if bytes.is_empty() {
                return Err(TransferError::Remote(format!(
                    "empty range at {offset} of {remote_key}"
                )));
            }
            let take = bytes.len().min(want as usize);
            file.write_all(&bytes[..take]).await?;
            file.flush().await?;
            offset += take as u64;
            self.save_progress(key, offset).await?;
            self.publish_bytes(&key, offset, total);
        }
        file.sync_all().await?;
        drop(file);

        let dest = self.cache.path_for(key.attachment_id);
        tokio::fs::rename(&part, &dest).await?;
        Ok(Finished {
            bytes: total,
            remote_key: None,
            local_path: Some(dest),
        })
    }

    /// Persists the outcome of a transfer that did not finish and hands the
    /// error back. Cancellations and pending decisions return to `Pending`;
    /// anything else is `Failed`.
    fn abandon(&self, key: &TransferKey, err: TransferError) -> TransferError {
        let (state, last_error) = match &err {
            e if matches!(e, TransferError::Cancelled) || e.needs_decision() => {
                (TransferState::Pending, None)
            }
            e => (TransferState::Failed, Some(e.to_string())),
        };
        if let Err(store_err) = self.store.set_state(key, state, last_error.as_deref()) {
            warn!(attachment_id = %key.attachment_id, "failed to persist transfer state: {store_err}");
        }
        self.set_progress_state(key, state);
        match state {
            TransferState::Failed => {
                warn!(attachment_id = %key.attachment_id, direction = %key.direction, kind = err.kind(), "transfer failed: {err}")
            }
            _ => debug!(attachment_id = %key.attachment_id, direction = %key.direction, kind = err.kind(), "transfer stopped"),
        }
        err
    }

    async fn save_progress(&self, key: TransferKey, bytes_transferred: u64) -> TransferResult<()> {
        let store = self.store.clone();
        blocking(move || store.set_progress(&key, bytes_transferred)).await
    }

    fn require(&self, key: &TransferKey) -> TransferResult<TransferRecord> {
        self.store.get(key)?.ok_or_else(|| {
            TransferError::NotFound(format!(
                "{} of attachment {}",
                key.direction, key.attachment_id
            ))
        })
    }

    async fn announce_upload(&self, attachment_id: EntityId, remote_key: &str) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let payload = json!({ "upload_state": "complete", "remote_key": remote_key });
        if let Err(e) = ledger
            .record(ATTACHMENT_ENTITY, attachment_id, EventAction::Updated, payload)
            .await
        {
            warn!(%attachment_id, "failed to record upload completion: {e}");
        }
    }

    async fn maybe_download(&self, store: &LocalStore, entity_id: EntityId) {
        if !self.config.auto_download || self.cache.contains(entity_id) {
            return;
        }
        let store = store.clone();
        let projection =
            match tokio::task::spawn_blocking(move || store.entities().get(&entity_id)).await {
                Ok(Ok(projection)) => projection,
                Ok(Err(e)) => {
                    warn!(%entity_id, "auto download lookup failed: {e}");
                    return;
                }
                Err(e) => {
                    warn!(%entity_id, "auto download lookup panicked: {e}");
                    return;
                }
            };
        let Some(attachment) = projection.as_ref().and_then(Attachment::from_projection) else {
            return;
        };
        if attachment.remote_key.is_none() {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            match this.download_attachment(&attachment).await {
                Ok(outcome) => debug!(attachment_id = %attachment.id, ?outcome, "auto download"),
                Err(TransferError::AlreadyActive { .. }) => {}
                Err(e) => warn!(attachment_id = %attachment.id, "auto download failed: {e}"),
            }
        });
    }

    // ── Progress ─────────────────────────────────────────────────

    fn publish(&self, key: &TransferKey, progress: TransferProgress) {
        let mut senders = lock(&self.shared.progress);
        match senders.get(key) {
            Some(tx) => {
                tx.send_replace(progress);
            }
            None => {
                senders.insert(*key, watch::channel(progress).0);
            }
        }
    }

    fn publish_bytes(&self, key: &TransferKey, bytes_transferred: u64, total: u64) {
        self.modify_progress(key, |p| {
            p.bytes_transferred = bytes_transferred;
            p.total = total;
        });
    }

    fn set_progress_state(&self, key: &TransferKey, state: TransferState) {
        self.modify_progress(key, |p| p.state = state);
    }

    fn modify_progress(&self, key: &TransferKey, f: impl FnOnce(&mut TransferProgress)) {
        if let Some(tx) = lock(&self.shared.progress).get(key) {
            tx.send_modify(f);
        }
    }
}
