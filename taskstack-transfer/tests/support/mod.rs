#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskstack_transfer::{
    Attachment, LocalCache, NetworkMonitor, NetworkStatus, RemoteObjectStore, TransferConfig,
    TransferCoordinator, TransferError, TransferResult, TransferStore,
};
use taskstack_types::EntityId;
use tempfile::TempDir;
use tokio::sync::Semaphore;

// ── In-memory object store ──────────────────────────────────────

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    /// Offsets of every upload chunk received, in order.
    pub upload_offsets: Mutex<Vec<u64>>,
    /// Offsets of every range requested, in order.
    pub range_offsets: Mutex<Vec<u64>>,
    /// When set, each upload chunk waits for one permit.
    gate: Option<Arc<Semaphore>>,
    fail_uploads: AtomicBool,
    chunk_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Upload chunks block until the returned semaphore hands out permits.
    pub fn gated(initial_permits: usize) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(initial_permits));
        let store = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (Arc::new(store), gate)
    }

    pub fn put(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), data);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn chunk_calls(&self) -> usize {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn upload_offsets(&self) -> Vec<u64> {
        self.upload_offsets.lock().unwrap().clone()
    }

    pub fn range_offsets(&self) -> Vec<u64> {
        self.range_offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteObjectStore for MemoryObjectStore {
    async fn object_size(&self, key: &str) -> TransferResult<Option<u64>> {
        Ok(self.objects.lock().unwrap().get(key).map(|o| o.len() as u64))
    }

    async fn upload_chunk(&self, key: &str, offset: u64, _total: u64, data: Vec<u8>) -> TransferResult<()> {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(TransferError::Remote("503 Service Unavailable".into()));
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.upload_offsets.lock().unwrap().push(offset);
        let mut objects = self.objects.lock().unwrap();
        let object = objects.entry(key.to_string()).or_default();
        object.truncate(offset as usize);
        object.extend_from_slice(&data);
        Ok(())
    }

    async fn download_range(&self, key: &str, offset: u64, len: u64) -> TransferResult<Vec<u8>> {
        self.range_offsets.lock().unwrap().push(offset);
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(key)
            .ok_or_else(|| TransferError::NotFound(key.to_string()))?;
        let start = (offset as usize).min(object.len());
        let end = (start + len as usize).min(object.len());
        Ok(object[start..end].to_vec())
    }
}

// ── Fixtures ────────────────────────────────────────────────────

pub fn test_config() -> TransferConfig {
    TransferConfig {
        objects_base_url: "http://localhost".into(),
        cellular_threshold_bytes: 10,
        quota_bytes: 0,
        max_concurrent_transfers: 2,
        chunk_size: 4,
        cache_dir: None,
        auto_download: true,
        request_timeout_secs: 5,
    }
}

pub fn coordinator(
    dir: &TempDir,
    config: TransferConfig,
    remote: Arc<MemoryObjectStore>,
    network: NetworkStatus,
) -> TransferCoordinator {
    let cache = LocalCache::open(dir.path().join("cache")).unwrap();
    TransferCoordinator::new(
        config,
        TransferStore::open_in_memory().unwrap(),
        remote,
        cache,
        NetworkMonitor::new(network),
    )
    .unwrap()
}

pub fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

pub fn local_attachment(path: &Path) -> Attachment {
    let file_size = std::fs::metadata(path).unwrap().len();
    Attachment {
        id: EntityId::new(),
        file_name: path.file_name().unwrap().to_string_lossy().to_string(),
        file_size,
        local_path: Some(path.to_path_buf()),
        remote_key: None,
    }
}

pub fn remote_attachment(remote: &MemoryObjectStore, len: usize) -> (Attachment, Vec<u8>) {
    let id = EntityId::new();
    let key = format!("attachments/{id}");
    let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    remote.put(&key, data.clone());
    (
        Attachment {
            id,
            file_name: "photo.jpg".into(),
            file_size: len as u64,
            local_path: None,
            remote_key: Some(key),
        },
        data,
    )
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
