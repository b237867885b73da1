#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use taskstack_storage::{DeviceIdentity, LocalStore};
use taskstack_sync::{
    ErrorReport, ErrorReporter, PullPage, PullRequest, PushAck, SyncConfig, SyncError,
    SyncManager, SyncResult, SyncTransport,
};
use taskstack_types::{DeviceId, Event};

// ── Mock Transport ──────────────────────────────────────────────

/// In-memory sync service. Pushed events are appended to one shared stream;
/// pulls page through it with the stream index as cursor.
#[derive(Default)]
pub struct MockTransport {
    log: Mutex<Vec<Event>>,
    /// Push calls received, in order.
    pub pushes: Mutex<Vec<Vec<Event>>>,
    /// Pull requests received, in order.
    pub pulls: Mutex<Vec<PullRequest>>,
    /// Accept at most this many events from the next push batch.
    ack_limit: Mutex<Option<usize>>,
    fail_pushes: AtomicBool,
    fail_pulls: AtomicBool,
    /// Pull calls allowed before every further pull fails.
    pull_budget: Mutex<Option<usize>>,
    /// Report the stream length as total.
    pub report_total: AtomicBool,
    /// Leave `next_cursor` empty on the last page.
    pub omit_final_cursor: AtomicBool,
    push_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Server-side history other devices already pushed.
    pub fn seed(&self, events: Vec<Event>) {
        self.log.lock().unwrap().extend(events);
    }

    pub fn server_events(&self) -> Vec<Event> {
        self.log.lock().unwrap().clone()
    }

    pub fn set_ack_limit(&self, limit: Option<usize>) {
        *self.ack_limit.lock().unwrap() = limit;
    }

    pub fn set_fail_pushes(&self, fail: bool) {
        self.fail_pushes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_pulls(&self, fail: bool) {
        self.fail_pulls.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pulls_after(&self, calls: usize) {
        *self.pull_budget.lock().unwrap() = Some(calls);
    }

    pub fn pull_cursors(&self) -> Vec<Option<i64>> {
        self.pulls.lock().unwrap().iter().map(|r| r.cursor).collect()
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn push(&self, _device_id: DeviceId, events: &[Event]) -> SyncResult<PushAck> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.pushes.lock().unwrap().push(events.to_vec());
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("connection reset".into()));
        }

        let limit = self.ack_limit.lock().unwrap().unwrap_or(events.len());
        let accepted: Vec<Event> = events.iter().take(limit).cloned().collect();

        let mut log = self.log.lock().unwrap();
        for event in &accepted {
            if !log.iter().any(|e| e.id == event.id) {
                log.push(event.clone());
            }
        }
        Ok(PushAck {
            accepted: accepted.iter().map(|e| e.id).collect(),
        })
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullPage> {
        self.pulls.lock().unwrap().push(request.clone());
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("timed out".into()));
        }
        {
            let mut budget = self.pull_budget.lock().unwrap();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(SyncError::Transport("connection dropped".into()));
                }
                *left -= 1;
            }
        }

        let log = self.log.lock().unwrap();
        let start = request.cursor.unwrap_or(0) as usize;
        let end = (start + request.limit).min(log.len());
        let events = log.get(start..end).map(|s| s.to_vec()).unwrap_or_default();
        let has_more = end < log.len();
        let next_cursor = if events.is_empty() {
            request.cursor
        } else if !has_more && self.omit_final_cursor.load(Ordering::SeqCst) {
            None
        } else {
            Some(end as i64)
        };
        Ok(PullPage {
            next_cursor,
            has_more,
            total_count: self
                .report_total
                .load(Ordering::SeqCst)
                .then_some(log.len() as u64),
            events,
        })
    }
}

// ── Reporter ────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<ErrorReport>>,
}

impl RecordingReporter {
    pub fn kinds(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.kind.clone())
            .collect()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, report: &ErrorReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}

// ── Fixtures ────────────────────────────────────────────────────

pub fn test_config() -> SyncConfig {
    SyncConfig {
        api_base_url: "http://localhost".into(),
        push_batch_size: 10,
        pull_page_size: 10,
        sync_interval_secs: 3600,
        max_consecutive_failures: 3,
        request_timeout_secs: 5,
    }
}

pub fn device(name: &str) -> LocalStore {
    LocalStore::open_in_memory_as(DeviceIdentity {
        id: DeviceId::new(),
        display_name: name.into(),
    })
    .unwrap()
}

pub fn manager(store: &LocalStore, transport: &Arc<MockTransport>, config: SyncConfig) -> SyncManager {
    SyncManager::new(store.clone(), transport.clone(), config)
}
