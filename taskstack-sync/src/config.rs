//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the sync manager and HTTP transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the sync service (e.g., "https://sync.taskstack.app").
    pub api_base_url: String,

    /// Max local events sent per push request.
    pub push_batch_size: usize,

    /// Max remote events requested per pull page.
    pub pull_page_size: usize,

    /// Interval between periodic sync cycles (seconds).
    pub sync_interval_secs: u64,

    /// Consecutive failed round trips before the connection is reported
    /// as disconnected.
    pub max_consecutive_failures: u32,

    /// Per-request HTTP timeout (seconds).
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://sync.taskstack.app".to_string(),
            push_batch_size: 100,
            pull_page_size: 200,
            sync_interval_secs: 60,
            max_consecutive_failures: 3,
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
