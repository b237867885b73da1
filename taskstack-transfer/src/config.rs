//! Transfer configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the attachment transfer coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Base URL of the attachment object service.
    pub objects_base_url: String,

    /// Uploads above this size on cellular ask the user first (bytes).
    pub cellular_threshold_bytes: u64,

    /// Maximum attachment bytes kept in the local cache. 0 = unlimited.
    pub quota_bytes: u64,

    /// Transfers allowed to move bytes at the same time.
    pub max_concurrent_transfers: usize,

    /// Bytes per upload request or download range.
    pub chunk_size: usize,

    /// Cache directory. Defaults to `<data dir>/attachments` when unset.
    pub cache_dir: Option<PathBuf>,

    /// Download attachments announced by sync without being asked.
    pub auto_download: bool,

    /// Per-request HTTP timeout (seconds).
    pub request_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            objects_base_url: "https://files.taskstack.app".to_string(),
            cellular_threshold_bytes: 10 * 1024 * 1024,
            quota_bytes: 0,
            max_concurrent_transfers: 2,
            chunk_size: 256 * 1024,
            cache_dir: None,
            auto_download: true,
            request_timeout_secs: 120,
        }
    }
}

impl TransferConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
