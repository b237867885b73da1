//! Process-level configuration.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use taskstack_sync::SyncConfig;
use taskstack_transfer::TransferConfig;

/// Everything the core needs to open: where data lives and how the sync and
/// transfer services behave.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Directory holding the local database, transfer records and the
    /// attachment cache.
    pub data_dir: PathBuf,
    pub sync: SyncConfig,
    pub transfer: TransferConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("taskstack-data"),
            sync: SyncConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Reads a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("taskstack.duckdb")
    }

    pub fn transfers_path(&self) -> PathBuf {
        self.data_dir.join("transfers.db")
    }

    /// The configured cache directory, else `attachments/` under the data dir.
    pub fn cache_dir(&self) -> PathBuf {
        self.transfer
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("attachments"))
    }
}
