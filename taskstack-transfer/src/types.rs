//! Transfer domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use taskstack_storage::Projection;
use taskstack_types::EntityId;

/// Entity type of attachment projections.
pub const ATTACHMENT_ENTITY: &str = "attachment";

/// Which way the bytes move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Direction::Upload),
            "download" => Ok(Direction::Download),
            other => Err(format!("unknown transfer direction: {other}")),
        }
    }
}

/// Lifecycle of one transfer.
///
/// `Pending → Transferring → {Complete | Failed | WaitingForWiFi}`, and
/// `WaitingForWiFi → Transferring` when WiFi appears. `Failed` stays put
/// until an explicit retry moves it back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Transferring,
    WaitingForWiFi,
    Failed,
    Complete,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Pending => "pending",
            TransferState::Transferring => "transferring",
            TransferState::WaitingForWiFi => "waiting_for_wifi",
            TransferState::Failed => "failed",
            TransferState::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransferState::Pending),
            "transferring" => Some(TransferState::Transferring),
            "waiting_for_wifi" => Some(TransferState::WaitingForWiFi),
            "failed" => Some(TransferState::Failed),
            "complete" => Some(TransferState::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a transfer: at most one exists per attachment and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub attachment_id: EntityId,
    pub direction: Direction,
}

impl TransferKey {
    pub fn new(attachment_id: EntityId, direction: Direction) -> Self {
        Self {
            attachment_id,
            direction,
        }
    }
}

/// Persisted state of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub attachment_id: EntityId,
    pub direction: Direction,
    pub file_size: u64,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub last_error: Option<String>,
    pub remote_key: Option<String>,
    /// Upload source, or the cached file once a download completes.
    pub local_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn key(&self) -> TransferKey {
        TransferKey::new(self.attachment_id, self.direction)
    }
}

/// An attachment as the coordinator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: EntityId,
    pub file_name: String,
    pub file_size: u64,
    /// File to upload. Unused for downloads.
    pub local_path: Option<PathBuf>,
    /// Object key on the remote store, once uploaded.
    pub remote_key: Option<String>,
}

impl Attachment {
    /// Object key to upload to: the known one, else `attachments/<id>`.
    pub fn upload_key(&self) -> String {
        self.remote_key
            .clone()
            .unwrap_or_else(|| format!("attachments/{}", self.id))
    }

    /// Reads an attachment from its synced projection. Returns `None` for
    /// other entity types and deleted attachments.
    pub fn from_projection(projection: &Projection) -> Option<Self> {
        if projection.entity_type != ATTACHMENT_ENTITY || projection.deleted {
            return None;
        }
        Some(Self {
            id: projection.entity_id,
            file_name: projection.get_str("file_name").unwrap_or_default().to_string(),
            file_size: projection.get_i64("file_size").unwrap_or(0).max(0) as u64,
            local_path: None,
            remote_key: projection.get_str("remote_key").map(str::to_string),
        })
    }
}

/// Snapshot published on a transfer's progress channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub total: u64,
}

impl TransferProgress {
    /// Fraction done in `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return if self.state == TransferState::Complete { 1.0 } else { 0.0 };
        }
        (self.bytes_transferred as f64 / self.total as f64).min(1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { remote_key: String },
    QueuedForWifi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded(PathBuf),
    QueuedForWifi,
}
