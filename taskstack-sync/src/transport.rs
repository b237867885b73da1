//! Transport abstraction for the push/pull protocol.

use crate::error::SyncResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taskstack_types::{DeviceId, Event, EventId};

/// Server acknowledgement of a pushed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushAck {
    /// Ids the server durably accepted. Only the leading run of these that
    /// matches the batch order is ever marked synced.
    pub accepted: Vec<EventId>,
}

/// One pull request: everything after `cursor`, at most `limit` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    /// `None` pulls from the start of the stream.
    pub cursor: Option<i64>,
    pub limit: usize,
    pub device_id: DeviceId,
}

/// One ordered page of the remote event stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullPage {
    pub events: Vec<Event>,
    /// Cursor to persist once every event in this page is applied.
    #[serde(default)]
    pub next_cursor: Option<i64>,
    #[serde(default)]
    pub has_more: bool,
    /// Total events the server will stream for this pull, when known.
    #[serde(default)]
    pub total_count: Option<u64>,
}

/// Network client exchanging event batches and pages with the sync service.
///
/// Implementations map network failures and timeouts to
/// [`SyncError::Transport`](crate::SyncError::Transport), refusals to
/// [`SyncError::Rejected`](crate::SyncError::Rejected) and undecodable
/// responses to [`SyncError::Protocol`](crate::SyncError::Protocol).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Sends a batch of local events.
    async fn push(&self, device_id: DeviceId, events: &[Event]) -> SyncResult<PushAck>;

    /// Fetches the next page of remote events.
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullPage>;
}
