//! Sync error types.

use taskstack_storage::StorageError;
use taskstack_types::{EntityId, EventId, EventTypeError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Why a single event could not be folded into its projection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error(transparent)]
    EventType(#[from] EventTypeError),

    #[error("{event_type} payload must be a JSON object")]
    PayloadNotObject { event_type: String },

    #[error("entity {entity_id} is a {existing}, event targets {incoming}")]
    EntityTypeMismatch {
        entity_id: EntityId,
        existing: String,
        incoming: String,
    },
}

/// Errors that can occur during sync.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cannot apply event {event_id}: {source}")]
    ConflictApply {
        event_id: EventId,
        #[source]
        source: ApplyError,
    },

    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Only corrupted local data is unrecoverable. Everything else is retried
    /// by the next manual or periodic trigger.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Storage(e) => !e.is_fatal(),
            _ => true,
        }
    }

    /// Whether this error says anything about reachability of the server.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Rejected { .. } | SyncError::Protocol(_)
        )
    }

    /// Stable machine-readable kind for error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Storage(_) => "storage",
            SyncError::Transport(_) => "transport",
            SyncError::Rejected { .. } => "rejected",
            SyncError::Protocol(_) => "protocol",
            SyncError::ConflictApply { .. } => "conflict_apply",
            SyncError::ChannelClosed => "channel_closed",
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return SyncError::Protocol(e.to_string());
        }
        match e.status() {
            Some(status) if status.is_client_error() => SyncError::Rejected {
                status: status.as_u16(),
                message: e.to_string(),
            },
            _ => SyncError::Transport(e.to_string()),
        }
    }
}
