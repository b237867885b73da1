//! Transfer error types.

use crate::types::Direction;
use taskstack_types::EntityId;
use thiserror::Error;

/// Result type for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors that can occur while scheduling or running an attachment transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer record storage failed: {0}")]
    Storage(String),

    #[error("remote object storage failed: {0}")]
    Remote(String),

    #[error("local file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage quota exceeded: used {used} of {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },

    /// A large upload on cellular needs a user decision and nobody is
    /// listening for one.
    #[error("cellular transfer needs a user decision")]
    CellularDecisionPending,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("{direction} of attachment {attachment_id} is already in progress")]
    AlreadyActive {
        attachment_id: EntityId,
        direction: Direction,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transfer state: {0}")]
    InvalidState(String),
}

impl TransferError {
    /// Stable machine-readable kind for error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Storage(_) => "storage",
            TransferError::Remote(_) => "remote",
            TransferError::Io(_) => "io",
            TransferError::QuotaExceeded { .. } => "quota_exceeded",
            TransferError::CellularDecisionPending => "cellular_decision_pending",
            TransferError::Cancelled => "cancelled",
            TransferError::AlreadyActive { .. } => "already_active",
            TransferError::NotFound(_) => "not_found",
            TransferError::InvalidState(_) => "invalid_state",
        }
    }

    /// Whether the error waits on the user rather than signalling a failure.
    pub fn needs_decision(&self) -> bool {
        matches!(
            self,
            TransferError::QuotaExceeded { .. } | TransferError::CellularDecisionPending
        )
    }
}

impl From<rusqlite::Error> for TransferError {
    fn from(err: rusqlite::Error) -> Self {
        TransferError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        TransferError::Remote(err.to_string())
    }
}
