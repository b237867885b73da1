//! User decisions a transfer can wait on.
//!
//! The coordinator sends a [`DecisionRequest`] on the channel handed to
//! [`TransferCoordinator::with_decisions`](crate::TransferCoordinator::with_decisions)
//! and suspends only the asking transfer until the reply slot is filled.
//! Dropping the reply slot counts as no answer.

use crate::policy::QuotaCheck;
use taskstack_types::EntityId;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellularDecision {
    Proceed,
    /// Proceed, and stop asking for the rest of this session.
    ProceedForSession,
    WaitForWifi,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// The user will free space; this transfer fails with `QuotaExceeded`.
    ManageStorage,
    /// Re-check against a new quota (bytes) for the rest of the session.
    RaiseQuota(u64),
    Cancel,
}

#[derive(Debug)]
pub enum DecisionRequest {
    Cellular {
        attachment_id: EntityId,
        file_size: u64,
        reply: oneshot::Sender<CellularDecision>,
    },
    Quota {
        attachment_id: EntityId,
        file_size: u64,
        used_bytes: u64,
        quota_bytes: u64,
        check: QuotaCheck,
        reply: oneshot::Sender<QuotaDecision>,
    },
}

impl DecisionRequest {
    pub fn attachment_id(&self) -> EntityId {
        match self {
            DecisionRequest::Cellular { attachment_id, .. }
            | DecisionRequest::Quota { attachment_id, .. } => *attachment_id,
        }
    }
}

/// Creates the channel the presentation layer answers decisions on.
pub fn decision_channel(capacity: usize) -> (mpsc::Sender<DecisionRequest>, mpsc::Receiver<DecisionRequest>) {
    mpsc::channel(capacity.max(1))
}
