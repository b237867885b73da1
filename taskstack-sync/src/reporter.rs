//! Structured error reporting.
//!
//! Core code never formats user-facing messages. Failures are handed to an
//! [`ErrorReporter`] as a kind plus context, and the presentation layer
//! decides how to show them.

use taskstack_types::EntityId;
use tracing::warn;

/// One reportable failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Operation that failed, e.g. `push`, `pull`, `apply`.
    pub action: String,
    /// Entity the failure relates to, when there is one.
    pub entity_id: Option<EntityId>,
    /// Machine-readable error kind.
    pub kind: String,
    pub message: String,
}

impl ErrorReport {
    pub fn new(action: &str, kind: &str, message: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            entity_id: None,
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn with_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }
}

/// Receives every recoverable failure the core swallows or surfaces.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: &ErrorReport);
}

/// Default reporter: logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, report: &ErrorReport) {
        match report.entity_id {
            Some(entity) => warn!(
                action = %report.action,
                kind = %report.kind,
                %entity,
                "{}",
                report.message
            ),
            None => warn!(action = %report.action, kind = %report.kind, "{}", report.message),
        }
    }
}
