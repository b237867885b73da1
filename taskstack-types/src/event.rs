//! Domain events and the write-ordering used for conflict resolution.

use crate::ids::{DeviceId, EntityId, EventId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Returns the current time truncated to millisecond precision.
///
/// Event timestamps are persisted as epoch milliseconds, so every producer
/// truncates up front to keep in-memory and stored versions identical.
pub fn now_millis() -> DateTime<Utc> {
    let ms = Utc::now().timestamp_millis();
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// The action half of a `domain.action` event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    /// Creates the projection (whole-record write).
    Created,
    /// Sets individual fields (field-level last-write-wins).
    Updated,
    /// Replaces the whole record (record-level last-write-wins).
    Replaced,
    /// Soft-deletes the projection.
    Deleted,
    /// Clears the soft-delete flag.
    Restored,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Created => "created",
            EventAction::Updated => "updated",
            EventAction::Replaced => "replaced",
            EventAction::Deleted => "deleted",
            EventAction::Restored => "restored",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventTypeError {
    #[error("event type {0:?} is not of the form domain.action")]
    Malformed(String),
    #[error("unknown event action {0:?}")]
    UnknownAction(String),
}

impl FromStr for EventAction {
    type Err = EventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(EventAction::Created),
            "updated" => Ok(EventAction::Updated),
            "replaced" => Ok(EventAction::Replaced),
            "deleted" => Ok(EventAction::Deleted),
            "restored" => Ok(EventAction::Restored),
            other => Err(EventTypeError::UnknownAction(other.to_string())),
        }
    }
}

/// Builds a namespaced event type string, e.g. `task.updated`.
pub fn event_type(domain: &str, action: EventAction) -> String {
    format!("{domain}.{action}")
}

/// Splits `domain.action` into its parts. The domain may itself contain dots
/// (`task.reminder.updated`); the action is always the last segment.
pub fn parse_event_type(event_type: &str) -> Result<(&str, EventAction), EventTypeError> {
    let (domain, action) = event_type
        .rsplit_once('.')
        .filter(|(d, a)| !d.is_empty() && !a.is_empty())
        .ok_or_else(|| EventTypeError::Malformed(event_type.to_string()))?;
    Ok((domain, action.parse()?))
}

/// Total order over writes: `(timestamp, sequence, origin device)`.
///
/// The greatest version wins a conflict, whatever order events arrive in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub timestamp_ms: i64,
    pub sequence: u64,
    pub origin: DeviceId,
}

/// An event before the store has assigned its origin and sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub id: EventId,
    pub event_type: String,
    pub entity_id: EntityId,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(
        domain: &str,
        action: EventAction,
        entity_id: EntityId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type(domain, action),
            entity_id,
            payload,
            timestamp: now_millis(),
        }
    }
}

/// Immutable record of one state change; the unit of synchronization.
///
/// Only `is_synced`/`synced_at` ever change after creation, and only from
/// unsynced to synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub entity_id: EntityId,
    pub payload: serde_json::Value,
    pub origin_device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    #[serde(default)]
    pub is_synced: bool,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Version used to order this event against concurrent writes.
    pub fn version(&self) -> Version {
        Version {
            timestamp_ms: self.timestamp.timestamp_millis(),
            sequence: self.sequence,
            origin: self.origin_device_id,
        }
    }

    /// Domain (entity type) and action parsed from `event_type`.
    pub fn kind(&self) -> Result<(&str, EventAction), EventTypeError> {
        parse_event_type(&self.event_type)
    }
}
