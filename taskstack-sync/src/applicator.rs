//! Event application: folds events into projections.
//!
//! Conflict resolution is last-write-wins under [`Version`] order
//! `(timestamp, sequence, origin device)`:
//!
//! - `updated` is field-level: each payload field lands only if the event is
//!   newer than that field's stamp.
//! - `created` / `replaced` are whole-record: every known field is rewritten
//!   from the payload (absent fields become `null`) unless a newer write
//!   already stamped it. The record version also fences out older field
//!   writes that arrive later.
//! - `deleted` / `restored` are last-write-wins on the soft-delete flag.
//!
//! Because every write is stamped and compared, applying the same event twice
//! or applying events in a different arrival order yields the same
//! projection. Event-id dedupe on top of that keeps re-pulled pages cheap.

use crate::error::{ApplyError, SyncError, SyncResult};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use taskstack_storage::{LocalStore, Projection};
use taskstack_types::{parse_event_type, Event, EventAction, Version};
use tracing::{debug, warn};

/// Result of folding one event against the current projection.
#[derive(Debug, Clone, PartialEq)]
pub enum Fold {
    /// The new projection to commit.
    Apply(Projection),
    /// The entity does not exist yet and the event is not a `created`.
    Defer,
}

/// What [`EventApplicator::apply`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Folded and committed. `replayed` deferred events followed it.
    Applied { replayed: usize },
    /// The event id was applied before; nothing changed.
    AlreadyApplied,
    /// Parked until the entity's `created` event arrives.
    Deferred,
    /// Unappliable; marked handled and left out of the projection.
    Skipped(ApplyError),
}

/// Checks an event type and payload before anything is stored.
pub fn validate(event_type: &str, payload: &Value) -> Result<(), ApplyError> {
    let (_, action) = parse_event_type(event_type)?;
    if writes_fields(action) && !payload.is_object() {
        return Err(ApplyError::PayloadNotObject {
            event_type: event_type.to_string(),
        });
    }
    Ok(())
}

fn writes_fields(action: EventAction) -> bool {
    matches!(
        action,
        EventAction::Created | EventAction::Replaced | EventAction::Updated
    )
}

/// Folds `event` into `current`. Pure; performs no I/O.
pub fn fold(current: Option<&Projection>, event: &Event) -> Result<Fold, ApplyError> {
    let (domain, action) = event.kind()?;
    validate(&event.event_type, &event.payload)?;
    let version = event.version();
    let empty = Map::new();
    let payload = event.payload.as_object().unwrap_or(&empty);

    let Some(current) = current else {
        if action != EventAction::Created {
            return Ok(Fold::Defer);
        }
        return Ok(Fold::Apply(Projection {
            entity_id: event.entity_id,
            entity_type: domain.to_string(),
            fields: payload.clone(),
            field_versions: payload.keys().map(|k| (k.clone(), version)).collect(),
            deleted: false,
            deleted_version: None,
            record_version: Some(version),
            created_at: event.timestamp,
            updated_at: event.timestamp,
            last_event_id: event.id,
        }));
    };

    if current.entity_type != domain {
        return Err(ApplyError::EntityTypeMismatch {
            entity_id: current.entity_id,
            existing: current.entity_type.clone(),
            incoming: domain.to_string(),
        });
    }

    let newest_before = current.max_version();
    let mut next = current.clone();

    match action {
        EventAction::Created | EventAction::Replaced => {
            if action == EventAction::Created && event.timestamp < next.created_at {
                next.created_at = event.timestamp;
            }
            let keys: BTreeSet<String> = next
                .fields
                .keys()
                .chain(payload.keys())
                .cloned()
                .collect();
            for key in keys {
                let value = payload.get(&key).cloned().unwrap_or(Value::Null);
                write_field(&mut next, key, value, version);
            }
            next.record_version = next.record_version.max(Some(version));
        }
        EventAction::Updated => {
            for (key, value) in payload {
                write_field(&mut next, key.clone(), value.clone(), version);
            }
        }
        EventAction::Deleted | EventAction::Restored => {
            if next.deleted_version.is_none_or(|v| version > v) {
                next.deleted = action == EventAction::Deleted;
                next.deleted_version = Some(version);
            }
        }
    }

    if event.timestamp > next.updated_at {
        next.updated_at = event.timestamp;
    }
    if newest_before.is_none_or(|v| version > v) {
        next.last_event_id = event.id;
    }
    Ok(Fold::Apply(next))
}

/// Last-write-wins on one field. A field never written before is fenced by
/// the record version; if the write loses it is materialized as `null` at
/// that version, exactly as if the record write had arrived after it.
fn write_field(projection: &mut Projection, key: String, value: Value, version: Version) {
    let stamp = projection
        .field_versions
        .get(&key)
        .copied()
        .max(projection.record_version);

    if stamp.is_none_or(|s| version > s) {
        projection.fields.insert(key.clone(), value);
        projection.field_versions.insert(key, version);
    } else if !projection.fields.contains_key(&key) {
        if let Some(fence) = stamp {
            projection.fields.insert(key.clone(), Value::Null);
            projection.field_versions.insert(key, fence);
        }
    }
}

/// Applies events to the local projection store.
///
/// Blocking: every method touches DuckDB. Async callers go through
/// `spawn_blocking` and hold the entity's [`EntityLocks`](crate::EntityLocks)
/// guard.
#[derive(Clone)]
pub struct EventApplicator {
    store: LocalStore,
}

impl EventApplicator {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Folds one event into its projection and commits it together with the
    /// event's applied marker.
    ///
    /// An event for an entity that does not exist yet is deferred and
    /// replayed, in version order, right after that entity's `created`
    /// commits.
    pub fn apply(&self, event: &Event) -> SyncResult<ApplyOutcome> {
        let entities = self.store.entities();
        if entities.is_applied(&event.id)? {
            debug!(event = %event.id, "event already applied");
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let current = entities.get(&event.entity_id)?;
        let fold = fold(current.as_ref(), event).map_err(|source| SyncError::ConflictApply {
            event_id: event.id,
            source,
        })?;

        match fold {
            Fold::Defer => {
                debug!(
                    event = %event.id,
                    entity = %event.entity_id,
                    event_type = %event.event_type,
                    "entity not created yet, deferring event"
                );
                entities.defer(event)?;
                Ok(ApplyOutcome::Deferred)
            }
            Fold::Apply(projection) => {
                entities.commit_application(&projection, event)?;
                let replayed = self.replay_deferred(projection)?;
                Ok(ApplyOutcome::Applied { replayed })
            }
        }
    }

    /// Like [`apply`](Self::apply), but an unappliable event is marked
    /// handled and returned as [`ApplyOutcome::Skipped`] instead of failing,
    /// so one bad event cannot block the rest of a page.
    pub fn apply_or_skip(&self, event: &Event) -> SyncResult<ApplyOutcome> {
        match self.apply(event) {
            Err(SyncError::ConflictApply { source, .. }) => {
                warn!(
                    event = %event.id,
                    entity = %event.entity_id,
                    event_type = %event.event_type,
                    "skipping unappliable event: {source}"
                );
                self.store.entities().mark_applied(event)?;
                Ok(ApplyOutcome::Skipped(source))
            }
            other => other,
        }
    }

    fn replay_deferred(&self, mut projection: Projection) -> SyncResult<usize> {
        let entities = self.store.entities();
        let deferred = entities.deferred_for(&projection.entity_id)?;
        let mut replayed = 0;

        for event in deferred {
            if entities.is_applied(&event.id)? {
                entities.mark_applied(&event)?;
                continue;
            }
            match fold(Some(&projection), &event) {
                Ok(Fold::Apply(next)) => {
                    entities.commit_application(&next, &event)?;
                    projection = next;
                    replayed += 1;
                }
                Ok(Fold::Defer) => {}
                Err(e) => {
                    warn!(event = %event.id, "skipping deferred event: {e}");
                    entities.mark_applied(&event)?;
                }
            }
        }

        if replayed > 0 {
            debug!(entity = %projection.entity_id, replayed, "replayed deferred events");
        }
        Ok(replayed)
    }
}
