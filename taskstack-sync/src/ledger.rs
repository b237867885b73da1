//! Local write path for entity services.
//!
//! Entity services never touch projections. They call
//! [`EventLedger::record`], which appends the event and applies it under the
//! entity's write lock.

use crate::applicator::{validate, ApplyOutcome, EventApplicator};
use crate::blocking;
use crate::entity_lock::EntityLocks;
use crate::error::{ApplyError, SyncError, SyncResult};
use crate::manager::SyncManager;
use crate::reporter::{ErrorReport, ErrorReporter, TracingReporter};
use serde_json::Value;
use std::sync::Arc;
use taskstack_storage::LocalStore;
use taskstack_types::{EntityId, Event, EventAction, NewEvent};
use tracing::{debug, info};

const REAPPLY_BATCH: usize = 256;

/// Appends local events and folds them into projections.
#[derive(Clone)]
pub struct EventLedger {
    store: LocalStore,
    applicator: EventApplicator,
    locks: Arc<EntityLocks>,
    reporter: Arc<dyn ErrorReporter>,
    sync: Option<SyncManager>,
}

impl EventLedger {
    pub fn new(store: LocalStore, locks: Arc<EntityLocks>) -> Self {
        Self {
            applicator: EventApplicator::new(store.clone()),
            store,
            locks,
            reporter: Arc::new(TracingReporter),
            sync: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Pushes right after every recorded event.
    pub fn with_sync(mut self, sync: SyncManager) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Records one local change to `entity_id`.
    ///
    /// The event is appended and applied under the entity lock. A write that
    /// targets an entity of another type is refused before the append, so a
    /// rejected write never reaches the server. If the append fails nothing
    /// exists. If the apply fails the event is durable but stays unapplied;
    /// [`reapply_pending`](Self::reapply_pending) retries it.
    pub async fn record(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        action: EventAction,
        payload: Value,
    ) -> SyncResult<Event> {
        let draft = NewEvent::new(entity_type, action, entity_id, payload);
        validate(&draft.event_type, &draft.payload).map_err(|source| {
            SyncError::ConflictApply {
                event_id: draft.id,
                source,
            }
        })?;

        let guard = self.locks.lock(entity_id).await;
        let store = self.store.clone();
        let applicator = self.applicator.clone();
        let incoming = entity_type.to_string();
        let written = blocking(move || {
            if let Some(current) = store.entities().get(&entity_id)? {
                if current.entity_type != incoming {
                    return Err(SyncError::ConflictApply {
                        event_id: draft.id,
                        source: ApplyError::EntityTypeMismatch {
                            entity_id,
                            existing: current.entity_type,
                            incoming,
                        },
                    });
                }
            }
            let event = store.events().append(draft)?;
            let applied = applicator.apply_or_skip(&event);
            Ok((event, applied))
        })
        .await;
        drop(guard);
        let (event, applied) = match written {
            Ok(written) => written,
            Err(err) => {
                self.report("record", entity_id, &err);
                return Err(err);
            }
        };

        match applied {
            Ok(ApplyOutcome::Skipped(source)) => {
                let err = SyncError::ConflictApply {
                    event_id: event.id,
                    source,
                };
                self.report("record", entity_id, &err);
                return Err(err);
            }
            Ok(outcome) => {
                debug!(event = %event.id, entity = %entity_id, ?outcome, "recorded {}", event.event_type);
            }
            Err(err) => {
                self.report("record", entity_id, &err);
                return Err(err);
            }
        }

        if let Some(sync) = &self.sync {
            sync.trigger_immediate_push();
        }
        Ok(event)
    }

    /// Replays events whose projection update never committed (a failed
    /// apply or a crash between append and apply). Returns how many events
    /// were folded.
    pub async fn reapply_pending(&self) -> SyncResult<usize> {
        let mut applied = 0;
        loop {
            let store = self.store.clone();
            let batch =
                blocking(move || Ok(store.events().unapplied_events(REAPPLY_BATCH)?)).await?;
            if batch.is_empty() {
                break;
            }

            for event in batch {
                let entity_id = event.entity_id;
                let _guard = self.locks.lock(entity_id).await;
                let applicator = self.applicator.clone();
                let outcome = blocking(move || applicator.apply_or_skip(&event)).await?;
                match outcome {
                    ApplyOutcome::Applied { replayed } => applied += 1 + replayed,
                    ApplyOutcome::Skipped(source) => self.reporter.report(
                        &ErrorReport::new("reapply", "conflict_apply", source.to_string())
                            .with_entity(entity_id),
                    ),
                    ApplyOutcome::AlreadyApplied | ApplyOutcome::Deferred => {}
                }
            }
        }

        if applied > 0 {
            info!("reapplied {applied} pending events");
        }
        Ok(applied)
    }

    fn report(&self, action: &str, entity_id: EntityId, err: &SyncError) {
        self.reporter
            .report(&ErrorReport::new(action, err.kind(), err.to_string()).with_entity(entity_id));
    }
}
