//! Per-entity write serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use taskstack_types::EntityId;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

/// Unused lock entries are pruned once the table grows past this.
const PRUNE_THRESHOLD: usize = 1024;

/// Held while an entity is being written. Dropping it releases the entity.
pub type EntityGuard = OwnedMutexGuard<()>;

/// Single writer per entity.
///
/// Local appends and pull-driven applies for the same entity take the same
/// lock, so their append/apply pairs never interleave. Different entities
/// have different locks and never wait on each other.
#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<EntityId, Arc<TokioMutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive write access to `entity_id`.
    pub async fn lock(&self, entity_id: EntityId) -> EntityGuard {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() > PRUNE_THRESHOLD {
                locks.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            locks.entry(entity_id).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Number of entities with a lock entry (held or not yet pruned).
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
