//! Transfers parked until WiFi is available.
//!
//! Every operation runs under one mutex, and callers can run their own
//! bookkeeping inside that critical section, so a drain triggered by a
//! network change and a user cancel never interleave halfway.

use crate::types::TransferKey;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
pub struct WifiQueue {
    items: Mutex<VecDeque<TransferKey>>,
}

impl WifiQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TransferKey>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a transfer; returns false if it was already waiting.
    pub fn enqueue(&self, key: TransferKey) -> bool {
        let mut items = self.lock();
        if items.contains(&key) {
            return false;
        }
        items.push_back(key);
        true
    }

    /// Runs `decide` under the queue lock and enqueues the transfer if it
    /// returns true.
    pub fn enqueue_with<E>(
        &self,
        key: TransferKey,
        decide: impl FnOnce() -> Result<bool, E>,
    ) -> Result<bool, E> {
        let mut items = self.lock();
        if !decide()? {
            return Ok(false);
        }
        if !items.contains(&key) {
            items.push_back(key);
        }
        Ok(true)
    }

    /// Removes a transfer and runs `then` with whether it was queued, all
    /// under the queue lock.
    pub fn remove_then<R>(&self, key: &TransferKey, then: impl FnOnce(bool) -> R) -> R {
        let mut items = self.lock();
        let before = items.len();
        items.retain(|k| k != key);
        then(items.len() != before)
    }

    /// Takes every waiting transfer in FIFO order, calling `each` for every
    /// one before the lock is released.
    pub fn drain_with(&self, mut each: impl FnMut(TransferKey)) -> usize {
        let mut items = self.lock();
        let count = items.len();
        for key in items.drain(..) {
            each(key);
        }
        count
    }

    pub fn contains(&self, key: &TransferKey) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
