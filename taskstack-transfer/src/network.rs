//! Network reachability as observable state.
//!
//! The platform layer feeds reachability changes in with
//! [`NetworkMonitor::set`]; the coordinator watches for the switch to WiFi.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkStatus {
    pub is_connected: bool,
    pub is_wifi: bool,
}

impl NetworkStatus {
    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_wifi: false,
        }
    }

    pub fn wifi() -> Self {
        Self {
            is_connected: true,
            is_wifi: true,
        }
    }

    pub fn cellular() -> Self {
        Self {
            is_connected: true,
            is_wifi: false,
        }
    }

    /// Connected over an unmetered link.
    pub fn is_unmetered(&self) -> bool {
        self.is_connected && self.is_wifi
    }
}

/// Shared handle to the current network status. Cheap to clone.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    /// Publishes a reachability change. Repeating the current status is a
    /// no-op for watchers.
    pub fn set(&self, status: NetworkStatus) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            debug!(connected = status.is_connected, wifi = status.is_wifi, "network changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::offline())
    }
}
