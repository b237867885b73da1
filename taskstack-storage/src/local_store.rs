//! The owned local-store service: one DuckDB database shared by every store.

use crate::device::{DeviceIdentity, DeviceRegistry};
use crate::entity_store::EntityStore;
use crate::error::StorageResult;
use crate::event_store::EventStore;
use crate::sync_state::SyncStateStore;
use crate::{lock, open_duckdb_with_wal_recovery};
use chrono::Utc;
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Local persisted state of one install.
///
/// Constructed explicitly at process start and injected into collaborators;
/// there is no global instance.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    identity: DeviceIdentity,
    events: Arc<EventStore>,
    entities: Arc<EntityStore>,
    sync_state: Arc<SyncStateStore>,
    devices: Arc<DeviceRegistry>,
}

impl LocalStore {
    /// Opens or creates the local store at `path`, loading the device identity
    /// stored next to it.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let identity = DeviceIdentity::load_or_create(path);
        let conn = open_duckdb_with_wal_recovery(path, "256MB", 2)?;
        info!("opened local store at {}", path.display());
        Self::build(conn, Some(path.to_path_buf()), identity)
    }

    /// Opens an in-memory store with a fresh identity (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let identity = DeviceIdentity::load_or_create(Path::new(":memory:"));
        Self::build(Connection::open_in_memory()?, None, identity)
    }

    /// Opens an in-memory store for a given identity (for multi-device tests).
    pub fn open_in_memory_as(identity: DeviceIdentity) -> StorageResult<Self> {
        Self::build(Connection::open_in_memory()?, None, identity)
    }

    fn build(conn: Connection, path: Option<PathBuf>, identity: DeviceIdentity) -> StorageResult<Self> {
        let conn = Arc::new(Mutex::new(conn));
        let events = Arc::new(EventStore::with_conn(conn.clone(), identity.id)?);
        let entities = Arc::new(EntityStore::with_conn(conn.clone())?);
        let sync_state = Arc::new(SyncStateStore::with_conn(conn.clone())?);
        let devices = Arc::new(DeviceRegistry::with_conn(conn.clone())?);

        devices.touch(identity.id, Some(&identity.display_name), Utc::now())?;

        Ok(Self {
            conn,
            path,
            identity,
            events,
            entities,
            sync_state,
            devices,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    pub fn entities(&self) -> &Arc<EntityStore> {
        &self.entities
    }

    pub fn sync_state(&self) -> &Arc<SyncStateStore> {
        &self.sync_state
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    /// True when nothing has ever been stored: no events and no projections.
    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.events.count()? == 0 && self.entities.count()? == 0)
    }

    /// Deletes all local data: event log, projections, apply ledgers,
    /// checkpoint, bootstrap state and other devices. The device identity and
    /// its sequence counter survive so the server never sees a sequence reused.
    /// The next start performs a fresh bootstrap.
    pub fn wipe(&self) -> StorageResult<()> {
        {
            let mut conn = lock(&self.conn);
            let tx = conn.transaction()?;
            tx.execute_batch(
                r#"
                DELETE FROM events;
                DELETE FROM projections;
                DELETE FROM applied_events;
                DELETE FROM deferred_events;
                DELETE FROM devices;
                "#,
            )?;
            SyncStateStore::clear(&tx)?;
            tx.commit()?;
        }
        self.devices
            .touch(self.identity.id, Some(&self.identity.display_name), Utc::now())?;
        info!("wiped local store");
        Ok(())
    }

    /// Flushes the database to disk. The store stays usable.
    pub fn checkpoint_to_disk(&self) -> StorageResult<()> {
        if self.path.is_some() {
            lock(&self.conn).execute_batch("CHECKPOINT;")?;
        }
        Ok(())
    }

    /// Flushes and releases this handle. Other clones keep the connection open.
    pub fn close(self) -> StorageResult<()> {
        self.checkpoint_to_disk()
    }
}
