//! Pull checkpoint and bootstrap bookkeeping.

use crate::error::{StorageError, StorageResult};
use crate::{initialize_schema, kv_delete, kv_get, kv_get_i64, kv_set, lock};
use duckdb::Connection;
use std::sync::{Arc, Mutex};
use tracing::warn;

const CHECKPOINT_KEY: &str = "sync_checkpoint";
const BOOTSTRAP_STATE_KEY: &str = "bootstrap_state";
const BOOTSTRAP_PROCESSED_KEY: &str = "bootstrap_events_processed";

/// Lifecycle of the initial full pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NotStarted,
    InProgress,
    Complete,
}

impl BootstrapState {
    fn as_str(&self) -> &'static str {
        match self {
            BootstrapState::NotStarted => "not_started",
            BootstrapState::InProgress => "in_progress",
            BootstrapState::Complete => "complete",
        }
    }

    fn parse(raw: &str) -> StorageResult<Self> {
        match raw {
            "not_started" => Ok(BootstrapState::NotStarted),
            "in_progress" => Ok(BootstrapState::InProgress),
            "complete" => Ok(BootstrapState::Complete),
            other => Err(StorageError::Corrupt(format!("bootstrap state {other:?}"))),
        }
    }
}

/// Persisted sync cursor and bootstrap progress.
///
/// The checkpoint is process-wide and survives restarts; only
/// [`LocalStore::wipe`](crate::LocalStore::wipe) clears it.
#[derive(Clone)]
pub struct SyncStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SyncStateStore {
    pub fn with_conn(conn: Arc<Mutex<Connection>>) -> StorageResult<Self> {
        initialize_schema(&lock(&conn))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_conn(Arc::new(Mutex::new(Connection::open_in_memory()?)))
    }

    /// Current pull checkpoint, `None` before the first completed page.
    pub fn checkpoint(&self) -> StorageResult<Option<i64>> {
        kv_get_i64(&lock(&self.conn), CHECKPOINT_KEY)
    }

    /// Advances the checkpoint. Never regresses: a cursor at or behind the
    /// current one is ignored and `false` returned.
    pub fn advance_checkpoint(&self, cursor: i64) -> StorageResult<bool> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let current = kv_get_i64(&tx, CHECKPOINT_KEY)?;
        if let Some(current) = current {
            if cursor <= current {
                if cursor < current {
                    warn!(current, cursor, "refusing to move sync checkpoint backwards");
                }
                return Ok(false);
            }
        }
        kv_set(&tx, CHECKPOINT_KEY, &cursor.to_string())?;
        tx.commit()?;
        Ok(true)
    }

    /// Advances the checkpoint and adds to the bootstrap progress counter in
    /// one transaction, so a resumed bootstrap never double counts a page.
    pub fn advance_bootstrap_page(&self, cursor: i64, events_in_page: u64) -> StorageResult<u64> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let current = kv_get_i64(&tx, CHECKPOINT_KEY)?;
        if current.is_none_or(|c| cursor > c) {
            kv_set(&tx, CHECKPOINT_KEY, &cursor.to_string())?;
        }
        let processed = kv_get_i64(&tx, BOOTSTRAP_PROCESSED_KEY)?.unwrap_or(0) as u64 + events_in_page;
        kv_set(&tx, BOOTSTRAP_PROCESSED_KEY, &processed.to_string())?;
        tx.commit()?;
        Ok(processed)
    }

    pub fn bootstrap_state(&self) -> StorageResult<BootstrapState> {
        match kv_get(&lock(&self.conn), BOOTSTRAP_STATE_KEY)? {
            Some(raw) => BootstrapState::parse(&raw),
            None => Ok(BootstrapState::NotStarted),
        }
    }

    /// Events applied so far by the current (or last) bootstrap.
    pub fn bootstrap_events_processed(&self) -> StorageResult<u64> {
        Ok(kv_get_i64(&lock(&self.conn), BOOTSTRAP_PROCESSED_KEY)?.unwrap_or(0) as u64)
    }

    /// Starts a fresh bootstrap: clears the checkpoint and progress counter so
    /// the full history is pulled.
    pub fn begin_bootstrap(&self) -> StorageResult<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        kv_delete(&tx, CHECKPOINT_KEY)?;
        kv_set(&tx, BOOTSTRAP_PROCESSED_KEY, "0")?;
        kv_set(&tx, BOOTSTRAP_STATE_KEY, BootstrapState::InProgress.as_str())?;
        tx.commit()?;
        Ok(())
    }

    pub fn complete_bootstrap(&self) -> StorageResult<()> {
        kv_set(
            &lock(&self.conn),
            BOOTSTRAP_STATE_KEY,
            BootstrapState::Complete.as_str(),
        )
    }

    /// Clears the checkpoint and bootstrap progress.
    pub(crate) fn clear(conn: &Connection) -> StorageResult<()> {
        kv_delete(conn, CHECKPOINT_KEY)?;
        kv_delete(conn, BOOTSTRAP_STATE_KEY)?;
        kv_delete(conn, BOOTSTRAP_PROCESSED_KEY)?;
        Ok(())
    }
}
