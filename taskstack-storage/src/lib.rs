//! DuckDB storage layer for TaskStack.
//!
//! Provides the durable local half of sync:
//!
//! - [`EventStore`]: append-only event ledger with per-device sequences and
//!   the `is_synced` marker that drives push
//! - [`EntityStore`]: materialized projections, written only by event
//!   application, plus the applied-event and deferred-event ledgers
//! - [`SyncStateStore`]: pull checkpoint and bootstrap progress
//! - [`DeviceRegistry`]: known devices for diagnostics
//! - [`LocalStore`]: opens all of the above on one shared connection so an
//!   event's projection write and its "applied" marker commit together
//!
//! # Architecture
//!
//! All stores share a single `Arc<Mutex<Connection>>`. DuckDB calls are
//! blocking; async callers wrap them in `spawn_blocking`.

mod device;
mod entity_store;
mod error;
mod event_store;
mod local_store;
mod sync_state;

pub use device::{Device, DeviceIdentity, DeviceRegistry};
pub use entity_store::{EntityChange, EntityStore, Projection};
pub use error::{StorageError, StorageResult};
pub use event_store::{EventCursor, EventStore};
pub use local_store::LocalStore;
pub use sync_state::{BootstrapState, SyncStateStore};

use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Open a DuckDB connection with stale WAL recovery and resource limits.
///
/// If the initial open fails and a `.wal` file exists alongside the database,
/// it is removed and the open is retried once. An unclean shutdown can leave
/// a WAL file that prevents reopening.
pub fn open_duckdb_with_wal_recovery(
    path: &std::path::Path,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<Connection> {
    let conn = match Connection::open(path) {
        Ok(c) => c,
        Err(first_err) => {
            let wal_path = path.with_extension(
                path.extension()
                    .map(|ext| format!("{}.wal", ext.to_string_lossy()))
                    .unwrap_or_else(|| "wal".to_string()),
            );
            if wal_path.exists() {
                warn!(
                    "DuckDB open failed, removing stale WAL and retrying: {}",
                    wal_path.display()
                );
                if std::fs::remove_file(&wal_path).is_ok() {
                    let c = Connection::open(path)?;
                    apply_resource_limits(&c, memory_limit, threads)?;
                    return Ok(c);
                }
            }
            return Err(first_err.into());
        }
    };
    apply_resource_limits(&conn, memory_limit, threads)?;
    Ok(conn)
}

/// Apply memory and thread limits to a DuckDB connection.
fn apply_resource_limits(conn: &Connection, memory_limit: &str, threads: u32) -> StorageResult<()> {
    conn.execute_batch(&format!(
        "PRAGMA memory_limit='{}'; PRAGMA threads={};",
        memory_limit, threads
    ))?;
    Ok(())
}

/// Locks the shared connection, recovering from poison.
///
/// A panic while the lock was held leaves DuckDB itself consistent (every
/// write is transactional), so the guard is still safe to use.
pub(crate) fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| {
        warn!("recovering from poisoned storage mutex");
        PoisonError::into_inner(poisoned)
    })
}

pub(crate) fn millis_to_datetime(ms: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {ms}")))
}

/// Creates every table the local store needs. Idempotent.
pub(crate) fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id VARCHAR PRIMARY KEY,
            event_type VARCHAR NOT NULL,
            entity_id VARCHAR NOT NULL,
            origin_device_id VARCHAR NOT NULL,
            timestamp_ms BIGINT NOT NULL,
            sequence BIGINT NOT NULL,
            payload_json TEXT NOT NULL,
            is_synced BOOLEAN NOT NULL DEFAULT false,
            synced_at_ms BIGINT,
            received_at_ms BIGINT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_id);
        CREATE INDEX IF NOT EXISTS idx_events_origin_seq ON events(origin_device_id, sequence);

        CREATE TABLE IF NOT EXISTS projections (
            entity_id VARCHAR PRIMARY KEY,
            entity_type VARCHAR NOT NULL,
            fields_json TEXT NOT NULL,
            versions_json TEXT NOT NULL,
            deleted BOOLEAN NOT NULL DEFAULT false,
            deleted_version_json TEXT,
            record_version_json TEXT,
            created_at_ms BIGINT NOT NULL,
            updated_at_ms BIGINT NOT NULL,
            last_event_id VARCHAR NOT NULL
        );

        CREATE TABLE IF NOT EXISTS applied_events (
            event_id VARCHAR PRIMARY KEY,
            entity_id VARCHAR NOT NULL,
            applied_at_ms BIGINT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS deferred_events (
            event_id VARCHAR PRIMARY KEY,
            entity_id VARCHAR NOT NULL,
            event_json TEXT NOT NULL,
            deferred_at_ms BIGINT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_deferred_entity ON deferred_events(entity_id);

        CREATE TABLE IF NOT EXISTS local_state (
            key VARCHAR PRIMARY KEY,
            value VARCHAR NOT NULL
        );

        CREATE TABLE IF NOT EXISTS devices (
            id VARCHAR PRIMARY KEY,
            display_name VARCHAR,
            last_seen_at_ms BIGINT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// Reads a value from the `local_state` key/value table.
pub(crate) fn kv_get(conn: &Connection, key: &str) -> StorageResult<Option<String>> {
    let result = conn.query_row(
        "SELECT value FROM local_state WHERE key = ?",
        duckdb::params![key],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(v) => Ok(Some(v)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes a value to the `local_state` key/value table.
pub(crate) fn kv_set(conn: &Connection, key: &str, value: &str) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO local_state (key, value) VALUES (?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        duckdb::params![key, value],
    )?;
    Ok(())
}

pub(crate) fn kv_get_i64(conn: &Connection, key: &str) -> StorageResult<Option<i64>> {
    match kv_get(conn, key)? {
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|e| StorageError::Corrupt(format!("local_state {key}={raw:?}: {e}"))),
        None => Ok(None),
    }
}

pub(crate) fn kv_delete(conn: &Connection, key: &str) -> StorageResult<()> {
    conn.execute("DELETE FROM local_state WHERE key = ?", duckdb::params![key])?;
    Ok(())
}
