//! Projection store: materialized entity state derived from events.
//!
//! Projections are never written directly by entity services. The only write
//! path is [`EntityStore::commit_application`], which stores the folded
//! projection and the event's "applied" marker in one transaction.

use crate::error::{StorageError, StorageResult};
use crate::{initialize_schema, lock, millis_to_datetime};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use serde_json::{Map, Value};
use taskstack_types::{EntityId, Event, EventId, Version};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Materialized view of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub entity_id: EntityId,
    pub entity_type: String,
    /// Current field values. Fields removed by a whole-record write hold `null`.
    pub fields: Map<String, Value>,
    /// Version of the write that last set each field.
    pub field_versions: BTreeMap<String, Version>,
    /// Soft-delete flag; entities are never physically removed.
    pub deleted: bool,
    pub deleted_version: Option<Version>,
    /// Version of the newest whole-record write (`created`/`replaced`).
    /// A field write older than this never lands, even on a field the
    /// record write did not mention.
    pub record_version: Option<Version>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_event_id: EventId,
}

impl Projection {
    /// Reads a string field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|v| v.as_str())
    }

    /// Reads an integer field.
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(|v| v.as_i64())
    }

    /// Reads a boolean field.
    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.fields.get(field).and_then(|v| v.as_bool())
    }

    /// Highest version that has touched this projection.
    pub fn max_version(&self) -> Option<Version> {
        self.field_versions
            .values()
            .copied()
            .chain(self.deleted_version)
            .chain(self.record_version)
            .max()
    }
}

/// Change notification emitted after a projection commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityChange {
    pub entity_id: EntityId,
    pub entity_type: String,
    pub event_id: EventId,
}

/// Projection store backed by DuckDB.
#[derive(Clone)]
pub struct EntityStore {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<EntityChange>,
}

const PROJECTION_COLUMNS: &str = "entity_id, entity_type, fields_json, versions_json, deleted, \
                                  deleted_version_json, record_version_json, created_at_ms, \
                                  updated_at_ms, last_event_id";

impl EntityStore {
    /// Opens or creates a projection store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_duckdb_with_wal_recovery(path, "256MB", 2)?;
        Self::with_conn(Arc::new(Mutex::new(conn)))
    }

    /// Opens an in-memory projection store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_conn(Arc::new(Mutex::new(conn)))
    }

    /// Builds a projection store over an existing shared connection.
    pub fn with_conn(conn: Arc<Mutex<Connection>>) -> StorageResult<Self> {
        initialize_schema(&lock(&conn))?;
        let (changes, _) = broadcast::channel(256);
        Ok(Self { conn, changes })
    }

    /// Subscribes to projection changes. Reactivity is left to the caller;
    /// a lagging receiver simply misses notifications and should re-query.
    pub fn subscribe(&self) -> broadcast::Receiver<EntityChange> {
        self.changes.subscribe()
    }

    /// Gets a projection by entity id, including soft-deleted ones.
    pub fn get(&self, entity_id: &EntityId) -> StorageResult<Option<Projection>> {
        let conn = lock(&self.conn);
        let sql = format!("SELECT {PROJECTION_COLUMNS} FROM projections WHERE entity_id = ?");
        Ok(query_projections(&conn, &sql, params![entity_id.to_string()])?
            .into_iter()
            .next())
    }

    /// Lists projections, optionally filtered by entity type.
    pub fn list(
        &self,
        entity_type: Option<&str>,
        include_deleted: bool,
    ) -> StorageResult<Vec<Projection>> {
        let conn = lock(&self.conn);
        let deleted_filter = if include_deleted { "" } else { " AND deleted = false" };
        match entity_type {
            Some(ty) => {
                let sql = format!(
                    "SELECT {PROJECTION_COLUMNS} FROM projections \
                     WHERE entity_type = ?{deleted_filter} ORDER BY created_at_ms, entity_id"
                );
                query_projections(&conn, &sql, params![ty])
            }
            None => {
                let sql = format!(
                    "SELECT {PROJECTION_COLUMNS} FROM projections \
                     WHERE true{deleted_filter} ORDER BY created_at_ms, entity_id"
                );
                query_projections(&conn, &sql, params![])
            }
        }
    }

    /// Number of projections (including soft-deleted).
    pub fn count(&self) -> StorageResult<usize> {
        let conn = lock(&self.conn);
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM projections", params![], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Whether an event has already been folded into a projection.
    pub fn is_applied(&self, event_id: &EventId) -> StorageResult<bool> {
        let conn = lock(&self.conn);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM applied_events WHERE event_id = ?",
            params![event_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Stores a folded projection and marks `event` applied, atomically.
    ///
    /// If this fails nothing is marked, so the event is replayed later.
    pub fn commit_application(&self, projection: &Projection, event: &Event) -> StorageResult<()> {
        {
            let mut conn = lock(&self.conn);
            let tx = conn.transaction()?;
            upsert_projection(&tx, projection)?;
            mark_applied(&tx, event)?;
            tx.execute(
                "DELETE FROM deferred_events WHERE event_id = ?",
                params![event.id.to_string()],
            )?;
            tx.commit()?;
        }

        let _ = self.changes.send(EntityChange {
            entity_id: projection.entity_id,
            entity_type: projection.entity_type.clone(),
            event_id: event.id,
        });
        Ok(())
    }

    /// Marks an event applied without touching any projection. Used for
    /// events that are skipped as unappliable so they are not retried forever.
    pub fn mark_applied(&self, event: &Event) -> StorageResult<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        mark_applied(&tx, event)?;
        tx.execute(
            "DELETE FROM deferred_events WHERE event_id = ?",
            params![event.id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Parks an event that arrived before its entity was created.
    pub fn defer(&self, event: &Event) -> StorageResult<()> {
        let conn = lock(&self.conn);
        let event_json = serde_json::to_string(event)?;
        conn.execute(
            "INSERT OR IGNORE INTO deferred_events (event_id, entity_id, event_json, deferred_at_ms) \
             VALUES (?, ?, ?, ?)",
            params![
                event.id.to_string(),
                event.entity_id.to_string(),
                event_json,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Deferred events for an entity, in version order.
    pub fn deferred_for(&self, entity_id: &EntityId) -> StorageResult<Vec<Event>> {
        let conn = lock(&self.conn);
        let mut stmt =
            conn.prepare("SELECT event_json FROM deferred_events WHERE entity_id = ?")?;
        let raw = stmt
            .query_map(params![entity_id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<String>, _>>()?;
        let mut events = raw
            .iter()
            .map(|json| serde_json::from_str::<Event>(json))
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_by_key(|e| e.version());
        Ok(events)
    }

    /// Number of events waiting for their entity to be created.
    pub fn deferred_count(&self) -> StorageResult<usize> {
        let conn = lock(&self.conn);
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM deferred_events", params![], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn mark_applied(conn: &Connection, event: &Event) -> StorageResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO applied_events (event_id, entity_id, applied_at_ms) VALUES (?, ?, ?)",
        params![
            event.id.to_string(),
            event.entity_id.to_string(),
            Utc::now().timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn upsert_projection(conn: &Connection, p: &Projection) -> StorageResult<()> {
    let fields_json = serde_json::to_string(&p.fields)?;
    let versions_json = serde_json::to_string(&p.field_versions)?;
    let deleted_version_json = p
        .deleted_version
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let record_version_json = p
        .record_version
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT OR REPLACE INTO projections (
            entity_id, entity_type, fields_json, versions_json, deleted,
            deleted_version_json, record_version_json, created_at_ms, updated_at_ms,
            last_event_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            p.entity_id.to_string(),
            p.entity_type,
            fields_json,
            versions_json,
            p.deleted,
            deleted_version_json,
            record_version_json,
            p.created_at.timestamp_millis(),
            p.updated_at.timestamp_millis(),
            p.last_event_id.to_string(),
        ],
    )?;
    Ok(())
}

type RawProjection = (
    String,
    String,
    String,
    String,
    bool,
    Option<String>,
    Option<String>,
    i64,
    i64,
    String,
);

fn query_projections(
    conn: &Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
) -> StorageResult<Vec<Projection>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?
        .collect::<Result<Vec<RawProjection>, _>>()?;

    rows.into_iter().map(raw_to_projection).collect()
}

fn raw_to_projection(raw: RawProjection) -> StorageResult<Projection> {
    let (
        entity_id,
        entity_type,
        fields_json,
        versions_json,
        deleted,
        deleted_version,
        record_version,
        created,
        updated,
        last,
    ) = raw;
    Ok(Projection {
        entity_id: entity_id
            .parse()
            .map_err(|_| StorageError::Corrupt(format!("projection entity_id: {entity_id:?}")))?,
        entity_type,
        fields: serde_json::from_str(&fields_json)?,
        field_versions: serde_json::from_str(&versions_json)?,
        deleted,
        deleted_version: deleted_version
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        record_version: record_version
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        created_at: millis_to_datetime(created)?,
        updated_at: millis_to_datetime(updated)?,
        last_event_id: last
            .parse()
            .map_err(|_| StorageError::Corrupt(format!("projection last_event_id: {last:?}")))?,
    })
}
