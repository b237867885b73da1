//! Append-only event ledger, the local record of every domain change.

use crate::error::{StorageError, StorageResult};
use crate::{initialize_schema, kv_get_i64, kv_set, lock, millis_to_datetime};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use taskstack_types::{DeviceId, EntityId, Event, EventId, NewEvent, Version};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Position in the local history, ordered like [`Version`].
pub type EventCursor = Version;

const LOCAL_SEQUENCE_KEY: &str = "local_sequence";

const EVENT_COLUMNS: &str = "id, event_type, entity_id, origin_device_id, timestamp_ms, \
                             sequence, payload_json, is_synced, synced_at_ms";

/// Persists domain events and their sync state.
#[derive(Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
    device_id: DeviceId,
}

impl EventStore {
    /// Opens or creates an event store at the given path.
    pub fn open(path: &Path, device_id: DeviceId) -> StorageResult<Self> {
        let conn = crate::open_duckdb_with_wal_recovery(path, "128MB", 1)?;
        Self::with_conn(Arc::new(Mutex::new(conn)), device_id)
    }

    /// Opens an in-memory event store (for testing).
    pub fn open_in_memory(device_id: DeviceId) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_conn(Arc::new(Mutex::new(conn)), device_id)
    }

    /// Builds an event store over an existing shared connection.
    pub fn with_conn(conn: Arc<Mutex<Connection>>, device_id: DeviceId) -> StorageResult<Self> {
        initialize_schema(&lock(&conn))?;
        Ok(Self { conn, device_id })
    }

    /// The device every appended event is attributed to.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Appends a locally produced event.
    ///
    /// The sequence is taken from the persisted per-device counter inside the
    /// same transaction as the insert, so sequences are gapless and survive
    /// restarts. The event does not exist until this returns `Ok`.
    pub fn append(&self, draft: NewEvent) -> StorageResult<Event> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;

        let last = kv_get_i64(&tx, LOCAL_SEQUENCE_KEY)?.unwrap_or(0);
        let sequence = last + 1;

        let event = Event {
            id: draft.id,
            event_type: draft.event_type,
            entity_id: draft.entity_id,
            payload: draft.payload,
            origin_device_id: self.device_id,
            timestamp: draft.timestamp,
            sequence: sequence as u64,
            is_synced: false,
            synced_at: None,
        };

        insert_event(&tx, &event)?;
        kv_set(&tx, LOCAL_SEQUENCE_KEY, &sequence.to_string())?;
        tx.commit()?;

        Ok(event)
    }

    /// Stores an event received from the server. Pulled events are synced by
    /// definition. Returns `false` if the id was already present.
    pub fn insert_remote(&self, event: &Event, synced_at: DateTime<Utc>) -> StorageResult<bool> {
        let conn = lock(&self.conn);
        let mut stored = event.clone();
        stored.is_synced = true;
        stored.synced_at = Some(synced_at);
        let inserted = insert_event(&conn, &stored)?;
        Ok(inserted > 0)
    }

    /// Marks events as acknowledged by the server.
    ///
    /// Idempotent: ids that are already synced (or unknown) are left alone.
    /// Returns how many events transitioned.
    pub fn mark_synced(&self, ids: &[EventId], synced_at: DateTime<Utc>) -> StorageResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let mut changed = 0;
        for id in ids {
            changed += tx.execute(
                "UPDATE events SET is_synced = true, synced_at_ms = ? \
                 WHERE id = ? AND is_synced = false",
                params![synced_at.timestamp_millis(), id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Unsynced local events, ascending by sequence. Feeds push.
    pub fn pending_events(&self, limit: usize) -> StorageResult<Vec<Event>> {
        let conn = lock(&self.conn);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE is_synced = false AND origin_device_id = ? \
             ORDER BY sequence LIMIT ?"
        );
        query_events(
            &conn,
            &sql,
            params![self.device_id.to_string(), limit as i64],
        )
    }

    /// Number of local events not yet acknowledged by the server.
    pub fn pending_count(&self) -> StorageResult<usize> {
        let conn = lock(&self.conn);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE is_synced = false AND origin_device_id = ?",
            params![self.device_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// History after `cursor` (or from the beginning), in version order.
    pub fn events_since(
        &self,
        cursor: Option<&EventCursor>,
        limit: usize,
    ) -> StorageResult<Vec<Event>> {
        let conn = lock(&self.conn);
        match cursor {
            None => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM events \
                     ORDER BY timestamp_ms, sequence, origin_device_id LIMIT ?"
                );
                query_events(&conn, &sql, params![limit as i64])
            }
            Some(c) => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM events \
                     WHERE timestamp_ms > ? \
                        OR (timestamp_ms = ? AND sequence > ?) \
                        OR (timestamp_ms = ? AND sequence = ? AND origin_device_id > ?) \
                     ORDER BY timestamp_ms, sequence, origin_device_id LIMIT ?"
                );
                let origin = c.origin.to_string();
                query_events(
                    &conn,
                    &sql,
                    params![
                        c.timestamp_ms,
                        c.timestamp_ms,
                        c.sequence as i64,
                        c.timestamp_ms,
                        c.sequence as i64,
                        origin,
                        limit as i64,
                    ],
                )
            }
        }
    }

    /// Gets all events for an entity in version order.
    pub fn events_for_entity(&self, entity_id: &EntityId) -> StorageResult<Vec<Event>> {
        let conn = lock(&self.conn);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE entity_id = ? \
             ORDER BY timestamp_ms, sequence, origin_device_id"
        );
        query_events(&conn, &sql, params![entity_id.to_string()])
    }

    /// Events whose projection update never committed, in version order.
    ///
    /// Non-empty only after a failed apply or a crash between append and
    /// apply; the ledger replays these on start.
    pub fn unapplied_events(&self, limit: usize) -> StorageResult<Vec<Event>> {
        let conn = lock(&self.conn);
        let sql = String::from(
            "SELECT e.id, e.event_type, e.entity_id, e.origin_device_id, e.timestamp_ms, \
                    e.sequence, e.payload_json, e.is_synced, e.synced_at_ms \
             FROM events e \
             WHERE NOT EXISTS (SELECT 1 FROM applied_events a WHERE a.event_id = e.id) \
               AND NOT EXISTS (SELECT 1 FROM deferred_events d WHERE d.event_id = e.id) \
             ORDER BY e.timestamp_ms, e.sequence, e.origin_device_id LIMIT ?"
        );
        query_events(&conn, &sql, params![limit as i64])
    }

    pub fn get_event(&self, id: &EventId) -> StorageResult<Option<Event>> {
        let conn = lock(&self.conn);
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?");
        Ok(query_events(&conn, &sql, params![id.to_string()])?
            .into_iter()
            .next())
    }

    pub fn contains(&self, id: &EventId) -> StorageResult<bool> {
        let conn = lock(&self.conn);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE id = ?",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Total number of events in the log.
    pub fn count(&self) -> StorageResult<usize> {
        let conn = lock(&self.conn);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", params![], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Last sequence handed out to a local event (0 if none yet).
    pub fn last_local_sequence(&self) -> StorageResult<u64> {
        let conn = lock(&self.conn);
        Ok(kv_get_i64(&conn, LOCAL_SEQUENCE_KEY)?.unwrap_or(0) as u64)
    }
}

fn insert_event(conn: &Connection, event: &Event) -> StorageResult<usize> {
    let payload_json = serde_json::to_string(&event.payload)?;
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO events (
            id, event_type, entity_id, origin_device_id,
            timestamp_ms, sequence, payload_json,
            is_synced, synced_at_ms, received_at_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            event.id.to_string(),
            event.event_type,
            event.entity_id.to_string(),
            event.origin_device_id.to_string(),
            event.timestamp.timestamp_millis(),
            event.sequence as i64,
            payload_json,
            event.is_synced,
            event.synced_at.map(|t| t.timestamp_millis()),
            Utc::now().timestamp_millis(),
        ],
    )?;
    Ok(inserted)
}

type RawEvent = (
    String,
    String,
    String,
    String,
    i64,
    i64,
    String,
    bool,
    Option<i64>,
);

fn query_events(
    conn: &Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
) -> StorageResult<Vec<Event>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, bool>(7)?,
                row.get::<_, Option<i64>>(8)?,
            ))
        })?
        .collect::<Result<Vec<RawEvent>, _>>()?;

    rows.into_iter().map(raw_to_event).collect()
}

fn raw_to_event(raw: RawEvent) -> StorageResult<Event> {
    let (id, event_type, entity_id, origin, ts, sequence, payload_json, is_synced, synced_at) = raw;
    let corrupt = |what: &str, value: &str| StorageError::Corrupt(format!("event {what}: {value:?}"));

    Ok(Event {
        id: id.parse().map_err(|_| corrupt("id", &id))?,
        entity_id: entity_id.parse().map_err(|_| corrupt("entity_id", &entity_id))?,
        origin_device_id: origin.parse().map_err(|_| corrupt("origin", &origin))?,
        event_type,
        timestamp: millis_to_datetime(ts)?,
        sequence: sequence as u64,
        payload: serde_json::from_str(&payload_json)?,
        is_synced,
        synced_at: synced_at.map(millis_to_datetime).transpose()?,
    })
}
