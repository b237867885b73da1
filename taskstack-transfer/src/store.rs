//! SQLite persistence for transfer records.
//!
//! One row per `(attachment_id, direction)`, so the table itself enforces
//! "at most one transfer per attachment and direction".

use crate::error::{TransferError, TransferResult};
use crate::types::{Direction, TransferKey, TransferRecord, TransferState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use taskstack_types::EntityId;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transfers (
    attachment_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    state TEXT NOT NULL,
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    remote_key TEXT,
    local_path TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (attachment_id, direction)
);
CREATE INDEX IF NOT EXISTS idx_transfers_state ON transfers(state);
";

const COLUMNS: &str = "attachment_id, direction, file_size, state, bytes_transferred, \
                       last_error, remote_key, local_path, created_at, updated_at";

#[derive(Clone)]
pub struct TransferStore {
    conn: Arc<Mutex<Connection>>,
}

impl TransferStore {
    /// Opens (or creates) the record database. Transfers left `transferring`
    /// by a previous process go back to `pending`: nothing is moving them.
    pub fn open(path: &Path) -> TransferResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        let reset = store.reset_interrupted()?;
        if reset > 0 {
            info!(reset, "reset interrupted transfers to pending");
        }
        Ok(store)
    }

    pub fn open_in_memory() -> TransferResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> TransferResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &TransferKey) -> TransferResult<Option<TransferRecord>> {
        let conn = self.lock();
        let sql = format!("SELECT {COLUMNS} FROM transfers WHERE attachment_id = ?1 AND direction = ?2");
        let raw = conn
            .query_row(
                &sql,
                params![key.attachment_id.to_string(), key.direction.as_str()],
                read_raw,
            )
            .optional()?;
        raw.map(|r| r.into_record()).transpose()
    }

    /// Returns the existing record for `draft.key()`, or inserts `draft`.
    pub fn get_or_insert(&self, draft: &TransferRecord) -> TransferResult<TransferRecord> {
        {
            let conn = self.lock();
            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO transfers ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    draft.attachment_id.to_string(),
                    draft.direction.as_str(),
                    draft.file_size as i64,
                    draft.state.as_str(),
                    draft.bytes_transferred as i64,
                    draft.last_error,
                    draft.remote_key,
                    draft.local_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                    draft.created_at.timestamp_millis(),
                    draft.updated_at.timestamp_millis(),
                ],
            )?;
        }
        self.get(&draft.key())?
            .ok_or_else(|| TransferError::NotFound(format!("transfer {}", draft.attachment_id)))
    }

    /// Refreshes the transfer's source, destination and size from a new
    /// request. Progress is kept.
    pub fn update_target(
        &self,
        key: &TransferKey,
        file_size: u64,
        remote_key: Option<&str>,
        local_path: Option<&Path>,
    ) -> TransferResult<()> {
        self.lock().execute(
            "UPDATE transfers SET file_size = ?3, remote_key = COALESCE(?4, remote_key), \
             local_path = COALESCE(?5, local_path), updated_at = ?6 \
             WHERE attachment_id = ?1 AND direction = ?2",
            params![
                key.attachment_id.to_string(),
                key.direction.as_str(),
                file_size as i64,
                remote_key,
                local_path.map(|p| p.to_string_lossy().to_string()),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn set_state(
        &self,
        key: &TransferKey,
        state: TransferState,
        last_error: Option<&str>,
    ) -> TransferResult<()> {
        self.lock().execute(
            "UPDATE transfers SET state = ?3, last_error = ?4, updated_at = ?5 \
             WHERE attachment_id = ?1 AND direction = ?2",
            params![
                key.attachment_id.to_string(),
                key.direction.as_str(),
                state.as_str(),
                last_error,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn set_progress(&self, key: &TransferKey, bytes_transferred: u64) -> TransferResult<()> {
        self.lock().execute(
            "UPDATE transfers SET bytes_transferred = ?3, updated_at = ?4 \
             WHERE attachment_id = ?1 AND direction = ?2",
            params![
                key.attachment_id.to_string(),
                key.direction.as_str(),
                bytes_transferred as i64,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn complete(
        &self,
        key: &TransferKey,
        bytes: u64,
        remote_key: Option<&str>,
        local_path: Option<&Path>,
    ) -> TransferResult<()> {
        self.lock().execute(
            "UPDATE transfers SET state = 'complete', bytes_transferred = ?3, last_error = NULL, \
             remote_key = COALESCE(?4, remote_key), local_path = COALESCE(?5, local_path), \
             updated_at = ?6 WHERE attachment_id = ?1 AND direction = ?2",
            params![
                key.attachment_id.to_string(),
                key.direction.as_str(),
                bytes as i64,
                remote_key,
                local_path.map(|p| p.to_string_lossy().to_string()),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn list(&self) -> TransferResult<Vec<TransferRecord>> {
        self.query(&format!("SELECT {COLUMNS} FROM transfers ORDER BY created_at, attachment_id"), [])
    }

    pub fn list_in_state(&self, state: TransferState) -> TransferResult<Vec<TransferRecord>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM transfers WHERE state = ?1 ORDER BY updated_at"),
            [state.as_str()],
        )
    }

    fn query<P: rusqlite::Params>(&self, sql: &str, params: P) -> TransferResult<Vec<TransferRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, read_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(|r| r.into_record()).collect()
    }

    fn reset_interrupted(&self) -> TransferResult<usize> {
        Ok(self.lock().execute(
            "UPDATE transfers SET state = 'pending' WHERE state = 'transferring'",
            [],
        )?)
    }

    pub fn delete(&self, key: &TransferKey) -> TransferResult<bool> {
        let changed = self.lock().execute(
            "DELETE FROM transfers WHERE attachment_id = ?1 AND direction = ?2",
            params![key.attachment_id.to_string(), key.direction.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Deletes every record.
    pub fn wipe(&self) -> TransferResult<()> {
        self.lock().execute("DELETE FROM transfers", [])?;
        Ok(())
    }
}

type RawRecord = (
    String,
    String,
    i64,
    String,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    i64,
);

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

trait IntoRecord {
    fn into_record(self) -> TransferResult<TransferRecord>;
}

impl IntoRecord for RawRecord {
    fn into_record(self) -> TransferResult<TransferRecord> {
        let (id, direction, file_size, state, bytes, last_error, remote_key, local_path, created, updated) =
            self;
        let attachment_id: EntityId = id
            .parse()
            .map_err(|e| TransferError::Storage(format!("bad attachment id {id}: {e}")))?;
        let direction: Direction = direction.parse().map_err(TransferError::Storage)?;
        let state = TransferState::parse(&state)
            .ok_or_else(|| TransferError::Storage(format!("unknown transfer state {state}")))?;
        Ok(TransferRecord {
            attachment_id,
            direction,
            file_size: file_size.max(0) as u64,
            state,
            bytes_transferred: bytes.max(0) as u64,
            last_error,
            remote_key,
            local_path: local_path.map(PathBuf::from),
            created_at: millis(created),
            updated_at: millis(updated),
        })
    }
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
