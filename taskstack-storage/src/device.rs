//! Device identity and the registry of devices seen in the event stream.

use crate::error::StorageResult;
use crate::{initialize_schema, lock, millis_to_datetime};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use taskstack_types::DeviceId;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// Stable per-install identity of this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: DeviceId,
    pub display_name: String,
}

impl DeviceIdentity {
    /// Loads the device id stored next to the database (`<db>.device_id`), or
    /// generates and persists a new one. `:memory:` databases always get a
    /// fresh id.
    ///
    /// The file lives outside the database, so wiping local data
    /// keeps the identity (and therefore the device's sequence space).
    pub fn load_or_create(db_path: &Path) -> Self {
        let display_name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "TaskStack Device".to_string());

        if db_path.to_str() == Some(":memory:") {
            return Self {
                id: DeviceId::new(),
                display_name,
            };
        }

        let id_path = db_path.with_extension("device_id");

        if let Ok(contents) = std::fs::read_to_string(&id_path) {
            if let Ok(uuid) = Uuid::parse_str(contents.trim()) {
                info!("loaded existing device id {uuid}");
                return Self {
                    id: DeviceId::from_uuid(uuid),
                    display_name,
                };
            }
            warn!("corrupt device_id file at {}, generating new one", id_path.display());
        }

        let id = DeviceId::new();
        if let Err(e) = std::fs::write(&id_path, id.to_string()) {
            warn!("failed to persist device id to {}: {e}", id_path.display());
        } else {
            info!("generated and saved new device id {id}");
        }
        Self { id, display_name }
    }
}

/// A device known to this install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub display_name: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

/// Devices observed locally or in pulled events, for multi-device
/// diagnostics.
#[derive(Clone)]
pub struct DeviceRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl DeviceRegistry {
    pub fn with_conn(conn: Arc<Mutex<Connection>>) -> StorageResult<Self> {
        initialize_schema(&lock(&conn))?;
        Ok(Self { conn })
    }

    /// Records that a device was seen. `last_seen_at` only moves forward and
    /// a missing display name never erases a known one.
    pub fn touch(
        &self,
        id: DeviceId,
        display_name: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let conn = lock(&self.conn);
        conn.execute(
            r#"
            INSERT INTO devices (id, display_name, last_seen_at_ms) VALUES (?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, devices.display_name),
                last_seen_at_ms = GREATEST(devices.last_seen_at_ms, excluded.last_seen_at_ms)
            "#,
            params![id.to_string(), display_name, seen_at.timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &DeviceId) -> StorageResult<Option<Device>> {
        Ok(self.list()?.into_iter().find(|d| d.id == *id))
    }

    /// All known devices, most recently seen first.
    pub fn list(&self) -> StorageResult<Vec<Device>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, display_name, last_seen_at_ms FROM devices ORDER BY last_seen_at_ms DESC",
        )?;
        let rows = stmt
            .query_map(params![], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut devices = Vec::with_capacity(rows.len());
        for (id, display_name, seen) in rows {
            let Ok(id) = id.parse() else {
                warn!("skipping device row with invalid id {id:?}");
                continue;
            };
            devices.push(Device {
                id,
                display_name,
                last_seen_at: millis_to_datetime(seen)?,
            });
        }
        Ok(devices)
    }
}
