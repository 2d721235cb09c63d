//! Database module for device and position storage.
//!
//! SQLite-based persistent storage for:
//! - Device registration (identifier, model, login history)
//! - Position fixes reported over TCP or the ingestion API
//! - Heartbeat status samples

mod models;
mod schema;

pub use models::*;

use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use teltrack_protocol::{DeviceId, Login};

/// Database error types.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Database handle type shared across tasks.
pub type DatabaseHandle = Arc<tokio::sync::Mutex<Database>>;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Main database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self { conn };
        db.initialize_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self { conn };
        db.initialize_schema()?;

        Ok(db)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(())
    }

    /// Register a login: insert the device on first sight, otherwise
    /// refresh its model and login timestamp.
    pub fn record_login(&self, login: &Login) -> Result<()> {
        let now = Utc::now().naive_utc().format(TIME_FORMAT).to_string();
        self.conn.execute(
            "INSERT INTO devices (device_id, model_code, timezone_language,
                                  first_seen_at, last_login_at, login_count)
             VALUES (?1, ?2, ?3, ?4, ?4, 1)
             ON CONFLICT(device_id) DO UPDATE SET
                 model_code = ?2,
                 timezone_language = ?3,
                 last_login_at = ?4,
                 login_count = login_count + 1",
            params![
                login.device_id.to_string(),
                login.model_code,
                login.timezone_language,
                now,
            ],
        )?;
        Ok(())
    }

    /// Register a device without a login, keeping `login_count` at zero.
    /// Covers reports that arrive before any login row exists: ingestion
    /// from external gateways, and a terminal's first position racing its
    /// own login write.
    fn ensure_device(&self, device_id: DeviceId, now: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO devices (device_id, model_code, timezone_language,
                                            first_seen_at, last_login_at, login_count)
             VALUES (?1, 0, 0, ?2, ?2, 0)",
            params![device_id.to_string(), now],
        )?;
        Ok(())
    }

    /// Insert a position fix, registering the device if it is unknown.
    pub fn insert_position(&self, record: &PositionRecord) -> Result<i64> {
        let now = Utc::now().naive_utc().format(TIME_FORMAT).to_string();
        self.ensure_device(record.device_id, &now)?;
        self.conn.execute(
            "INSERT INTO positions (device_id, recorded_at, latitude, longitude,
                                    speed_kmh, course, satellites, acc_on, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.device_id.to_string(),
                record.recorded_at.format(TIME_FORMAT).to_string(),
                record.latitude,
                record.longitude,
                record.speed_kmh,
                record.course,
                record.satellites,
                record.acc_on,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert a heartbeat status sample, registering the device if it is
    /// unknown.
    pub fn insert_heartbeat(&self, record: &HeartbeatRecord) -> Result<i64> {
        let now = Utc::now().naive_utc().format(TIME_FORMAT).to_string();
        self.ensure_device(record.device_id, &now)?;
        self.conn.execute(
            "INSERT INTO heartbeats (device_id, battery_level, signal_strength,
                                     terminal_info, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.device_id.to_string(),
                record.battery_level,
                record.signal_strength,
                record.terminal_info,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// List all registered devices, most recently seen first.
    pub fn list_devices(&self) -> Result<Vec<DeviceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, model_code, first_seen_at, last_login_at, login_count
             FROM devices ORDER BY last_login_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DeviceRow {
                    device_id: row.get(0)?,
                    model_code: row.get(1)?,
                    first_seen_at: row.get(2)?,
                    last_login_at: row.get(3)?,
                    login_count: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Latest stored position for a device, if any.
    pub fn latest_position(&self, device_id: DeviceId) -> Result<Option<PositionRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT recorded_at, latitude, longitude, speed_kmh, course, satellites, acc_on
                 FROM positions WHERE device_id = ?1
                 ORDER BY recorded_at DESC LIMIT 1",
                params![device_id.to_string()],
                |row| {
                    let recorded_at: String = row.get(0)?;
                    Ok((
                        recorded_at,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, u8>(3)?,
                        row.get::<_, u16>(4)?,
                        row.get::<_, u8>(5)?,
                        row.get::<_, bool>(6)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.and_then(
            |(recorded_at, latitude, longitude, speed_kmh, course, satellites, acc_on)| {
                let recorded_at =
                    NaiveDateTime::parse_from_str(&recorded_at, TIME_FORMAT).ok()?;
                Some(PositionRecord {
                    device_id,
                    recorded_at,
                    latitude,
                    longitude,
                    speed_kmh,
                    course,
                    satellites,
                    acc_on,
                })
            },
        ))
    }

    /// Number of stored positions for a device.
    pub fn position_count(&self, device_id: DeviceId) -> Result<u64> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE device_id = ?1",
            params![device_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
