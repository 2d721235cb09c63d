//! Row types exchanged with the database.

use chrono::NaiveDateTime;
use serde::Serialize;

use teltrack_protocol::DeviceId;

/// One stored position fix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionRecord {
    pub device_id: DeviceId,
    /// Fix time as reported by the terminal's GPS clock.
    pub recorded_at: NaiveDateTime,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: u8,
    pub course: u16,
    pub satellites: u8,
    pub acc_on: bool,
}

/// One stored heartbeat sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatRecord {
    pub device_id: DeviceId,
    pub battery_level: u8,
    pub signal_strength: u8,
    pub terminal_info: u8,
}

/// Summary row for the device listing API.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRow {
    pub device_id: String,
    pub model_code: u16,
    pub first_seen_at: String,
    pub last_login_at: String,
    pub login_count: u64,
}
