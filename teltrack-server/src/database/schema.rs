//! SQLite schema definition.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    device_id       TEXT PRIMARY KEY,
    model_code      INTEGER NOT NULL DEFAULT 0,
    timezone_language INTEGER NOT NULL DEFAULT 0,
    first_seen_at   TEXT NOT NULL,
    last_login_at   TEXT NOT NULL,
    login_count     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS positions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    latitude    REAL NOT NULL,
    longitude   REAL NOT NULL,
    speed_kmh   INTEGER NOT NULL,
    course      INTEGER NOT NULL,
    satellites  INTEGER NOT NULL DEFAULT 0,
    acc_on      INTEGER NOT NULL DEFAULT 0,
    received_at TEXT NOT NULL,
    FOREIGN KEY (device_id) REFERENCES devices(device_id)
);

CREATE INDEX IF NOT EXISTS idx_positions_device_time
    ON positions(device_id, recorded_at);

CREATE TABLE IF NOT EXISTS heartbeats (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id       TEXT NOT NULL,
    battery_level   INTEGER NOT NULL,
    signal_strength INTEGER NOT NULL,
    terminal_info   INTEGER NOT NULL,
    received_at     TEXT NOT NULL,
    FOREIGN KEY (device_id) REFERENCES devices(device_id)
);
"#;
