//! In-memory registry of known devices and their live connections.
//!
//! The registry tracks which session currently speaks for each device.
//! A device that reconnects (new SIM, modem reboot, NAT rebind) takes
//! over its identity: the old binding is superseded, and the stale
//! session can no longer release or update it.

use std::collections::HashMap;
use std::time::Instant;

use log::info;
use tokio::sync::Mutex;

use teltrack_protocol::DeviceId;

use crate::database::PositionRecord;

/// Live state for one known device.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    /// Session currently bound to this device, if connected.
    pub session_id: Option<u64>,
    pub last_seen: Instant,
    /// Most recent accepted position, for quick lookup without the database.
    pub last_position: Option<PositionRecord>,
}

/// Shared device registry.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceId, DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a device to a session, registering the device on first sight.
    ///
    /// Returns the id of the session this binding supersedes, if the
    /// device was already bound elsewhere.
    pub async fn bind(&self, device_id: DeviceId, session_id: u64, now: Instant) -> Option<u64> {
        let mut devices = self.devices.lock().await;
        let entry = devices.entry(device_id).or_insert_with(|| DeviceEntry {
            session_id: None,
            last_seen: now,
            last_position: None,
        });
        let superseded = entry.session_id.filter(|&old| old != session_id);
        if let Some(old) = superseded {
            info!(
                "Device {} rebinding from session {} to session {}",
                device_id, old, session_id
            );
        }
        entry.session_id = Some(session_id);
        entry.last_seen = now;
        superseded
    }

    /// Look up a device's live entry.
    pub async fn lookup(&self, device_id: DeviceId) -> Option<DeviceEntry> {
        self.devices.lock().await.get(&device_id).cloned()
    }

    /// Refresh a device's last-seen time if the session still owns it.
    pub async fn touch(&self, device_id: DeviceId, session_id: u64, now: Instant) {
        let mut devices = self.devices.lock().await;
        if let Some(entry) = devices.get_mut(&device_id) {
            if entry.session_id == Some(session_id) {
                entry.last_seen = now;
            }
        }
    }

    /// Record an accepted position against the device.
    pub async fn record_position(
        &self,
        device_id: DeviceId,
        session_id: u64,
        record: PositionRecord,
        now: Instant,
    ) {
        let mut devices = self.devices.lock().await;
        if let Some(entry) = devices.get_mut(&device_id) {
            if entry.session_id == Some(session_id) {
                entry.last_seen = now;
                entry.last_position = Some(record);
            }
        }
    }

    /// Release a session's binding. A binding superseded by a newer
    /// session is left untouched; the device stays reachable.
    pub async fn release(&self, device_id: DeviceId, session_id: u64) {
        let mut devices = self.devices.lock().await;
        if let Some(entry) = devices.get_mut(&device_id) {
            if entry.session_id == Some(session_id) {
                entry.session_id = None;
            }
        }
    }

    /// Number of devices currently bound to a live session.
    pub async fn connected_count(&self) -> usize {
        self.devices
            .lock()
            .await
            .values()
            .filter(|e| e.session_id.is_some())
            .count()
    }

    /// Total devices seen since startup.
    pub async fn known_count(&self) -> usize {
        self.devices.lock().await.len()
    }
}
