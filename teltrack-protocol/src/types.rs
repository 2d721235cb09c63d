//! Message type definitions for the terminal wire protocol.

use std::fmt;

use bytes::Bytes;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Two-byte marker opening every frame.
pub const START_MARKER: [u8; 2] = [0x78, 0x78];

/// Two-byte marker closing every frame.
pub const STOP_MARKER: [u8; 2] = [0x0D, 0x0A];

/// Login message from the terminal (first message on a connection).
pub const PROTO_LOGIN: u8 = 0x01;

/// Location report (older body layout shares the extended one below).
pub const PROTO_LOCATION: u8 = 0x12;

/// Periodic heartbeat / status message.
pub const PROTO_HEARTBEAT: u8 = 0x13;

/// Location report, extended protocol number used by newer firmware.
pub const PROTO_LOCATION_EXT: u8 = 0x22;

/// Smallest legal value of the length field: protocol number + serial + checksum.
pub const MIN_LENGTH: u8 = 5;

/// Largest body the one-byte length field can describe.
pub const MAX_BODY_LEN: usize = u8::MAX as usize - MIN_LENGTH as usize;

/// Garbage bytes tolerated while hunting for a start marker before the
/// assembler resets its buffer. Bounds memory under a non-conforming peer.
pub const RESYNC_WINDOW: usize = 4096;

/// Course/status bit: set when the latitude is in the northern hemisphere.
pub const STATUS_LAT_NORTH: u16 = 0x0400;

/// Course/status bit: set when the longitude is in the western hemisphere.
pub const STATUS_LON_WEST: u16 = 0x0800;

/// Fixed-point scale between raw wire coordinates and decimal degrees.
pub const DEGREE_SCALE: f64 = 1_800_000.0;

/// A terminal's 15-digit hardware identifier (IMEI).
///
/// Carried on the wire as 8 packed-BCD bytes with a leading zero nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Validate a numeric identifier: nonzero, at most 15 decimal digits.
    pub fn new(value: u64) -> Result<Self, ProtocolError> {
        if value == 0 || value > 999_999_999_999_999 {
            return Err(ProtocolError::InvalidIdentifier(value.to_string()));
        }
        Ok(Self(value))
    }

    /// Decode the packed-BCD wire form. Every nibble must be a decimal digit.
    pub fn from_bcd(bytes: &[u8; 8]) -> Result<Self, ProtocolError> {
        let mut value: u64 = 0;
        for &byte in bytes {
            let hi = byte >> 4;
            let lo = byte & 0x0F;
            if hi > 9 || lo > 9 {
                return Err(ProtocolError::InvalidIdentifier(format!(
                    "non-decimal nibble in {:02X?}",
                    bytes
                )));
            }
            value = value * 100 + u64::from(hi) * 10 + u64::from(lo);
        }
        Self::new(value)
    }

    /// Encode as 8 packed-BCD bytes, MSB first, leading zero nibble.
    pub fn to_bcd(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        let mut value = self.0;
        for slot in out.iter_mut().rev() {
            let lo = (value % 10) as u8;
            value /= 10;
            let hi = (value % 10) as u8;
            value /= 10;
            *slot = (hi << 4) | lo;
        }
        out
    }

    /// The identifier as a plain integer.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:015}", self.0)
    }
}

/// Login message body: identifier plus terminal model and locale info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub device_id: DeviceId,
    pub model_code: u16,
    pub timezone_language: u16,
}

/// Heartbeat message body: terminal status flags and radio levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub terminal_info: u8,
    /// 0 (empty) through 6 (full).
    pub battery_level: u8,
    /// 0 (none) through 4 (strong).
    pub signal_strength: u8,
    pub extended_status: u16,
}

/// Location report body: GPS fix plus the serving cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub timestamp: NaiveDateTime,
    pub satellites: u8,
    /// Signed decimal degrees, northern hemisphere positive.
    pub latitude: f64,
    /// Signed decimal degrees, eastern hemisphere positive.
    pub longitude: f64,
    pub speed_kmh: u8,
    /// Raw course/status word; hemisphere flags live in bits 10 and 11,
    /// the course itself in the low 10 bits.
    pub course_status: u16,
    pub mcc: u16,
    pub mnc: u8,
    pub lac: u16,
    pub cell_id: u32,
    pub acc_on: bool,
}

impl Location {
    /// Course over ground in degrees (0..=360).
    pub fn course(&self) -> u16 {
        self.course_status & 0x03FF
    }
}

/// A decoded inbound message.
///
/// Unrecognized protocol numbers decode to [`Message::Unknown`] rather
/// than an error: they are valid traffic from future firmware and must
/// never break framing.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Login(Login),
    Heartbeat(Heartbeat),
    Location(Location),
    Unknown { protocol: u8, body: Bytes },
}

impl Message {
    /// The protocol number this message encodes with.
    pub fn protocol_number(&self) -> u8 {
        match self {
            Message::Login(_) => PROTO_LOGIN,
            Message::Heartbeat(_) => PROTO_HEARTBEAT,
            Message::Location(_) => PROTO_LOCATION_EXT,
            Message::Unknown { protocol, .. } => *protocol,
        }
    }

    /// Short human-readable tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Login(_) => "login",
            Message::Heartbeat(_) => "heartbeat",
            Message::Location(_) => "location",
            Message::Unknown { .. } => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_bcd_roundtrip() {
        let id = DeviceId::new(867_440_069_849_404).unwrap();
        let bcd = id.to_bcd();
        assert_eq!(bcd, [0x08, 0x67, 0x44, 0x00, 0x69, 0x84, 0x94, 0x04]);
        assert_eq!(DeviceId::from_bcd(&bcd).unwrap(), id);
        assert_eq!(id.to_string(), "867440069849404");
    }

    #[test]
    fn test_device_id_rejects_hex_nibbles() {
        let bad = [0x08, 0x67, 0x4A, 0x00, 0x69, 0x84, 0x94, 0x04];
        assert!(DeviceId::from_bcd(&bad).is_err());
    }

    #[test]
    fn test_device_id_rejects_ascii_encoding() {
        // The first 8 bytes of an ASCII-encoded identifier happen to be
        // valid BCD nibbles but decode to 16 digits, over the bound.
        let ascii: [u8; 8] = *b"86744006";
        assert!(DeviceId::from_bcd(&ascii).is_err());
    }

    #[test]
    fn test_device_id_bounds() {
        assert!(DeviceId::new(0).is_err());
        assert!(DeviceId::new(1_000_000_000_000_000).is_err());
        assert!(DeviceId::new(999_999_999_999_999).is_ok());
    }

    #[test]
    fn test_short_identifier_zero_padded() {
        let id = DeviceId::new(12345).unwrap();
        assert_eq!(id.to_string(), "000000000012345");
        assert_eq!(DeviceId::from_bcd(&id.to_bcd()).unwrap(), id);
    }

    #[test]
    fn test_course_masks_status_bits() {
        let loc_status = 0x154C;
        assert_eq!(loc_status & 0x03FF, 332);
        assert_ne!(loc_status & STATUS_LAT_NORTH, 0);
        assert_eq!(loc_status & STATUS_LON_WEST, 0);
    }
}
