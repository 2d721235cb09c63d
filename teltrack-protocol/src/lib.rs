//! Wire protocol for GPS/GSM tracking terminals.
//!
//! This crate defines the binary framing protocol spoken by tracking
//! terminals over a persistent TCP connection, the checksum that guards
//! it, and the typed messages carried inside each frame.
//!
//! # Frame Format
//!
//! ```text
//! +-------+--------+----------+----------+--------+----------+------+
//! | Start | Length | Protocol |   Body   | Serial | Checksum | Stop |
//! | 7878  |  u8    |   u8     | variable | u16 BE |  u16 BE  | 0D0A |
//! +-------+--------+----------+----------+--------+----------+------+
//! ```
//!
//! `Length` counts the bytes from the protocol number through the
//! checksum inclusive (`1 + body + 2 + 2`). The checksum is CRC-ITU over
//! the span from the length byte through the serial, and acknowledgement
//! frames echo the inbound serial with an empty body.
//!
//! # Example
//!
//! ```rust
//! use teltrack_protocol::{codec, FrameAssembler, Message, PROTO_LOGIN};
//!
//! // The acknowledgement a server sends for a login with serial 1.
//! let ack = codec::encode_ack(PROTO_LOGIN, 1);
//! assert_eq!(&ack[..], &[0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xD9, 0xDC, 0x0D, 0x0A]);
//!
//! // Reassemble it from an arbitrarily chunked stream and decode.
//! let mut assembler = FrameAssembler::new();
//! let frames: Vec<_> = assembler.feed(&ack).collect();
//! let frame = frames[0].as_ref().unwrap();
//! assert!(matches!(codec::decode(frame), Message::Unknown { .. } | Message::Login(_)));
//! ```

pub mod checksum;
pub mod codec;
pub mod error;
pub mod frame;
pub mod types;

pub use checksum::crc_itu;
pub use codec::{decode, encode, encode_ack};
pub use error::{FrameError, ProtocolError};
pub use frame::{Frame, FrameAssembler, Frames};
pub use types::{
    DeviceId, Heartbeat, Location, Login, Message, MAX_BODY_LEN, MIN_LENGTH, PROTO_HEARTBEAT,
    PROTO_LOCATION, PROTO_LOCATION_EXT, PROTO_LOGIN, RESYNC_WINDOW, START_MARKER, STOP_MARKER,
};
