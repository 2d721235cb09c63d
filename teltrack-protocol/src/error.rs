//! Error types for the terminal wire protocol.

use thiserror::Error;

/// Errors surfaced by the frame assembler.
///
/// All of these are recoverable: the assembler drops the offending bytes,
/// resynchronizes on the next start marker, and keeps producing frames.
/// None of them should tear down the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The bytes at the expected frame end were not the stop marker.
    #[error("framing desync: stop marker 0x0D0A missing at frame boundary")]
    FramingDesync,

    /// The checksum carried by the frame does not match a recomputation.
    #[error("checksum mismatch: frame carries {found:#06X}, computed {computed:#06X}")]
    ChecksumMismatch { found: u16, computed: u16 },

    /// The declared length cannot hold protocol number, serial and checksum.
    #[error("malformed length field: {0} (minimum is 5)")]
    MalformedLength(u8),

    /// More garbage arrived without a start marker than the resync window
    /// allows; the pending buffer was reset.
    #[error("resync window exceeded: {0} bytes discarded without a start marker")]
    ResyncOverflow(usize),
}

/// Errors from message encoding and identifier validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message body does not fit the one-byte length field.
    #[error("message body too large: {0} bytes")]
    BodyTooLarge(usize),

    /// The device identifier is not a packed 15-digit decimal value.
    #[error("invalid device identifier: {0}")]
    InvalidIdentifier(String),
}
