//! Incremental frame reassembly over an arbitrarily chunked byte stream.
//!
//! TCP gives no message boundaries: a read may carry half a frame, three
//! frames, or garbage from a confused modem. [`FrameAssembler`] buffers
//! whatever arrives and yields every complete, checksum-valid frame, in
//! order, regardless of how the bytes were split across reads.

use bytes::{Buf, Bytes, BytesMut};

use crate::checksum::crc_itu;
use crate::error::FrameError;
use crate::types::{MIN_LENGTH, RESYNC_WINDOW, START_MARKER, STOP_MARKER};

/// One validated frame, with markers, length and checksum stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub protocol: u8,
    pub body: Bytes,
    pub serial: u16,
}

/// Reassembles frames from a byte stream, one instance per connection.
///
/// Garbage between frames is skipped while hunting for the next start
/// marker; the amount skipped is bounded by [`RESYNC_WINDOW`], after
/// which the pending buffer is dropped wholesale.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: BytesMut,
    skipped: usize,
}

/// What one assembler step produced.
enum Step {
    /// Not enough buffered bytes to decide anything yet.
    NeedMore,
    Frame(Frame),
    Error(FrameError),
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and iterate over everything now extractable.
    ///
    /// The iterator yields `Ok` for each valid frame and `Err` for each
    /// recoverable framing fault encountered along the way. Dropping it
    /// early loses nothing: unconsumed bytes stay buffered for the next
    /// call.
    pub fn feed<'a>(&'a mut self, chunk: &[u8]) -> Frames<'a> {
        self.buf.extend_from_slice(chunk);
        Frames { assembler: self }
    }

    /// Bytes buffered but not yet formed into a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn advance(&mut self) -> Step {
        if !self.seek_start_marker() {
            if self.skipped > RESYNC_WINDOW {
                let discarded = self.skipped;
                self.buf.clear();
                self.skipped = 0;
                return Step::Error(FrameError::ResyncOverflow(discarded));
            }
            return Step::NeedMore;
        }
        self.skipped = 0;

        if self.buf.len() < 3 {
            return Step::NeedMore;
        }
        let length = self.buf[2];
        if length < MIN_LENGTH {
            // Skip the marker and rescan; the real frame may start
            // inside what looked like one.
            self.buf.advance(2);
            return Step::Error(FrameError::MalformedLength(length));
        }
        // start(2) + length(1) + declared length + stop(2)
        let total = length as usize + 5;
        if self.buf.len() < total {
            return Step::NeedMore;
        }

        if self.buf[total - 2..total] != STOP_MARKER {
            self.buf.advance(1);
            return Step::Error(FrameError::FramingDesync);
        }

        let computed = crc_itu(&self.buf[2..total - 4]);
        let found = u16::from_be_bytes([self.buf[total - 4], self.buf[total - 3]]);
        if found != computed {
            self.buf.advance(total);
            return Step::Error(FrameError::ChecksumMismatch { found, computed });
        }

        let raw = self.buf.split_to(total).freeze();
        let body_len = length as usize - MIN_LENGTH as usize;
        Step::Frame(Frame {
            protocol: raw[3],
            body: raw.slice(4..4 + body_len),
            serial: u16::from_be_bytes([raw[total - 6], raw[total - 5]]),
        })
    }

    /// Discard bytes until the buffer starts with the start marker.
    /// Returns false if no marker is in the buffer yet; a trailing lone
    /// 0x78 is kept in case its partner arrives in the next chunk.
    fn seek_start_marker(&mut self) -> bool {
        while self.buf.len() >= 2 {
            if self.buf[..2] == START_MARKER {
                return true;
            }
            self.buf.advance(1);
            self.skipped += 1;
        }
        if self.buf.len() == 1 && self.buf[0] != START_MARKER[0] {
            self.buf.advance(1);
            self.skipped += 1;
        }
        false
    }
}

/// Draining iterator over the frames and faults in an assembler's buffer.
pub struct Frames<'a> {
    assembler: &'a mut FrameAssembler,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.assembler.advance() {
            Step::NeedMore => None,
            Step::Frame(frame) => Some(Ok(frame)),
            Step::Error(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN: &str = "787811010867440069849404012300010001233f0d0a";
    const HEARTBEAT: &str = "78780a134004030001000237d70d0a";
    const LOGIN_ACK: &str = "787805010001d9dc0d0a";

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn drain(assembler: &mut FrameAssembler, chunk: &[u8]) -> Vec<Result<Frame, FrameError>> {
        assembler.feed(chunk).collect()
    }

    #[test]
    fn test_single_frame() {
        let mut asm = FrameAssembler::new();
        let out = drain(&mut asm, &hex(LOGIN_ACK));
        assert_eq!(out.len(), 1);
        let frame = out[0].as_ref().unwrap();
        assert_eq!(frame.protocol, 0x01);
        assert_eq!(frame.serial, 1);
        assert!(frame.body.is_empty());
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut bytes = hex(LOGIN);
        bytes.extend(hex(HEARTBEAT));
        let mut asm = FrameAssembler::new();
        let out = drain(&mut asm, &bytes);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().protocol, 0x01);
        assert_eq!(out[1].as_ref().unwrap().protocol, 0x13);
        assert_eq!(out[1].as_ref().unwrap().serial, 2);
    }

    #[test]
    fn test_chunking_invariance() {
        // The same frame sequence must come out whatever the chunk sizes.
        let mut bytes = hex(LOGIN);
        bytes.extend(hex(HEARTBEAT));
        bytes.extend(hex(LOGIN_ACK));
        for chunk_size in 1..=bytes.len() {
            let mut asm = FrameAssembler::new();
            let mut out = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                out.extend(drain(&mut asm, chunk));
            }
            let protocols: Vec<u8> = out
                .iter()
                .map(|r| r.as_ref().unwrap().protocol)
                .collect();
            assert_eq!(protocols, vec![0x01, 0x13, 0x01], "chunk size {chunk_size}");
            assert_eq!(asm.pending(), 0);
        }
    }

    #[test]
    fn test_garbage_before_frame_skipped_silently() {
        let mut bytes = vec![0x00, 0xFF, 0x78, 0x12];
        bytes.extend(hex(HEARTBEAT));
        let mut asm = FrameAssembler::new();
        let out = drain(&mut asm, &bytes);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().protocol, 0x13);
    }

    #[test]
    fn test_trailing_lone_start_byte_kept() {
        let mut asm = FrameAssembler::new();
        let heartbeat = hex(HEARTBEAT);
        let mut first = vec![0xAA, 0xBB];
        first.push(0x78);
        assert!(drain(&mut asm, &first).is_empty());
        // The lone 0x78 must pair with the next chunk's leading 0x78.
        let out = drain(&mut asm, &heartbeat[1..]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().protocol, 0x13);
    }

    #[test]
    fn test_checksum_mismatch_drops_frame_only() {
        let mut corrupted = hex(LOGIN);
        corrupted[10] ^= 0xFF;
        corrupted.extend(hex(HEARTBEAT));
        let mut asm = FrameAssembler::new();
        let out = drain(&mut asm, &corrupted);
        assert_eq!(out.len(), 2);
        assert!(matches!(
            out[0],
            Err(FrameError::ChecksumMismatch { .. })
        ));
        assert_eq!(out[1].as_ref().unwrap().protocol, 0x13);
    }

    #[test]
    fn test_missing_stop_marker_resyncs() {
        let mut desynced = hex(LOGIN);
        let n = desynced.len();
        desynced[n - 2] = 0x00;
        desynced.extend(hex(HEARTBEAT));
        let mut asm = FrameAssembler::new();
        let out = drain(&mut asm, &desynced);
        // One or more desync faults while sliding, then the good frame.
        let frames: Vec<&Frame> = out.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].protocol, 0x13);
        assert!(out.iter().any(|r| matches!(r, Err(FrameError::FramingDesync))));
    }

    #[test]
    fn test_malformed_length_reported_and_recovered() {
        let mut bytes = vec![0x78, 0x78, 0x02, 0x01];
        bytes.extend(hex(HEARTBEAT));
        let mut asm = FrameAssembler::new();
        let out = drain(&mut asm, &bytes);
        assert!(matches!(out[0], Err(FrameError::MalformedLength(2))));
        let frames: Vec<&Frame> = out.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].protocol, 0x13);
    }

    #[test]
    fn test_resync_window_bounds_buffer() {
        let mut asm = FrameAssembler::new();
        let garbage = vec![0x55u8; RESYNC_WINDOW + 100];
        let out = drain(&mut asm, &garbage);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(FrameError::ResyncOverflow(_))));
        assert_eq!(asm.pending(), 0);
        // The assembler still works after the reset.
        let out = drain(&mut asm, &hex(HEARTBEAT));
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ok());
    }

    #[test]
    fn test_partial_frame_waits() {
        let bytes = hex(LOGIN);
        let mut asm = FrameAssembler::new();
        assert!(drain(&mut asm, &bytes[..7]).is_empty());
        assert_eq!(asm.pending(), 7);
        let out = drain(&mut asm, &bytes[7..]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().serial, 1);
    }

    #[test]
    fn test_body_and_serial_extraction() {
        let mut asm = FrameAssembler::new();
        let out = drain(&mut asm, &hex(LOGIN));
        let frame = out[0].as_ref().unwrap();
        assert_eq!(frame.body.len(), 12);
        assert_eq!(&frame.body[..2], &[0x08, 0x67]);
        assert_eq!(frame.serial, 1);
    }
}
