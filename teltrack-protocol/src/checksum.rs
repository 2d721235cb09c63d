//! CRC-ITU checksum used by the terminal framing protocol.

/// Compute the CRC-ITU (X.25) checksum of `data`.
///
/// Initial value all-ones, reflected polynomial 0x8408, result
/// complemented. The wire carries the result MSB first, covering the
/// span from the length byte through the serial.
pub fn crc_itu(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x8408
            } else {
                crc >> 1
            };
        }
    }
    !crc
}
