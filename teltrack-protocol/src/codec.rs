//! Codec for decoding frame bodies into typed messages and encoding
//! outbound frames.
//!
//! Body layouts (all multi-byte fields big-endian):
//!
//! ```text
//! Login     (0x01): imei[8 BCD] model[2] timezone_language[2]
//! Heartbeat (0x13): terminal_info[1] battery[1] signal[1] extended[2]
//! Location  (0x12/0x22): datetime[6] satellites[1] lat[4] lon[4]
//!                        speed[1] course_status[2] mcc[2] mnc[1]
//!                        lac[2] cell_id[3] acc[1]
//! ```
//!
//! Coordinates are fixed-point: `degrees = raw / 1_800_000`, signed by
//! the hemisphere flags in the course/status word.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::checksum::crc_itu;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::types::*;

const LOGIN_BODY_LEN: usize = 12;
const HEARTBEAT_BODY_LEN: usize = 5;
const LOCATION_BODY_LEN: usize = 27;

/// Decode a validated frame's body into a typed message.
///
/// Never fails: unrecognized protocol numbers and malformed bodies of
/// recognized ones both degrade to [`Message::Unknown`], preserving the
/// raw body for the logging collaborator.
pub fn decode(frame: &Frame) -> Message {
    let decoded = match frame.protocol {
        PROTO_LOGIN => decode_login(frame.body.clone()).map(Message::Login),
        PROTO_HEARTBEAT => decode_heartbeat(frame.body.clone()).map(Message::Heartbeat),
        PROTO_LOCATION | PROTO_LOCATION_EXT => {
            decode_location(frame.body.clone()).map(Message::Location)
        }
        _ => None,
    };
    decoded.unwrap_or_else(|| Message::Unknown {
        protocol: frame.protocol,
        body: frame.body.clone(),
    })
}

/// Encode a message into a complete frame with the given serial.
pub fn encode(msg: &Message, serial: u16) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();
    match msg {
        Message::Login(login) => {
            body.put_slice(&login.device_id.to_bcd());
            body.put_u16(login.model_code);
            body.put_u16(login.timezone_language);
        }
        Message::Heartbeat(hb) => {
            body.put_u8(hb.terminal_info);
            body.put_u8(hb.battery_level);
            body.put_u8(hb.signal_strength);
            body.put_u16(hb.extended_status);
        }
        Message::Location(loc) => {
            encode_location(&mut body, loc);
        }
        Message::Unknown { body: raw, .. } => {
            body.put_slice(raw);
        }
    }
    encode_frame(msg.protocol_number(), &body, serial)
}

/// Build an acknowledgement frame: empty body, same protocol number,
/// the inbound message's serial echoed back, fresh checksum.
pub fn encode_ack(protocol: u8, serial: u16) -> Bytes {
    // An empty body always fits, so this cannot fail.
    encode_frame(protocol, &[], serial).expect("empty ack body")
}

/// Assemble a frame around `body`, computing length and checksum.
pub fn encode_frame(protocol: u8, body: &[u8], serial: u16) -> Result<Bytes, ProtocolError> {
    if body.len() > MAX_BODY_LEN {
        return Err(ProtocolError::BodyTooLarge(body.len()));
    }
    let length = MIN_LENGTH + body.len() as u8;

    let mut out = BytesMut::with_capacity(body.len() + 10);
    out.put_slice(&START_MARKER);
    out.put_u8(length);
    out.put_u8(protocol);
    out.put_slice(body);
    out.put_u16(serial);
    // Checksum spans from the length byte through the serial.
    let crc = crc_itu(&out[2..]);
    out.put_u16(crc);
    out.put_slice(&STOP_MARKER);
    Ok(out.freeze())
}

fn decode_login(mut body: Bytes) -> Option<Login> {
    if body.remaining() < LOGIN_BODY_LEN {
        return None;
    }
    let mut bcd = [0u8; 8];
    body.copy_to_slice(&mut bcd);
    let device_id = DeviceId::from_bcd(&bcd).ok()?;
    let model_code = body.get_u16();
    let timezone_language = body.get_u16();
    Some(Login {
        device_id,
        model_code,
        timezone_language,
    })
}

fn decode_heartbeat(mut body: Bytes) -> Option<Heartbeat> {
    if body.remaining() < HEARTBEAT_BODY_LEN {
        return None;
    }
    Some(Heartbeat {
        terminal_info: body.get_u8(),
        battery_level: body.get_u8(),
        signal_strength: body.get_u8(),
        extended_status: body.get_u16(),
    })
}

fn decode_location(mut body: Bytes) -> Option<Location> {
    if body.remaining() < LOCATION_BODY_LEN {
        return None;
    }
    let timestamp = decode_datetime(&mut body)?;
    let satellites = body.get_u8();
    let lat_raw = body.get_u32();
    let lon_raw = body.get_u32();
    let speed_kmh = body.get_u8();
    let course_status = body.get_u16();
    let mcc = body.get_u16();
    let mnc = body.get_u8();
    let lac = body.get_u16();
    let cell_id = get_u24(&mut body);
    let acc_on = body.get_u8() != 0;

    let mut latitude = f64::from(lat_raw) / DEGREE_SCALE;
    if course_status & STATUS_LAT_NORTH == 0 {
        latitude = -latitude;
    }
    let mut longitude = f64::from(lon_raw) / DEGREE_SCALE;
    if course_status & STATUS_LON_WEST != 0 {
        longitude = -longitude;
    }

    Some(Location {
        timestamp,
        satellites,
        latitude,
        longitude,
        speed_kmh,
        course_status,
        mcc,
        mnc,
        lac,
        cell_id,
        acc_on,
    })
}

fn encode_location(body: &mut BytesMut, loc: &Location) {
    encode_datetime(body, &loc.timestamp);
    body.put_u8(loc.satellites);
    body.put_u32((loc.latitude.abs() * DEGREE_SCALE).round() as u32);
    body.put_u32((loc.longitude.abs() * DEGREE_SCALE).round() as u32);
    body.put_u8(loc.speed_kmh);
    // Force the hemisphere flags to agree with the coordinate signs.
    let mut status = loc.course_status & !(STATUS_LAT_NORTH | STATUS_LON_WEST);
    if loc.latitude >= 0.0 {
        status |= STATUS_LAT_NORTH;
    }
    if loc.longitude < 0.0 {
        status |= STATUS_LON_WEST;
    }
    body.put_u16(status);
    body.put_u16(loc.mcc);
    body.put_u8(loc.mnc);
    body.put_u16(loc.lac);
    put_u24(body, loc.cell_id);
    body.put_u8(u8::from(loc.acc_on));
}

/// Six wire bytes: YY MM DD HH MM SS, year 2000-based.
fn decode_datetime(body: &mut Bytes) -> Option<NaiveDateTime> {
    let (yy, mo, dd) = (body.get_u8(), body.get_u8(), body.get_u8());
    let (hh, mi, ss) = (body.get_u8(), body.get_u8(), body.get_u8());
    NaiveDate::from_ymd_opt(2000 + i32::from(yy), u32::from(mo), u32::from(dd))?
        .and_hms_opt(u32::from(hh), u32::from(mi), u32::from(ss))
}

fn encode_datetime(body: &mut BytesMut, ts: &NaiveDateTime) {
    body.put_u8((ts.year() - 2000).clamp(0, 255) as u8);
    body.put_u8(ts.month() as u8);
    body.put_u8(ts.day() as u8);
    body.put_u8(ts.hour() as u8);
    body.put_u8(ts.minute() as u8);
    body.put_u8(ts.second() as u8);
}

fn get_u24(body: &mut Bytes) -> u32 {
    let hi = u32::from(body.get_u8());
    let lo = u32::from(body.get_u16());
    (hi << 16) | lo
}

fn put_u24(body: &mut BytesMut, value: u32) {
    body.put_u8((value >> 16) as u8);
    body.put_u16(value as u16);
}
