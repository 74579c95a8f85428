//! DL/T 645-2007 request builders and response parsers, on top of the frame
//! layer. Everything between the second start delimiter's control byte and
//! the checksum travels with the +0x33 offset applied.

use chrono::{DateTime, Datelike, Timelike, Utc};
use thiserror::Error;

use crate::bcd::{self, BcdError};
use crate::dlt645::frame::{append_checksum, Frame, FRAME_START};
use crate::dlt645::registers::RegisterSpec;
use crate::telemetry::ReadingValue;

/// Request control codes.
pub mod control {
    pub const BROADCAST_TIME: u8 = 0x08;
    pub const READ: u8 = 0x11;
    pub const READ_ADDRESS: u8 = 0x13;
    pub const WRITE: u8 = 0x14;
    pub const RELAY: u8 = 0x1c;
}

/// All meters answer this address.
pub const BROADCAST_ADDRESS: &str = "999999999999";
/// Address-discovery broadcast used by `read_address`.
pub const READ_ADDRESS_BROADCAST: &str = "AAAAAAAAAAAA";

/// Response control code for a request: the meter sets bit 7.
pub fn response_code(request: u8) -> u8 {
    request | 0x80
}

/// Error-response control code: bits 7 and 6.
pub fn error_response_code(request: u8) -> u8 {
    request | 0xc0
}

/// Recover the request code from any response code.
pub fn request_code(code: u8) -> u8 {
    code & 0x3f
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error(transparent)]
    Bcd(#[from] BcdError),
    #[error("response payload too short ({0} bytes)")]
    ShortPayload(usize),
    #[error("frame is not an error response (control {0:#04x})")]
    NotAnError(u8),
}

fn build(address: &str, control: u8, plain_payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut frame = vec![FRAME_START];
    frame.extend(bcd::address_to_buffer(address)?);
    frame.push(FRAME_START);
    frame.push(control);
    frame.push(plain_payload.len() as u8);
    frame.extend(bcd::apply_offset(plain_payload));
    append_checksum(&mut frame);
    Ok(frame)
}

/// Read one register: the payload is the data identifier as four
/// little-endian bytes.
pub fn build_read_frame(address: &str, data_id: u32) -> Result<Vec<u8>, CodecError> {
    build(address, control::READ, &data_id.to_le_bytes())
}

/// Write a register: data identifier followed by the new value bytes.
pub fn build_write_frame(address: &str, data_id: u32, value: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut payload = data_id.to_le_bytes().to_vec();
    payload.extend_from_slice(value);
    build(address, control::WRITE, &payload)
}

/// Broadcast address discovery: empty payload to `AAAAAAAAAAAA`.
pub fn build_read_address_frame() -> Vec<u8> {
    build(READ_ADDRESS_BROADCAST, control::READ_ADDRESS, &[])
        .expect("broadcast address is well-formed")
}

/// Broadcast time sync (control 0x08): seconds-first BCD timestamp.
pub fn build_broadcast_time_frame(now: DateTime<Utc>) -> Vec<u8> {
    let payload = [
        to_bcd_byte(now.second() as u8),
        to_bcd_byte(now.minute() as u8),
        to_bcd_byte(now.hour() as u8),
        to_bcd_byte(now.day() as u8),
        to_bcd_byte(now.month() as u8),
        to_bcd_byte((now.year() % 100) as u8),
    ];
    build(BROADCAST_ADDRESS, control::BROADCAST_TIME, &payload)
        .expect("broadcast address is well-formed")
}

fn to_bcd_byte(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

/// Relay (load switch) command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    Trip = 0x1a,
    Close = 0x1b,
}

/// The production relay payload is encrypted with a key held outside this
/// crate; the cipher is injected. [`PlainCipher`] passes the block through
/// for bench meters with encryption disabled.
pub trait RelayCipher {
    fn encrypt_block(&self, block: [u8; 16]) -> [u8; 16];
}

pub struct PlainCipher;

impl RelayCipher for PlainCipher {
    fn encrypt_block(&self, block: [u8; 16]) -> [u8; 16] {
        block
    }
}

/// Relay control: a 16-byte block of timestamp, operator code, password and
/// command, padded and encrypted, sent with control 0x1C.
pub fn build_relay_control_frame(
    address: &str,
    command: RelayCommand,
    operator_code: u32,
    password: [u8; 4],
    cipher: &dyn RelayCipher,
    now: DateTime<Utc>,
) -> Result<Vec<u8>, CodecError> {
    let mut block = [0u8; 16];
    block[0] = to_bcd_byte(now.second() as u8);
    block[1] = to_bcd_byte(now.minute() as u8);
    block[2] = to_bcd_byte(now.hour() as u8);
    block[3] = to_bcd_byte(now.day() as u8);
    block[4] = to_bcd_byte(now.month() as u8);
    block[5] = to_bcd_byte((now.year() % 100) as u8);
    block[6..10].copy_from_slice(&operator_code.to_le_bytes());
    block[10..14].copy_from_slice(&password);
    block[14] = command as u8;
    // block[15] stays zero padding
    build(address, control::RELAY, &cipher.encrypt_block(block))
}

/// A decoded read response.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    pub data_id: u32,
    pub register: Option<&'static RegisterSpec>,
    pub raw_value: ReadingValue,
    pub value: ReadingValue,
    pub unit: Option<&'static str>,
}

/// Decode a read response: strip the offset, take the leading data
/// identifier, and decode the remainder with the register's BCD geometry.
pub fn parse_read_response(
    frame: &Frame,
    spec: Option<&'static RegisterSpec>,
) -> Result<ReadResponse, CodecError> {
    let plain = bcd::remove_offset(&frame.payload);
    if plain.len() < 4 {
        return Err(CodecError::ShortPayload(plain.len()));
    }
    let data_id = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]);
    let value_bytes = &plain[4..];
    let (raw_value, value, unit) = match spec {
        Some(spec) => {
            let slice = if value_bytes.len() >= spec.byte_len {
                &value_bytes[..spec.byte_len]
            } else {
                value_bytes
            };
            if spec.signed {
                let raw = bcd::decode_signed_bcd(slice, true)?;
                let scaled = raw as f64 / 10f64.powi(spec.decimals as i32);
                (
                    ReadingValue::Number(raw as f64),
                    ReadingValue::Number(scaled),
                    spec.unit,
                )
            } else {
                let raw = bcd::decode_bcd(slice, true)?;
                let scaled = raw as f64 / 10f64.powi(spec.decimals as i32);
                (
                    ReadingValue::Number(raw as f64),
                    ReadingValue::Number(scaled),
                    spec.unit,
                )
            }
        }
        None => match bcd::decode_bcd(value_bytes, true) {
            Ok(raw) => (
                ReadingValue::Number(raw as f64),
                ReadingValue::Number(raw as f64),
                None,
            ),
            // registers holding ASCII or status bits come back as bytes
            Err(_) => (
                ReadingValue::Bytes(value_bytes.to_vec()),
                ReadingValue::Bytes(value_bytes.to_vec()),
                None,
            ),
        },
    };
    Ok(ReadResponse {
        data_id,
        register: spec,
        raw_value,
        value,
        unit,
    })
}

/// One decoded error response.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub error_code: u8,
    pub error_message: String,
    pub control_code: u8,
}

// DL/T 645-2007 error bits. 0x08 is reported with the raw byte because the
// field has seen conflicting firmware interpretations.
const ERROR_BITS: &[(u8, &str)] = &[
    (0x01, "other error"),
    (0x02, "no requested data"),
    (0x04, "password error or unauthorised"),
    (0x08, "rate-change refused"),
    (0x10, "year time-zone count exceeded"),
    (0x20, "day period count exceeded"),
    (0x40, "tariff count exceeded"),
];

/// Decode an error response's bitfield into a message. Several bits may be
/// set at once; the raw byte is always included.
pub fn parse_error_response(frame: &Frame) -> Result<ErrorResponse, CodecError> {
    if !frame.is_error() {
        return Err(CodecError::NotAnError(frame.control));
    }
    let plain = bcd::remove_offset(&frame.payload);
    let error_code = *plain.first().ok_or(CodecError::ShortPayload(0))?;
    let mut names: Vec<&str> = ERROR_BITS
        .iter()
        .filter(|(bit, _)| error_code & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        names.push("unknown error");
    }
    Ok(ErrorResponse {
        error_code,
        error_message: format!("{} (code {error_code:#04x})", names.join(", ")),
        control_code: frame.control,
    })
}
