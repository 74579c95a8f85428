//! Heartbeat frames. Meters announce themselves with a fixed 26-byte
//! message: an 11-byte signature, twelve ASCII digits of meter address, a
//! separator and two trailing CRC bytes the fleet never validates.

use deku::prelude::*;
use thiserror::Error;

/// Total heartbeat frame length, IVY header included.
pub const HEARTBEAT_LEN: usize = 26;

/// The fixed prefix of every heartbeat: an IVY public-client header with
/// payload length 0x0012, followed by the vendor's `0a 02 0c` marker.
pub const HEARTBEAT_SIGNATURE: [u8; 11] = [
    0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x12, 0x0a, 0x02, 0x0c,
];

/// Marker at the start of the heartbeat's 18-byte IVY payload.
pub const HEARTBEAT_PAYLOAD_SIGNATURE: [u8; 3] = [0x0a, 0x02, 0x0c];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HeartbeatError {
    #[error("heartbeat payload is {0} bytes, expected 18")]
    BadLength(usize),
    #[error("heartbeat payload lacks the 0a 02 0c marker")]
    BadSignature,
    #[error("heartbeat address bytes are not ASCII digits")]
    BadAddress,
}

/// Detection on a whole frame: only the 11-byte signature is tested.
pub fn is_heartbeat(frame: &[u8]) -> bool {
    frame.len() >= HEARTBEAT_SIGNATURE.len() && frame[..HEARTBEAT_SIGNATURE.len()] == HEARTBEAT_SIGNATURE
}

/// Detection on an already-unwrapped IVY payload.
pub fn payload_is_heartbeat(payload: &[u8]) -> bool {
    payload.len() >= HEARTBEAT_PAYLOAD_SIGNATURE.len()
        && payload[..HEARTBEAT_PAYLOAD_SIGNATURE.len()] == HEARTBEAT_PAYLOAD_SIGNATURE
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(magic = b"\x0a\x02\x0c")]
struct HeartbeatPayload {
    address: [u8; 12],
    separator: u8,
    crc: [u8; 2],
}

/// A parsed heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    /// Twelve ASCII decimal digits.
    pub address: String,
}

impl Heartbeat {
    /// All-zero addresses come from meters that lost their provisioning;
    /// the connection layer decides whether to accept or substitute them.
    pub fn is_zero_address(&self) -> bool {
        self.address.bytes().all(|b| b == b'0')
    }
}

/// Parse the 18-byte IVY payload of a heartbeat.
pub fn parse_payload(payload: &[u8]) -> Result<Heartbeat, HeartbeatError> {
    if payload.len() != HEARTBEAT_LEN - crate::ivy::IVY_HEADER_LEN {
        return Err(HeartbeatError::BadLength(payload.len()));
    }
    let (_, parsed) = HeartbeatPayload::from_bytes((payload, 0))
        .map_err(|_| HeartbeatError::BadSignature)?;
    if !parsed.address.iter().all(|b| b.is_ascii_digit()) {
        return Err(HeartbeatError::BadAddress);
    }
    let address = String::from_utf8(parsed.address.to_vec()).expect("digits are valid UTF-8");
    Ok(Heartbeat { address })
}
