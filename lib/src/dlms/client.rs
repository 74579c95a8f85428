//! Client-side APDU builders for the active poller: AARQ, GET.request and
//! RLRQ. Only the logical-name no-ciphering association is spoken; that is
//! what the fleet's public client (0x10) uses.

use deku::prelude::*;

use crate::dlms::obis::ObisCode;

/// DLMS public client SAP used by the gateway.
pub const CLIENT_ADDRESS: u8 = 0x10;

/// Application context name for LN referencing without ciphering,
/// OID 2.16.756.5.8.1.1.
pub const APPLICATION_CONTEXT_LN: [u8; 7] = [0x60, 0x85, 0x74, 0x05, 0x08, 0x01, 0x01];

/// xDLMS InitiateRequest: proposed DLMS version 6, conformance bits
/// permitting GET and block transfer, client-max-receive-pdu-size 0xffff.
const INITIATE_REQUEST: [u8; 14] = [
    0x01, 0x00, 0x00, 0x00, 0x06, 0x5f, 0x1f, 0x04, 0x00, 0x00, 0x7e, 0x1f, 0xff, 0xff,
];

/// Build an AARQ proposing the LN no-cipher context.
pub fn build_aarq() -> Vec<u8> {
    let mut body = Vec::with_capacity(29);
    body.extend([0xa1, 0x09, 0x06, 0x07]); // application-context-name
    body.extend(APPLICATION_CONTEXT_LN);
    body.extend([0xbe, 0x10, 0x04, 0x0e]); // user-information octet string
    body.extend(INITIATE_REQUEST);
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(0x60);
    out.push(body.len() as u8);
    out.extend(body);
    out
}

/// GET.request-normal, a fixed 13-byte layout.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"\xc0\x01")]
pub struct GetRequestNormal {
    pub invoke_id: u8,
    pub class_id: u16,
    pub obis: [u8; 6],
    pub attribute: u8,
    /// No selective access is ever requested.
    pub access_selection: u8,
}

/// Build a GET.request-normal for one attribute (attribute 2, the value,
/// unless stated otherwise).
pub fn build_get_request(class_id: u16, obis: ObisCode, attribute: u8, invoke_id: u8) -> Vec<u8> {
    let request = GetRequestNormal {
        invoke_id,
        class_id,
        obis: *obis.as_bytes(),
        attribute,
        access_selection: 0,
    };
    request.to_bytes().expect("fixed-layout GET.request always serialises")
}

/// Build an RLRQ with the given release reason (0 = normal).
pub fn build_release_request(reason: u8) -> Vec<u8> {
    vec![0x62, 0x03, 0x80, 0x01, reason]
}

/// Next invoke-id in the cycling 1..=255 sequence.
pub fn next_invoke_id(current: u8) -> u8 {
    if current == u8::MAX { 1 } else { current + 1 }
}
