//! DLMS APDU parsing. Each APDU is identified by its first byte; the
//! specialist parsers below also know how to compute an APDU's total length
//! from a partial buffer, which is what lets the stream demultiplexer frame
//! raw APDUs that arrive without any wrapper.

use std::collections::BTreeMap;

use bytes::Buf;
use log::debug;
use thiserror::Error;

use crate::dlms::obis::{self, ObisCode};
use crate::dlms::value::{
    looks_like_cosem_datetime, parse_value, CosemDateTime, DlmsValue, ParsedValue, ValueError,
    MAX_DATA_TAG,
};
use crate::telemetry::{DlmsTelemetry, Reading, ReadingValue};

/// APDU tag bytes.
pub mod tags {
    pub const AARQ: u8 = 0x60;
    pub const AARE: u8 = 0x61;
    pub const RLRQ: u8 = 0x62;
    pub const RLRE: u8 = 0x63;
    pub const GET_REQUEST: u8 = 0xc0;
    pub const EVENT_NOTIFICATION: u8 = 0xc2;
    pub const GET_RESPONSE: u8 = 0xc4;
    pub const SET_RESPONSE: u8 = 0xc5;
    pub const ACTION_RESPONSE: u8 = 0xc7;
    pub const DATA_NOTIFICATION: u8 = 0x0f;
    pub const EXCEPTION_RESPONSE: u8 = 0xd8;
}

/// Tags that can legitimately start a DLMS APDU on this fleet's streams.
/// Used for protocol detection and content-based routing.
pub fn is_apdu_tag(byte: u8) -> bool {
    matches!(
        byte,
        tags::AARQ
            | tags::AARE
            | tags::RLRQ
            | tags::RLRE
            | tags::GET_REQUEST
            | tags::EVENT_NOTIFICATION
            | tags::GET_RESPONSE
            | tags::SET_RESPONSE
            | tags::ACTION_RESPONSE
            | tags::DATA_NOTIFICATION
            | tags::EXCEPTION_RESPONSE
    )
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApduError {
    #[error("empty APDU")]
    Empty,
    #[error("unknown APDU tag {0:#04x}")]
    UnknownTag(u8),
    #[error("APDU truncated")]
    Truncated,
    #[error("BER long-form length {0:#04x} not supported")]
    LongFormLength(u8),
    #[error("GET.response access-result choice {0:#04x} is invalid")]
    BadAccessResultChoice(u8),
    #[error("GET.response type {0:#04x} not supported (only get-response-normal)")]
    UnsupportedGetResponseType(u8),
    #[error("AARE carries no association-result")]
    BadAare,
    #[error("EventNotification body does not parse under either layout")]
    MalformedEventNotification,
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Named data-access-result codes (IEC 62056-5-3).
pub fn access_result_name(code: u8) -> &'static str {
    match code {
        0 => "success",
        1 => "hardware-fault",
        2 => "temporary-failure",
        3 => "read-write-denied",
        4 => "object-undefined",
        9 => "object-class-inconsistent",
        11 => "object-unavailable",
        12 => "type-unmatched",
        13 => "scope-of-access-violated",
        14 => "data-block-unavailable",
        15 => "long-get-aborted",
        16 => "no-long-get-in-progress",
        250 => "other-reason",
        _ => "unknown",
    }
}

/// Outcome of a GET.response.
#[derive(Debug, Clone, PartialEq)]
pub enum GetResult {
    Data(ParsedValue),
    Error { code: u8, name: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventNotification {
    pub timestamp: Option<CosemDateTime>,
    pub class_id: u16,
    pub obis: ObisCode,
    pub attribute: u8,
    pub value: ParsedValue,
    /// Vendor firmware sometimes appends further values after the attribute
    /// value; they are kept but not interpreted.
    pub extra: Vec<ParsedValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    Aarq { raw: Vec<u8> },
    Aare { accepted: bool, result: u8, raw: Vec<u8> },
    Rlrq { raw: Vec<u8> },
    Rlre { raw: Vec<u8> },
    GetRequest { raw: Vec<u8> },
    GetResponse { invoke_id: u8, result: GetResult },
    EventNotification(EventNotification),
    DataNotification {
        invoke_id: u32,
        timestamp: Option<CosemDateTime>,
        value: ParsedValue,
    },
    ExceptionResponse { state_error: u8, service_error: u8 },
}

impl Apdu {
    pub fn tag(&self) -> u8 {
        match self {
            Apdu::Aarq { .. } => tags::AARQ,
            Apdu::Aare { .. } => tags::AARE,
            Apdu::Rlrq { .. } => tags::RLRQ,
            Apdu::Rlre { .. } => tags::RLRE,
            Apdu::GetRequest { .. } => tags::GET_REQUEST,
            Apdu::GetResponse { .. } => tags::GET_RESPONSE,
            Apdu::EventNotification(_) => tags::EVENT_NOTIFICATION,
            Apdu::DataNotification { .. } => tags::DATA_NOTIFICATION,
            Apdu::ExceptionResponse { .. } => tags::EXCEPTION_RESPONSE,
        }
    }
}

/// Parse one complete APDU.
pub fn parse_apdu(bytes: &[u8]) -> Result<Apdu, ApduError> {
    let first = *bytes.first().ok_or(ApduError::Empty)?;
    match first {
        tags::AARQ => Ok(Apdu::Aarq { raw: bytes.to_vec() }),
        tags::AARE => parse_aare(bytes),
        tags::RLRQ => Ok(Apdu::Rlrq { raw: bytes.to_vec() }),
        tags::RLRE => Ok(Apdu::Rlre { raw: bytes.to_vec() }),
        tags::GET_REQUEST => Ok(Apdu::GetRequest { raw: bytes.to_vec() }),
        tags::GET_RESPONSE => parse_get_response(bytes),
        tags::EVENT_NOTIFICATION => match parse_event_notification(bytes)? {
            Some((event, _)) => Ok(Apdu::EventNotification(event)),
            None => Err(ApduError::Truncated),
        },
        tags::DATA_NOTIFICATION => parse_data_notification(bytes),
        tags::EXCEPTION_RESPONSE => {
            if bytes.len() < 3 {
                return Err(ApduError::Truncated);
            }
            Ok(Apdu::ExceptionResponse {
                state_error: bytes[1],
                service_error: bytes[2],
            })
        }
        other => Err(ApduError::UnknownTag(other)),
    }
}

/// Total length of the APDU starting at `buf[0]`, or `None` when more bytes
/// are needed. This is the framing table the raw-DLMS stream mode relies on.
pub fn apdu_length(buf: &[u8]) -> Result<Option<usize>, ApduError> {
    let first = *buf.first().ok_or(ApduError::Empty)?;
    match first {
        // BER-TLV envelopes, short-form length only
        tags::AARQ | tags::AARE | tags::RLRQ | tags::RLRE => {
            if buf.len() < 2 {
                return Ok(None);
            }
            if buf[1] & 0x80 != 0 {
                return Err(ApduError::LongFormLength(buf[1]));
            }
            Ok(Some(2 + buf[1] as usize))
        }
        tags::EXCEPTION_RESPONSE => Ok(Some(3)),
        tags::GET_REQUEST => Ok(Some(13)),
        tags::GET_RESPONSE => {
            if buf.len() < 4 {
                return Ok(None);
            }
            match buf[3] {
                0x01 => Ok(Some(5)),
                0x00 => match parse_value(&buf[4..]) {
                    Ok(parsed) => Ok(Some(4 + parsed.consumed)),
                    Err(ValueError::Truncated { .. }) => Ok(None),
                    Err(e) => Err(ApduError::Value(e)),
                },
                other => Err(ApduError::BadAccessResultChoice(other)),
            }
        }
        tags::EVENT_NOTIFICATION => Ok(parse_event_notification(buf)?.map(|(_, len)| len)),
        tags::DATA_NOTIFICATION => {
            if buf.len() < 6 {
                return Ok(None);
            }
            let datetime_len = buf[5] as usize;
            let value_at = 6 + datetime_len;
            if buf.len() < value_at {
                return Ok(None);
            }
            match parse_value(&buf[value_at..]) {
                Ok(parsed) => Ok(Some(value_at + parsed.consumed)),
                Err(ValueError::Truncated { .. }) => Ok(None),
                Err(e) => Err(ApduError::Value(e)),
            }
        }
        other => Err(ApduError::UnknownTag(other)),
    }
}

fn parse_aare(bytes: &[u8]) -> Result<Apdu, ApduError> {
    if bytes.len() < 2 {
        return Err(ApduError::Truncated);
    }
    let declared = bytes[1] as usize;
    if bytes[1] & 0x80 != 0 {
        return Err(ApduError::LongFormLength(bytes[1]));
    }
    if bytes.len() < 2 + declared {
        return Err(ApduError::Truncated);
    }
    // walk the AARE's inner BER elements for [A2] result(INTEGER)
    let mut body = &bytes[2..2 + declared];
    while body.len() >= 2 {
        let tag = body[0];
        let len = body[1] as usize;
        if body.len() < 2 + len {
            break;
        }
        let content = &body[2..2 + len];
        if tag == 0xa2 && len >= 3 && content[0] == 0x02 {
            let result = content[2];
            return Ok(Apdu::Aare {
                accepted: result == 0,
                result,
                raw: bytes.to_vec(),
            });
        }
        body = &body[2 + len..];
    }
    Err(ApduError::BadAare)
}

fn parse_get_response(bytes: &[u8]) -> Result<Apdu, ApduError> {
    if bytes.len() < 4 {
        return Err(ApduError::Truncated);
    }
    if bytes[1] != 0x01 {
        return Err(ApduError::UnsupportedGetResponseType(bytes[1]));
    }
    let invoke_id = bytes[2];
    let result = match bytes[3] {
        0x00 => GetResult::Data(parse_value(&bytes[4..])?),
        0x01 => {
            if bytes.len() < 5 {
                return Err(ApduError::Truncated);
            }
            let code = bytes[4];
            GetResult::Error {
                code,
                name: access_result_name(code),
            }
        }
        other => return Err(ApduError::BadAccessResultChoice(other)),
    };
    Ok(Apdu::GetResponse { invoke_id, result })
}

fn parse_data_notification(bytes: &[u8]) -> Result<Apdu, ApduError> {
    if bytes.len() < 6 {
        return Err(ApduError::Truncated);
    }
    let invoke_id = (&bytes[1..5]).get_u32();
    let datetime_len = bytes[5] as usize;
    let value_at = 6 + datetime_len;
    if bytes.len() < value_at {
        return Err(ApduError::Truncated);
    }
    let timestamp = if datetime_len >= 12 {
        Some(CosemDateTime::from_bytes(&bytes[6..18]))
    } else {
        None
    };
    let value = parse_value(&bytes[value_at..])?;
    Ok(Apdu::DataNotification {
        invoke_id,
        timestamp,
        value,
    })
}

enum Candidate {
    Complete(EventNotification, usize),
    More,
    Invalid,
}

fn event_candidate(body: &[u8], with_datetime: bool) -> Candidate {
    let (timestamp, mut pos) = if with_datetime {
        if body.len() < 12 {
            return Candidate::More;
        }
        (Some(CosemDateTime::from_bytes(&body[..12])), 12)
    } else {
        (None, 0)
    };
    if body.len() < pos + 2 {
        return Candidate::More;
    }
    let class_id = (&body[pos..pos + 2]).get_u16();
    pos += 2;
    // OBIS is either bare six octets or prefixed with an 0x06 length byte
    if body.get(pos) == Some(&0x06) {
        pos += 1;
    }
    if body.len() < pos + 6 {
        return Candidate::More;
    }
    let obis = match ObisCode::from_slice(&body[pos..pos + 6]) {
        Some(code) => code,
        None => return Candidate::Invalid,
    };
    pos += 6;
    if body.len() < pos + 1 {
        return Candidate::More;
    }
    let attribute = body[pos];
    pos += 1;
    let value = match parse_value(&body[pos..]) {
        Ok(parsed) => parsed,
        Err(ValueError::Truncated { .. }) => return Candidate::More,
        Err(_) => return Candidate::Invalid,
    };
    pos += value.consumed;
    let mut extra = Vec::new();
    while pos < body.len() && (1..=MAX_DATA_TAG).contains(&body[pos]) {
        match parse_value(&body[pos..]) {
            Ok(parsed) => {
                pos += parsed.consumed;
                extra.push(parsed);
            }
            Err(ValueError::Truncated { .. }) => return Candidate::More,
            // an in-range but unassigned tag marks the APDU boundary
            Err(_) => break,
        }
    }
    Candidate::Complete(
        EventNotification {
            timestamp,
            class_id,
            obis,
            attribute,
            value,
            extra,
        },
        pos,
    )
}

/// Parse an EventNotification, resolving the optional leading COSEM
/// date-time: both layouts are tried, and the one that exactly consumes the
/// buffer wins; when both (or neither) do, the datetime-less layout is
/// preferred. Returns `Ok(None)` when the buffer is still incomplete.
pub fn parse_event_notification(
    buf: &[u8],
) -> Result<Option<(EventNotification, usize)>, ApduError> {
    let body = &buf[1..];
    let remaining = body.len();
    let without = event_candidate(body, false);
    let with = if looks_like_cosem_datetime(body) {
        event_candidate(body, true)
    } else {
        Candidate::Invalid
    };
    let chosen = match (without, with) {
        (Candidate::Complete(a, la), Candidate::Complete(b, lb)) => {
            if la != remaining && lb == remaining {
                (b, lb)
            } else {
                (a, la)
            }
        }
        (Candidate::Complete(a, la), _) => (a, la),
        (_, Candidate::Complete(b, lb)) => (b, lb),
        (Candidate::More, _) | (_, Candidate::More) => return Ok(None),
        (Candidate::Invalid, Candidate::Invalid) => {
            return Err(ApduError::MalformedEventNotification)
        }
    };
    let (event, body_len) = chosen;
    Ok(Some((event, body_len + 1)))
}

fn to_reading_value(value: &DlmsValue) -> Option<ReadingValue> {
    if let Some(number) = value.as_f64() {
        return Some(ReadingValue::Number(number));
    }
    if let Some(text) = value.as_text() {
        return Some(ReadingValue::Text(text));
    }
    match value {
        DlmsValue::OctetString(bytes) => Some(ReadingValue::Bytes(bytes.clone())),
        DlmsValue::BitString { bytes, .. } => Some(ReadingValue::Bytes(bytes.clone())),
        _ => None,
    }
}

fn reading_for(obis: Option<ObisCode>, value: &DlmsValue) -> Option<(String, Reading)> {
    let raw = to_reading_value(value)?;
    let def = obis.as_ref().and_then(obis::lookup);
    let key = match def {
        Some(def) => def.key.to_string(),
        None => obis.map(|code| code.to_string()).unwrap_or_else(|| "value".to_string()),
    };
    let scaled = match (def.and_then(|d| d.scaler), &raw) {
        (Some(scaler), ReadingValue::Number(n)) => ReadingValue::Number(n * scaler),
        _ => raw.clone(),
    };
    Some((
        key,
        Reading {
            value: scaled,
            raw_value: raw,
            unit: def.and_then(|d| d.unit),
            obis,
        },
    ))
}

/// Normalise a data-bearing APDU into telemetry. `obis_hint` supplies the
/// register a GET.response belongs to (the response itself does not carry
/// it). Error responses and non-data APDUs yield `None`.
pub fn extract_telemetry(apdu: &Apdu, obis_hint: Option<ObisCode>) -> Option<DlmsTelemetry> {
    match apdu {
        Apdu::EventNotification(event) => {
            let mut readings = BTreeMap::new();
            if let Some((key, reading)) = reading_for(Some(event.obis), &event.value.value) {
                readings.insert(key, reading);
            } else {
                debug!(
                    "EventNotification for {} carries non-scalar {:?}",
                    event.obis,
                    event.value.tag.name()
                );
            }
            Some(DlmsTelemetry {
                kind: "event_notification",
                timestamp: event.timestamp.and_then(|ts| ts.to_datetime()),
                readings,
            })
        }
        Apdu::DataNotification {
            timestamp, value, ..
        } => {
            let mut readings = BTreeMap::new();
            match &value.value {
                DlmsValue::Structure(elements) | DlmsValue::Array(elements) => {
                    for (index, element) in elements.iter().enumerate() {
                        if let Some(raw) = to_reading_value(element) {
                            readings.insert(
                                format!("value_{index}"),
                                Reading {
                                    value: raw.clone(),
                                    raw_value: raw,
                                    unit: None,
                                    obis: None,
                                },
                            );
                        }
                    }
                }
                scalar => {
                    if let Some((key, reading)) = reading_for(obis_hint, scalar) {
                        readings.insert(key, reading);
                    }
                }
            }
            Some(DlmsTelemetry {
                kind: "data_notification",
                timestamp: timestamp.and_then(|ts| ts.to_datetime()),
                readings,
            })
        }
        Apdu::GetResponse {
            result: GetResult::Data(parsed),
            ..
        } => {
            let mut readings = BTreeMap::new();
            if let Some((key, reading)) = reading_for(obis_hint, &parsed.value) {
                readings.insert(key, reading);
            }
            Some(DlmsTelemetry {
                kind: "get_response",
                timestamp: None,
                readings,
            })
        }
        _ => None,
    }
}
