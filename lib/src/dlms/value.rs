//! DLMS data-type decoder: one tag-length-value per call, recursive for
//! arrays and structures. The decoder never reads past the `consumed` count
//! it reports, so containers and the stream framer can advance safely.

use bytes::Buf;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use num_enum::TryFromPrimitive;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("unknown DLMS data tag {0:#04x}")]
    UnknownTag(u8),
    #[error("truncated DLMS value (needed {needed} bytes, have {available})")]
    Truncated { needed: usize, available: usize },
    #[error("invalid visible-string payload")]
    BadString,
}

/// Wire tags of the DLMS data types the gateway decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum DataTag {
    NullData = 0,
    Array = 1,
    Structure = 2,
    Boolean = 3,
    BitString = 4,
    Int32 = 5,
    Uint32 = 6,
    OctetString = 9,
    VisibleString = 10,
    Utf8String = 12,
    Int8 = 15,
    Int16 = 16,
    Uint8 = 17,
    Uint16 = 18,
    Int64 = 20,
    Uint64 = 21,
    Enum = 22,
    Float32 = 23,
    Float64 = 24,
    DateTime = 25,
    Date = 26,
    Time = 27,
}

impl DataTag {
    pub fn name(&self) -> &'static str {
        match self {
            DataTag::NullData => "null-data",
            DataTag::Array => "array",
            DataTag::Structure => "structure",
            DataTag::Boolean => "boolean",
            DataTag::BitString => "bit-string",
            DataTag::Int32 => "double-long",
            DataTag::Uint32 => "double-long-unsigned",
            DataTag::OctetString => "octet-string",
            DataTag::VisibleString => "visible-string",
            DataTag::Utf8String => "utf8-string",
            DataTag::Int8 => "integer",
            DataTag::Int16 => "long",
            DataTag::Uint8 => "unsigned",
            DataTag::Uint16 => "long-unsigned",
            DataTag::Int64 => "long64",
            DataTag::Uint64 => "long64-unsigned",
            DataTag::Enum => "enum",
            DataTag::Float32 => "float32",
            DataTag::Float64 => "float64",
            DataTag::DateTime => "date-time",
            DataTag::Date => "date",
            DataTag::Time => "time",
        }
    }
}

/// Highest tag value in the data type set. Trailing-value detection in
/// EventNotification framing treats bytes in `1..=MAX_DATA_TAG` as the start
/// of another value.
pub const MAX_DATA_TAG: u8 = DataTag::Time as u8;

#[derive(Debug, Clone, PartialEq)]
pub enum DlmsValue {
    Null,
    Boolean(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Enum(u8),
    OctetString(Vec<u8>),
    VisibleString(String),
    Utf8String(String),
    BitString { bit_len: usize, bytes: Vec<u8> },
    DateTime(CosemDateTime),
    Date(CosemDate),
    Time(CosemTime),
    Array(Vec<DlmsValue>),
    Structure(Vec<DlmsValue>),
}

impl DlmsValue {
    /// Numeric view of the value, for scaler application.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DlmsValue::Signed(v) => Some(*v as f64),
            DlmsValue::Unsigned(v) => Some(*v as f64),
            DlmsValue::Float(v) => Some(*v),
            DlmsValue::Enum(v) => Some(*v as f64),
            DlmsValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Text view: strings come back verbatim, octet strings holding
    /// printable ASCII are decoded, date-times are formatted ISO-8601.
    pub fn as_text(&self) -> Option<String> {
        match self {
            DlmsValue::VisibleString(s) | DlmsValue::Utf8String(s) => Some(s.clone()),
            DlmsValue::OctetString(bytes) if bytes.iter().all(|b| b.is_ascii_graphic()) => {
                String::from_utf8(bytes.clone()).ok()
            }
            DlmsValue::DateTime(dt) => dt.to_datetime().map(|d| d.to_rfc3339()),
            _ => None,
        }
    }
}

/// Result of decoding one value: the value, its wire tag, and how many
/// bytes of input it occupied.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedValue {
    pub tag: DataTag,
    pub value: DlmsValue,
    pub consumed: usize,
}

fn need(buf: &[u8], n: usize) -> Result<(), ValueError> {
    if buf.len() < n {
        return Err(ValueError::Truncated {
            needed: n,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Decode one DLMS value starting at `buf[0]`.
pub fn parse_value(buf: &[u8]) -> Result<ParsedValue, ValueError> {
    need(buf, 1)?;
    let tag = DataTag::try_from(buf[0]).map_err(|_| ValueError::UnknownTag(buf[0]))?;
    let body = &buf[1..];
    let (value, body_len) = match tag {
        DataTag::NullData => (DlmsValue::Null, 0),
        DataTag::Boolean => {
            need(body, 1)?;
            (DlmsValue::Boolean(body[0] != 0), 1)
        }
        DataTag::Int8 => {
            need(body, 1)?;
            (DlmsValue::Signed(body[0] as i8 as i64), 1)
        }
        DataTag::Uint8 => {
            need(body, 1)?;
            (DlmsValue::Unsigned(body[0] as u64), 1)
        }
        DataTag::Enum => {
            need(body, 1)?;
            (DlmsValue::Enum(body[0]), 1)
        }
        DataTag::Int16 => {
            need(body, 2)?;
            (DlmsValue::Signed((&body[..2]).get_i16() as i64), 2)
        }
        DataTag::Uint16 => {
            need(body, 2)?;
            (DlmsValue::Unsigned((&body[..2]).get_u16() as u64), 2)
        }
        DataTag::Int32 => {
            need(body, 4)?;
            (DlmsValue::Signed((&body[..4]).get_i32() as i64), 4)
        }
        DataTag::Uint32 => {
            need(body, 4)?;
            (DlmsValue::Unsigned((&body[..4]).get_u32() as u64), 4)
        }
        DataTag::Int64 => {
            need(body, 8)?;
            (DlmsValue::Signed((&body[..8]).get_i64()), 8)
        }
        DataTag::Uint64 => {
            need(body, 8)?;
            (DlmsValue::Unsigned((&body[..8]).get_u64()), 8)
        }
        DataTag::Float32 => {
            need(body, 4)?;
            (DlmsValue::Float((&body[..4]).get_f32() as f64), 4)
        }
        DataTag::Float64 => {
            need(body, 8)?;
            (DlmsValue::Float((&body[..8]).get_f64()), 8)
        }
        DataTag::OctetString => {
            need(body, 1)?;
            let len = body[0] as usize;
            need(body, 1 + len)?;
            (DlmsValue::OctetString(body[1..1 + len].to_vec()), 1 + len)
        }
        DataTag::VisibleString => {
            need(body, 1)?;
            let len = body[0] as usize;
            need(body, 1 + len)?;
            let text = body[1..1 + len]
                .iter()
                .map(|&b| b as char)
                .collect::<String>();
            (DlmsValue::VisibleString(text), 1 + len)
        }
        DataTag::Utf8String => {
            need(body, 1)?;
            let len = body[0] as usize;
            need(body, 1 + len)?;
            let text = String::from_utf8(body[1..1 + len].to_vec())
                .map_err(|_| ValueError::BadString)?;
            (DlmsValue::Utf8String(text), 1 + len)
        }
        DataTag::BitString => {
            need(body, 1)?;
            let bit_len = body[0] as usize;
            let byte_len = bit_len.div_ceil(8);
            need(body, 1 + byte_len)?;
            (
                DlmsValue::BitString {
                    bit_len,
                    bytes: body[1..1 + byte_len].to_vec(),
                },
                1 + byte_len,
            )
        }
        DataTag::DateTime => {
            need(body, 12)?;
            (
                DlmsValue::DateTime(CosemDateTime::from_bytes(&body[..12])),
                12,
            )
        }
        DataTag::Date => {
            need(body, 5)?;
            (DlmsValue::Date(CosemDate::from_bytes(&body[..5])), 5)
        }
        DataTag::Time => {
            need(body, 4)?;
            (DlmsValue::Time(CosemTime::from_bytes(&body[..4])), 4)
        }
        DataTag::Array | DataTag::Structure => {
            need(body, 1)?;
            let count = body[0] as usize;
            let mut elements = Vec::with_capacity(count);
            let mut pos = 1;
            for _ in 0..count {
                let element = parse_value(&body[pos..])?;
                pos += element.consumed;
                elements.push(element.value);
            }
            let value = if tag == DataTag::Array {
                DlmsValue::Array(elements)
            } else {
                DlmsValue::Structure(elements)
            };
            (value, pos)
        }
    };
    Ok(ParsedValue {
        tag,
        value,
        consumed: 1 + body_len,
    })
}

/// COSEM date-time, 12 bytes on the wire. 0xFFFF / 0xFF fields mean
/// "not specified".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosemDateTime {
    pub year: Option<u16>,
    pub month: Option<u8>,
    pub day: Option<u8>,
    pub weekday: Option<u8>,
    pub hour: Option<u8>,
    pub minute: Option<u8>,
    pub second: Option<u8>,
    pub hundredths: Option<u8>,
    /// Minutes of local time from UTC.
    pub deviation: Option<i16>,
    pub status: u8,
}

fn opt_byte(b: u8) -> Option<u8> {
    if b == 0xff { None } else { Some(b) }
}

impl CosemDateTime {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let year = (&bytes[..2]).get_u16();
        let deviation = (&bytes[9..11]).get_i16();
        CosemDateTime {
            year: if year == 0xffff { None } else { Some(year) },
            month: opt_byte(bytes[2]),
            day: opt_byte(bytes[3]),
            weekday: opt_byte(bytes[4]),
            hour: opt_byte(bytes[5]),
            minute: opt_byte(bytes[6]),
            second: opt_byte(bytes[7]),
            hundredths: opt_byte(bytes[8]),
            deviation: if deviation == i16::MIN {
                None
            } else {
                Some(deviation)
            },
            status: bytes[11],
        }
    }

    /// UTC timestamp, when year, month and day are all specified.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let date = NaiveDate::from_ymd_opt(
            self.year? as i32,
            self.month? as u32,
            self.day? as u32,
        )?;
        let naive = date.and_hms_opt(
            self.hour.unwrap_or(0) as u32,
            self.minute.unwrap_or(0) as u32,
            self.second.unwrap_or(0) as u32,
        )?;
        let utc = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);
        match self.deviation {
            Some(minutes) => Some(utc - Duration::minutes(minutes as i64)),
            None => Some(utc),
        }
    }
}

/// Cheap test for "the next 12 bytes could be a COSEM date-time", used to
/// disambiguate EventNotification layouts. Accepts years 2000-2099 (and the
/// 0xFFFF wildcard) like the reference firmware.
pub fn looks_like_cosem_datetime(bytes: &[u8]) -> bool {
    if bytes.len() < 12 {
        return false;
    }
    let year = (&bytes[..2]).get_u16();
    let month = bytes[2];
    let hour = bytes[5];
    (year == 0xffff || (2000..=2099).contains(&year))
        && ((1..=12).contains(&month) || month == 0xff)
        && (hour <= 23 || hour == 0xff)
}

/// COSEM date, 5 bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosemDate {
    pub year: Option<u16>,
    pub month: Option<u8>,
    pub day: Option<u8>,
    pub weekday: Option<u8>,
}

impl CosemDate {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let year = (&bytes[..2]).get_u16();
        CosemDate {
            year: if year == 0xffff { None } else { Some(year) },
            month: opt_byte(bytes[2]),
            day: opt_byte(bytes[3]),
            weekday: opt_byte(bytes[4]),
        }
    }
}

/// COSEM time, 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosemTime {
    pub hour: Option<u8>,
    pub minute: Option<u8>,
    pub second: Option<u8>,
    pub hundredths: Option<u8>,
}

impl CosemTime {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        CosemTime {
            hour: opt_byte(bytes[0]),
            minute: opt_byte(bytes[1]),
            second: opt_byte(bytes[2]),
            hundredths: opt_byte(bytes[3]),
        }
    }
}
