//! Normalised telemetry shapes shared by the DL/T 645 and DLMS paths. The
//! gateway publishes these regardless of which wire protocol produced them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dlms::obis::ObisCode;

/// Which protocol family produced a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TelemetrySource {
    #[serde(rename = "dlt645")]
    Dlt645,
    #[serde(rename = "dlms")]
    Dlms,
}

/// A reading value after decoding. Most registers are numeric; device
/// identifiers and the meter clock come back as text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Number(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ReadingValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ReadingValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// One decoded register value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub value: ReadingValue,
    /// Value before the registry scaler was applied.
    pub raw_value: ReadingValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obis: Option<ObisCode>,
}

/// Normalised telemetry extracted from one DLMS notification or response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlmsTelemetry {
    /// Which APDU produced this ("event_notification", "data_notification",
    /// "get_response").
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Keyed by registry mnemonic, or by the raw OBIS string on a registry
    /// miss.
    pub readings: BTreeMap<String, Reading>,
}
