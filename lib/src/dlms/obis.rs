//! OBIS register identification and the static registry of registers the
//! gateway knows how to label, unit and scale.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::Serialize;
use thiserror::Error;

/// A six-octet OBIS code, written `A-B:C.D.E.F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObisCode(pub [u8; 6]);

#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid OBIS code {0:?}")]
pub struct ObisParseError(pub String);

impl ObisCode {
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        ObisCode([a, b, c, d, e, f])
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 6] = bytes.try_into().ok()?;
        Some(ObisCode(array))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a}-{b}:{c}.{d}.{e}.{g}")
    }
}

impl FromStr for ObisCode {
    type Err = ObisParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(['-', ':', '.']).collect();
        if parts.len() != 6 {
            return Err(ObisParseError(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| ObisParseError(s.to_string()))?;
        }
        Ok(ObisCode(bytes))
    }
}

// ordered by textual form, as consumers list registers alphabetically
impl Ord for ObisCode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for ObisCode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ObisCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Register category, used to group registers for polling and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Energy,
    Voltage,
    Current,
    Power,
    PowerFactor,
    System,
    Demand,
    Events,
    Control,
}

/// Static description of one register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDef {
    pub key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub category: Category,
    /// Multiplier applied to the raw reading to obtain engineering units.
    pub scaler: Option<f64>,
}

macro_rules! entry {
    ($a:literal, $b:literal, $c:literal, $d:literal, $e:literal, $f:literal,
     $key:literal, $name:literal, $unit:expr, $cat:ident, $scaler:expr) => {
        (
            ObisCode::new($a, $b, $c, $d, $e, $f),
            RegisterDef {
                key: $key,
                name: $name,
                unit: $unit,
                category: Category::$cat,
                scaler: $scaler,
            },
        )
    };
}

/// Registers confirmed on the EM114070 reference meter, plus the standard
/// three-phase voltage/current/power codes for compatible hardware.
static REGISTERS: &[(ObisCode, RegisterDef)] = &[
    // energy
    entry!(1, 0, 1, 8, 0, 255, "TOTAL_ACTIVE_IMPORT", "Total active energy import", Some("kWh"), Energy, None),
    entry!(1, 0, 2, 8, 0, 255, "TOTAL_ACTIVE_EXPORT", "Total active energy export", Some("kWh"), Energy, None),
    entry!(1, 0, 15, 8, 0, 255, "TOTAL_ABSOLUTE_ACTIVE_ENERGY", "Total absolute active energy", Some("kWh"), Energy, None),
    // instantaneous totals
    entry!(1, 0, 1, 7, 0, 255, "TOTAL_ACTIVE_POWER", "Total active power", Some("W"), Power, None),
    entry!(1, 0, 3, 7, 0, 255, "TOTAL_REACTIVE_POWER", "Total reactive power", Some("var"), Power, None),
    entry!(1, 0, 9, 7, 0, 255, "TOTAL_APPARENT_POWER", "Total apparent power", Some("VA"), Power, None),
    entry!(1, 0, 11, 7, 0, 255, "CURRENT", "Current", Some("A"), Current, Some(0.001)),
    entry!(1, 0, 12, 7, 0, 255, "VOLTAGE", "Voltage", Some("V"), Voltage, Some(0.01)),
    entry!(1, 0, 13, 7, 0, 255, "POWER_FACTOR", "Power factor", None, PowerFactor, Some(0.001)),
    entry!(1, 0, 14, 7, 0, 255, "FREQUENCY", "Supply frequency", Some("Hz"), System, Some(0.01)),
    entry!(1, 0, 91, 7, 0, 255, "NEUTRAL_CURRENT", "Neutral current", Some("A"), Current, Some(0.001)),
    // per-phase instantaneous
    entry!(1, 0, 32, 7, 0, 255, "PHASE_A_VOLTAGE", "Phase A voltage", Some("V"), Voltage, None),
    entry!(1, 0, 52, 7, 0, 255, "PHASE_B_VOLTAGE", "Phase B voltage", Some("V"), Voltage, None),
    entry!(1, 0, 72, 7, 0, 255, "PHASE_C_VOLTAGE", "Phase C voltage", Some("V"), Voltage, None),
    entry!(1, 0, 31, 7, 0, 255, "PHASE_A_CURRENT", "Phase A current", Some("A"), Current, None),
    entry!(1, 0, 51, 7, 0, 255, "PHASE_B_CURRENT", "Phase B current", Some("A"), Current, None),
    entry!(1, 0, 71, 7, 0, 255, "PHASE_C_CURRENT", "Phase C current", Some("A"), Current, None),
    entry!(1, 0, 21, 7, 0, 255, "PHASE_A_ACTIVE_POWER", "Phase A active power", Some("W"), Power, None),
    entry!(1, 0, 41, 7, 0, 255, "PHASE_B_ACTIVE_POWER", "Phase B active power", Some("W"), Power, None),
    entry!(1, 0, 61, 7, 0, 255, "PHASE_C_ACTIVE_POWER", "Phase C active power", Some("W"), Power, None),
    // demand
    entry!(1, 0, 1, 6, 0, 255, "ACTIVE_DEMAND_MAX", "Maximum active demand", Some("kW"), Demand, None),
    // system / identification
    entry!(0, 0, 1, 0, 0, 255, "CLOCK", "Meter clock", None, System, None),
    entry!(0, 0, 42, 0, 0, 255, "LOGICAL_DEVICE_NAME", "COSEM logical device name", None, System, None),
    entry!(0, 0, 96, 1, 0, 255, "METER_SERIAL_NUMBER", "Meter serial number", None, System, None),
    entry!(0, 0, 96, 1, 1, 255, "DEVICE_ID_2", "Device identifier 2", None, System, None),
    entry!(0, 0, 96, 14, 0, 255, "ACTIVE_TARIFF", "Currently active tariff", None, System, None),
    // events / control
    entry!(0, 0, 96, 7, 21, 255, "POWER_FAILURE_COUNT", "Number of power failures", None, Events, None),
    entry!(0, 0, 96, 3, 10, 255, "RELAY_STATE", "Disconnect control state", None, Control, None),
];

fn registry() -> &'static HashMap<ObisCode, &'static RegisterDef> {
    static REGISTRY: OnceLock<HashMap<ObisCode, &'static RegisterDef>> = OnceLock::new();
    REGISTRY.get_or_init(|| REGISTERS.iter().map(|(code, def)| (*code, def)).collect())
}

/// Look up a register definition. Misses are not errors; callers fall back
/// to the raw OBIS string.
pub fn lookup(code: &ObisCode) -> Option<&'static RegisterDef> {
    registry().get(code).copied()
}

/// Look up by mnemonic key, e.g. "VOLTAGE".
pub fn lookup_by_key(key: &str) -> Option<(ObisCode, &'static RegisterDef)> {
    REGISTERS
        .iter()
        .find(|(_, def)| def.key.eq_ignore_ascii_case(key))
        .map(|(code, def)| (*code, def))
}

/// All registered codes, for enumeration.
pub fn all() -> impl Iterator<Item = (ObisCode, &'static RegisterDef)> {
    REGISTERS.iter().map(|(code, def)| (*code, def))
}
