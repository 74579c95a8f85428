//! Data identifiers of the 2007 edition the gateway can label and decode.
//! Lengths and precisions follow the standard's appendix A tables.

/// BCD geometry and labelling for one data identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterSpec {
    pub data_id: u32,
    pub key: &'static str,
    pub name: &'static str,
    pub byte_len: usize,
    /// Decimal places encoded in the BCD value.
    pub decimals: u32,
    pub unit: Option<&'static str>,
    /// Power and current registers carry a direction sign bit.
    pub signed: bool,
}

macro_rules! spec {
    ($id:literal, $key:literal, $name:literal, $len:literal, $dec:literal, $unit:expr, $signed:literal) => {
        RegisterSpec {
            data_id: $id,
            key: $key,
            name: $name,
            byte_len: $len,
            decimals: $dec,
            unit: $unit,
            signed: $signed,
        }
    };
}

static REGISTERS: &[RegisterSpec] = &[
    // energy, XXXXXX.XX
    spec!(0x0000_0000, "TOTAL_ACTIVE_ENERGY", "Combined active energy", 4, 2, Some("kWh"), false),
    spec!(0x0001_0000, "FORWARD_ACTIVE_ENERGY", "Forward active energy", 4, 2, Some("kWh"), false),
    spec!(0x0002_0000, "REVERSE_ACTIVE_ENERGY", "Reverse active energy", 4, 2, Some("kWh"), false),
    spec!(0x0003_0000, "FORWARD_REACTIVE_ENERGY", "Forward reactive energy", 4, 2, Some("kvarh"), false),
    spec!(0x0004_0000, "REVERSE_REACTIVE_ENERGY", "Reverse reactive energy", 4, 2, Some("kvarh"), false),
    // voltages, XXX.X
    spec!(0x0201_0100, "PHASE_A_VOLTAGE", "Phase A voltage", 2, 1, Some("V"), false),
    spec!(0x0201_0200, "PHASE_B_VOLTAGE", "Phase B voltage", 2, 1, Some("V"), false),
    spec!(0x0201_0300, "PHASE_C_VOLTAGE", "Phase C voltage", 2, 1, Some("V"), false),
    // currents, XXX.XXX signed
    spec!(0x0202_0100, "PHASE_A_CURRENT", "Phase A current", 3, 3, Some("A"), true),
    spec!(0x0202_0200, "PHASE_B_CURRENT", "Phase B current", 3, 3, Some("A"), true),
    spec!(0x0202_0300, "PHASE_C_CURRENT", "Phase C current", 3, 3, Some("A"), true),
    // powers, XX.XXXX signed
    spec!(0x0203_0000, "TOTAL_ACTIVE_POWER", "Total active power", 3, 4, Some("kW"), true),
    spec!(0x0203_0100, "PHASE_A_ACTIVE_POWER", "Phase A active power", 3, 4, Some("kW"), true),
    spec!(0x0203_0200, "PHASE_B_ACTIVE_POWER", "Phase B active power", 3, 4, Some("kW"), true),
    spec!(0x0203_0300, "PHASE_C_ACTIVE_POWER", "Phase C active power", 3, 4, Some("kW"), true),
    // power factor, X.XXX signed
    spec!(0x0206_0000, "TOTAL_POWER_FACTOR", "Total power factor", 2, 3, None, true),
    // frequency, XX.XX
    spec!(0x0280_0002, "FREQUENCY", "Grid frequency", 2, 2, Some("Hz"), false),
];

/// Look up by data identifier. Misses are not errors; the caller reports
/// the raw identifier.
pub fn lookup(data_id: u32) -> Option<&'static RegisterSpec> {
    REGISTERS.iter().find(|spec| spec.data_id == data_id)
}

/// Look up by mnemonic, case-insensitively.
pub fn lookup_by_key(key: &str) -> Option<&'static RegisterSpec> {
    REGISTERS.iter().find(|spec| spec.key.eq_ignore_ascii_case(key))
}

pub fn all() -> impl Iterator<Item = &'static RegisterSpec> {
    REGISTERS.iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let spec = lookup(0x0000_0000).unwrap();
        assert_eq!(spec.key, "TOTAL_ACTIVE_ENERGY");
        assert_eq!(spec.decimals, 2);
        assert!(lookup(0xdead_beef).is_none());
    }

    #[test]
    fn test_lookup_by_key() {
        assert_eq!(
            lookup_by_key("phase_a_voltage").unwrap().data_id,
            0x0201_0100
        );
        assert!(lookup_by_key("NOPE").is_none());
    }

    #[test]
    fn test_keys_unique() {
        let mut keys: Vec<&str> = REGISTERS.iter().map(|spec| spec.key).collect();
        keys.sort_unstable();
        let count = keys.len();
        keys.dedup();
        assert_eq!(count, keys.len());
    }
}
