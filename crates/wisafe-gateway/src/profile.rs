//! Device types and the capabilities that drive event correlation.

/// Flag set on every WiSafe device type reported to the shadow.
pub const WISAFE_TYPE_FLAG: u32 = 0x0001_0000;

/// Number of fault-detail types, including "none".
pub const FAULT_DETAIL_TYPES: usize = 9;

/// Bits in a fault-detail word.
pub const FAULT_DETAIL_BITS: usize = 16;

/// What a device type can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Device type (without [`WISAFE_TYPE_FLAG`]).
    pub device_type: u8,
    /// Human-readable name.
    pub name: &'static str,
    /// Read the battery voltage when a battery fault is reported.
    pub read_volts_on_fault: bool,
    /// Row of [`FAULT_DETAILS_MAP`] for this device; 0 means no fault details.
    pub fault_details_type: u8,
    /// Read the temperature when an alarm is reported.
    pub temperature_alarm: bool,
}

const fn profile(
    device_type: u8,
    name: &'static str,
    read_volts_on_fault: bool,
    fault_details_type: u8,
    temperature_alarm: bool,
) -> DeviceProfile {
    DeviceProfile {
        device_type,
        name,
        read_volts_on_fault,
        fault_details_type,
        temperature_alarm,
    }
}

/// Known device profiles.
pub const PROFILES: &[DeviceProfile] = &[
    profile(1, "ColdAlarm", false, 4, true),
    profile(65, "COAlarm", false, 3, false),
    profile(129, "SmokeAlarm", true, 1, false),
    profile(130, "HeatAlarm", false, 2, false),
    profile(134, "ACSmokeAlarm", false, 5, false),
    profile(135, "ACHeatAlarm", false, 6, true),
    profile(196, "ACU", false, 0, false),
    profile(199, "interfacegateway", false, 0, false),
    profile(200, "interfacegateway", false, 0, false),
    profile(250, "LowFreqSounder", false, 8, false),
    profile(255, "PadStrobe", false, 7, false),
];

/// Fault codes for each bit of a fault-detail word, by fault-detail type.
pub const FAULT_DETAILS_MAP: [[u8; FAULT_DETAIL_BITS]; FAULT_DETAIL_TYPES] = [
    [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [2, 4, 6, 8, 10, 14, 16, 18, 0, 19, 22, 25, 30, 0, 0, 0],
    [2, 4, 6, 8, 10, 14, 16, 18, 0, 19, 22, 25, 30, 0, 0, 0],
    [2, 4, 6, 8, 12, 14, 16, 18, 19, 22, 25, 28, 31, 33, 34, 36],
    [2, 4, 6, 8, 12, 14, 16, 18, 19, 22, 25, 28, 31, 33, 34, 36],
    [2, 4, 6, 8, 10, 14, 16, 18, 0, 19, 22, 25, 30, 32, 35, 37],
    [2, 4, 6, 8, 10, 14, 16, 18, 0, 19, 22, 25, 30, 32, 35, 37],
    [1, 3, 5, 7, 9, 13, 15, 17, 19, 23, 50, 29, 0, 0, 0, 38],
    [1, 3, 5, 7, 9, 13, 15, 17, 19, 23, 50, 29, 0, 0, 0, 38],
];

/// Device type for a model, falling back to the priority byte for unknown models.
///
/// Returns the type with [`WISAFE_TYPE_FLAG`] set and whether the model was recognised.
pub fn device_type_for(model: u16, priority: u8) -> (u32, bool) {
    let known = match model {
        743 => Some(134),
        785 => Some(129),
        888 => Some(65),
        907 => Some(255),
        930 => Some(250),
        1022 => Some(199),
        1052 => Some(200),
        1041 => Some(130),
        1044 => Some(135),
        1093 => Some(196),
        1148 => Some(129),
        1157 => Some(1),
        1219 => Some(250),
        _ => None,
    };
    let device_type = known.unwrap_or(priority);
    (u32::from(device_type) | WISAFE_TYPE_FLAG, known.is_some())
}

/// Profile for a device type (with or without [`WISAFE_TYPE_FLAG`]).
pub fn find_profile(device_type: u32) -> Option<&'static DeviceProfile> {
    let bare = device_type & !WISAFE_TYPE_FLAG;
    PROFILES.iter().find(|p| u32::from(p.device_type) == bare)
}

/// Fault code for bit `bit` of a fault-detail word; 0 if none.
pub fn fault_details_code(fault_details_type: u8, bit: usize) -> u8 {
    FAULT_DETAILS_MAP
        .get(fault_details_type as usize)
        .and_then(|row| row.get(bit))
        .copied()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_models() {
        assert_eq!(device_type_for(785, 0), (129 | WISAFE_TYPE_FLAG, true));
        assert_eq!(device_type_for(1157, 0), (1 | WISAFE_TYPE_FLAG, true));
    }

    #[test]
    fn test_unknown_model_uses_priority() {
        assert_eq!(device_type_for(4242, 0x81), (0x81 | WISAFE_TYPE_FLAG, false));
    }

    #[test]
    fn test_profile_lookup() {
        let smoke = find_profile(129 | WISAFE_TYPE_FLAG).expect("smoke");
        assert!(smoke.read_volts_on_fault);
        assert_eq!(smoke.fault_details_type, 1);
        assert!(find_profile(135).expect("heat").temperature_alarm);
        assert!(find_profile(42).is_none());
    }

    #[test]
    fn test_fault_details_codes() {
        assert_eq!(fault_details_code(1, 0), 2);
        assert_eq!(fault_details_code(1, 8), 0);
        assert_eq!(fault_details_code(7, 10), 50);
        assert_eq!(fault_details_code(9, 0), 0);
        assert_eq!(fault_details_code(3, 16), 0);
    }
}
