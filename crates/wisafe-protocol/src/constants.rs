//! Protocol constants
//!
//! Command bytes, extended-diagnostic sub-opcodes, fixed frame lengths and the
//! identity the gateway presents to the mesh.

// ============================================================================
// Command Codes
// ============================================================================

/// Radio module asks the gateway to identify itself.
pub const CMD_STATUS: u8 = 0x41;
/// Positive acknowledgement.
pub const CMD_ACK: u8 = 0x46;
/// Negative acknowledgement.
pub const CMD_NACK: u8 = 0x47;
/// Alarm raised by a device.
pub const CMD_ALARM: u8 = 0x50;
/// Alarm cleared by a device.
pub const CMD_ALARM_STOP: u8 = 0x51;
/// Network-wide silence (inbound report and outbound request).
pub const CMD_HUSH: u8 = 0x52;
/// Locate the originating alarm (inbound report and outbound request).
pub const CMD_LOCATE: u8 = 0x53;
/// Device test button pressed (inbound) or test request (outbound).
pub const CMD_DEVICE_TESTED: u8 = 0x70;
/// Device fault flags.
pub const CMD_FAULT: u8 = 0x71;
/// Detailed fault word.
pub const CMD_FAULT_DETAILS: u8 = 0x72;
/// Request the detailed fault word.
pub const CMD_REQ_FAULT_DETAILS: u8 = 0x73;
/// Gateway identity (reply to [`CMD_STATUS`]).
pub const CMD_ALARM_IDENT: u8 = 0x91;
/// Per-device notification, used to enable or mute a sounder.
pub const CMD_NOTIFY_DEV_ID: u8 = 0x92;
/// Read a device data slot.
pub const CMD_DO_EXTDIG_DATASLOT: u8 = 0xc1;
/// Data slot value.
pub const CMD_EXTDIG_DATASLOT_RESULT: u8 = 0xc2;
/// Ask a device for its identity.
pub const CMD_DO_EXTDIG_ID: u8 = 0xc3;
/// Device identity.
pub const CMD_DO_EXTDIG_ID_RESULT: u8 = 0xc4;
/// Request the radio module's own diagnostics.
pub const CMD_RM_DIAG_REQ: u8 = 0xd1;
/// Radio module diagnostics.
pub const CMD_RM_DIAG_RESULT: u8 = 0xd2;
/// Extended-diagnostic request (sub-opcode in byte 1).
pub const CMD_EXTDIAG_REQ: u8 = 0xd3;
/// Extended-diagnostic response (sub-opcode in byte 1).
pub const CMD_EXTDIAG_RESP: u8 = 0xd4;
/// Radio module reports a fault on its smoke detector interface.
pub const CMD_RM_SD_FAULT: u8 = 0xd5;

// ============================================================================
// Extended-Diagnostic Sub-opcodes
// ============================================================================

/// Missing-node report.
pub const EXT_MISSING_NODES: u8 = 0x01;
/// Current SID map.
pub const EXT_SID_MAP: u8 = 0x03;
/// SID map update (request and acknowledgement).
pub const EXT_SID_MAP_UPDATE: u8 = 0x04;
/// Remote radio module status.
pub const EXT_REMOTE_STATUS: u8 = 0x06;
/// Remote identity report.
pub const EXT_REMOTE_ID: u8 = 0x09;
/// Simulated learn-in button press.
pub const EXT_BUTTON_PRESS: u8 = 0x12;
/// Rumour target (identify a device by its SID).
pub const EXT_RUMOUR_TARGET: u8 = 0x1a;

/// Remote status request type: radio module status.
pub const REMOTE_REQ_STATUS: u8 = 0x00;
/// Remote status request type: identity details.
pub const REMOTE_REQ_ID_DETAILS: u8 = 0x01;

/// Button press code for learn-in.
pub const BUTTON_LEARN: u8 = 0x01;

/// Data slot holding battery voltage or raw temperature.
pub const DATASLOT_VARIABLE: u8 = 0x06;

/// Sounder notification: enable.
pub const SOUNDER_ENABLE: u8 = 0x01;
/// Sounder notification: mute.
pub const SOUNDER_DISABLE: u8 = 0x02;

// ============================================================================
// Gateway Identity
// ============================================================================

/// Device id the gateway uses for itself.
pub const GATEWAY_DEVICE_ID: u32 = 0x00ff_ffff;
/// Gateway model code.
pub const GATEWAY_MODEL: u16 = 0x0506;
/// Gateway priority byte.
pub const GATEWAY_PRIORITY: u8 = 0xc9;
/// Gateway firmware major version.
pub const GATEWAY_FW_MAJOR: u8 = 9;
/// Gateway firmware minor version.
pub const GATEWAY_FW_MINOR: u8 = 10;
/// Alarm-ident flag: gateway is calibrated.
pub const IDENT_FLAG_CALIBRATED: u8 = 0x01;
/// SID reported before the radio module has told us ours.
pub const GATEWAY_SID_UNLEARNT: u8 = 64;

// ============================================================================
// Sizes
// ============================================================================

/// Number of SID slots in the network.
pub const SID_COUNT: usize = 64;
/// Bytes in an on-wire SID map.
pub const SID_MAP_BYTES: usize = 8;
/// Bytes in an on-wire device id.
pub const DEVICE_ID_BYTES: usize = 3;

/// Inbound frame lengths.
pub mod frame_len {
    /// `[D4, 03, map×8]`
    pub const SID_MAP: usize = 10;
    /// `[D4, 04, map×8]`
    pub const SID_MAP_UPDATE: usize = 10;
    /// `[D4, 01, count, map×8]`
    pub const MISSING_NODES: usize = 11;
    /// `[D4, 06, sid, ...]`
    pub const REMOTE_STATUS: usize = 13;
    /// `[D4, 1a, sid, reasons×2]`
    pub const RUMOUR_TARGET: usize = 5;
    /// Device tested report.
    pub const DEVICE_TESTED: usize = 10;
    /// Remote identity result.
    pub const REMOTE_ID_RESULT: usize = 9;
    /// Fault report.
    pub const FAULT: usize = 9;
    /// Alarm report.
    pub const ALARM: usize = 8;
    /// Data slot result.
    pub const DATASLOT_RESULT: usize = 11;
    /// Fault details report.
    pub const FAULT_DETAILS: usize = 10;
    /// Alarm stop report.
    pub const ALARM_STOP: usize = 7;
    /// Hush report.
    pub const HUSH: usize = 7;
    /// Locate report.
    pub const LOCATE: usize = 8;
    /// Radio module diagnostics.
    pub const RM_DIAG: usize = 13;
    /// Radio module SD fault.
    pub const RM_SD_FAULT: usize = 7;
}

/// Short name for a command byte, for logs and metric labels.
pub fn command_name(code: u8) -> &'static str {
    match code {
        CMD_STATUS => "status",
        CMD_ACK => "ack",
        CMD_NACK => "nack",
        CMD_ALARM => "alarm",
        CMD_ALARM_STOP => "alarm_stop",
        CMD_HUSH => "hush",
        CMD_LOCATE => "locate",
        CMD_DEVICE_TESTED => "device_tested",
        CMD_FAULT => "fault",
        CMD_FAULT_DETAILS => "fault_details",
        CMD_REQ_FAULT_DETAILS => "req_fault_details",
        CMD_ALARM_IDENT => "alarm_ident",
        CMD_NOTIFY_DEV_ID => "notify_dev_id",
        CMD_DO_EXTDIG_DATASLOT => "dataslot_req",
        CMD_EXTDIG_DATASLOT_RESULT => "dataslot_result",
        CMD_DO_EXTDIG_ID => "id_req",
        CMD_DO_EXTDIG_ID_RESULT => "id_result",
        CMD_RM_DIAG_REQ => "rm_diag_req",
        CMD_RM_DIAG_RESULT => "rm_diag_result",
        CMD_EXTDIAG_REQ => "extdiag_req",
        CMD_EXTDIAG_RESP => "extdiag_resp",
        CMD_RM_SD_FAULT => "rm_sd_fault",
        _ => "unknown",
    }
}
