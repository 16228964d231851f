//! The device shadow the gateway reports into.
//!
//! The shadow is owned by the platform: it stores, per device, the properties
//! the gateway reports and the properties the cloud desires. The gateway only
//! sees it through the [`Shadow`] trait. [`MemoryShadow`] is a complete
//! in-process implementation used by the binary and by tests.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use wisafe_protocol::DeviceId;

use crate::error::{ShadowError, ShadowResult};

// ============================================================================
// Property Names
// ============================================================================

/// Property names used by the gateway.
pub mod props {
    /// Device type (model-derived, with the WiSafe flag set).
    pub const TYPE: &str = "type";
    /// Manufacturer string.
    pub const MANUFACTURER: &str = "mfr";
    /// Model string.
    pub const MODEL: &str = "model";
    /// Online status, see [`Online`](super::Online).
    pub const ONLINE: &str = "onln";
    /// Radio module firmware revision string.
    pub const WISAFE_ID: &str = "wsid";
    /// Gateway state, see [`GatewayState`](super::GatewayState).
    pub const STATE: &str = "state";

    /// Gateway is joined to a network.
    pub const IN_NETWORK: &str = "netwk";
    /// SIDs in the network with no known device.
    pub const UNKNOWN_SIDS: &str = "unkn";
    /// Time of the last test button press (unix seconds).
    pub const TEST_TIMESTAMP: &str = "testb";
    /// Device SID.
    pub const SID: &str = "sid";
    /// Numeric model.
    pub const MODEL_VALUE: &str = "mdVal";
    /// Temperature at the time of the last alarm (hundredths of a degree).
    pub const ALARM_TEMPV: &str = "alarm_tempv";
    /// Alarm state.
    pub const ALARM_STATE: &str = "alarm_state";
    /// Battery voltage.
    pub const BATTERY_VOLTAGE: &str = "battv";
    /// Alarm sequence number.
    pub const ALARM_SEQ: &str = "alarm_seq";
    /// Temperature.
    pub const TEMPERATURE: &str = "tempv";
    /// Radio fault count.
    pub const RADIO_FAULT_COUNT: &str = "rdFlt";
    /// Last received signal strength.
    pub const RADIO_RSSI: &str = "rssi";
    /// Smoke-detector interface fault count.
    pub const RM_SD_FAULT: &str = "rmsdf";
    /// Last accepted message sequence number.
    pub const LAST_SEQUENCE: &str = "ltseq";
    /// Sounder muted.
    pub const MUTE: &str = "mute";
    /// Time of the last alarm.
    pub const ALARM_TIME: &str = "alarm_time";
    /// Device flagged missing by a SID map update.
    pub const DEVICE_MISSING: &str = "dvmis";
    /// Gateway is interrogating unknown SIDs.
    pub const INTERROGATING: &str = "dvint";
    /// Fault summary flag.
    pub const FAULT: &str = "flt";

    /// Command: run a missing-node test.
    pub const CMD_TEST_MODE: &str = "tstmd_trgrd";
    /// Command parameter: delete missing devices at the end of the test.
    pub const CMD_TEST_MODE_FLUSH: &str = "tstmd_flush";
    /// Result of the last missing-node test.
    pub const CMD_TEST_MODE_RESULT: &str = "tstmd_reslt";
    /// Command: enter or leave learn mode.
    pub const CMD_LEARN: &str = "learn_trgrd";
    /// Command parameter: learn mode timeout in seconds.
    pub const CMD_LEARN_TIMEOUT: &str = "learn_tmout";
    /// Command: leave the network.
    pub const CMD_FLUSH: &str = "flush_trgrd";
    /// Command: delete every device.
    pub const CMD_DELETE_ALL: &str = "rmall_trgrd";
    /// Command: sounder test.
    pub const CMD_SOUNDER_TEST: &str = "sntst_trgrd";
    /// Command: silence every alarm.
    pub const CMD_SILENCE_ALL: &str = "slall_trgrd";
    /// Command: locate the alarm.
    pub const CMD_LOCATE: &str = "lcdev_trgrd";
    /// Per-device command: identify this device.
    pub const CMD_IDENTIFY_DEVICE: &str = "iddev_trgrd";
    /// Per-device command: remove this device.
    pub const CMD_DEVICE_FLUSH: &str = "c_fld";

    /// Name of a per-fault-code property, e.g. `flt93_state`.
    pub fn fault(code: u8, suffix: &str) -> String {
        format!("{}{:02}_{}", FAULT, code, suffix)
    }
}

// ============================================================================
// Property Values
// ============================================================================

/// A property value as stored in the shadow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Integer value (also used for timestamps and enumerations).
    Integer(i64),
    /// Boolean value.
    Bool(bool),
    /// String value.
    String(String),
}

impl PropertyValue {
    /// Convert to i64 if possible.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert to u32 if possible.
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|v| u32::try_from(v).ok())
    }

    /// Convert to u8 if possible.
    pub fn as_u8(&self) -> Option<u8> {
        self.as_i64().and_then(|v| u8::try_from(v).ok())
    }

    /// Convert to bool if possible.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert to string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// Name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Integer(_) => "an integer",
            PropertyValue::Bool(_) => "a boolean",
            PropertyValue::String(_) => "a string",
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Integer(v) => write!(f, "{}", v),
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Integer(v)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::Integer(i64::from(v))
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Integer(i64::from(v))
    }
}

impl From<u8> for PropertyValue {
    fn from(v: u8) -> Self {
        PropertyValue::Integer(i64::from(v))
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

/// Online status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Online {
    /// Missing from the network.
    Offline = 0,
    /// Answered the last missing-node test.
    Online = 1,
    /// Not yet tested.
    Unknown = 2,
}

impl Online {
    /// Decode a stored value.
    pub fn from_value(value: &PropertyValue) -> Option<Self> {
        match value.as_i64()? {
            0 => Some(Online::Offline),
            1 => Some(Online::Online),
            2 => Some(Online::Unknown),
            _ => None,
        }
    }
}

impl From<Online> for PropertyValue {
    fn from(v: Online) -> Self {
        PropertyValue::Integer(v as i64)
    }
}

/// Gateway operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayState {
    /// Learn mode: accepting new devices.
    Learning = 2,
    /// Normal operation.
    Running = 3,
    /// A missing-node test was requested by the platform.
    TestMode = 4,
}

impl GatewayState {
    /// Decode a stored value.
    pub fn from_value(value: &PropertyValue) -> Option<Self> {
        match value.as_i64()? {
            2 => Some(GatewayState::Learning),
            3 => Some(GatewayState::Running),
            4 => Some(GatewayState::TestMode),
            _ => None,
        }
    }
}

impl From<GatewayState> for PropertyValue {
    fn from(v: GatewayState) -> Self {
        PropertyValue::Integer(v as i64)
    }
}

// ============================================================================
// Shadow Trait
// ============================================================================

/// Access to the platform's device shadow.
///
/// Every operation can fail; callers log the error and carry on.
pub trait Shadow {
    /// Create a record for `id` with the given type property.
    fn register_device(&mut self, id: DeviceId, device_type: u32) -> ShadowResult<()>;

    /// Remove the record for `id`.
    fn delete_device(&mut self, id: DeviceId) -> ShadowResult<()>;

    /// True if a record exists for `id`.
    fn is_registered(&self, id: DeviceId) -> bool;

    /// Every registered device, including the gateway.
    fn enumerate_devices(&self) -> ShadowResult<Vec<DeviceId>>;

    /// Read a reported property.
    fn get_reported(&self, id: DeviceId, name: &str) -> ShadowResult<PropertyValue>;

    /// Write a reported property, creating it if needed.
    fn set_reported(&mut self, id: DeviceId, name: &str, value: PropertyValue) -> ShadowResult<()>;

    /// Read a desired property.
    fn get_desired(&self, id: DeviceId, name: &str) -> ShadowResult<PropertyValue>;

    /// Write a desired property, creating it if needed.
    fn set_desired(&mut self, id: DeviceId, name: &str, value: PropertyValue) -> ShadowResult<()>;

    /// Remove a reported property.
    fn delete_property(&mut self, id: DeviceId, name: &str) -> ShadowResult<()>;

    /// Ask to be told when a desired property changes.
    fn subscribe_desired(&mut self, id: DeviceId, name: &str) -> ShadowResult<()>;

    /// Write several reported properties as one group.
    fn set_reported_group(
        &mut self,
        id: DeviceId,
        values: Vec<(String, PropertyValue)>,
    ) -> ShadowResult<()> {
        for (name, value) in values {
            self.set_reported(id, &name, value)?;
        }
        Ok(())
    }

    /// Increment an integer reported property, starting from zero.
    fn increment_reported(&mut self, id: DeviceId, name: &str) -> ShadowResult<i64> {
        let next = match self.get_reported(id, name) {
            Ok(value) => {
                value.as_i64().ok_or_else(|| ShadowError::TypeMismatch {
                    device: id,
                    name: name.to_string(),
                    expected: "an integer",
                })? + 1
            }
            Err(e) if e.is_not_found() && self.is_registered(id) => 1,
            Err(e) => return Err(e),
        };
        self.set_reported(id, name, PropertyValue::Integer(next))?;
        Ok(next)
    }

    /// The non-gateway device whose reported SID is `sid`.
    fn device_for_sid(&self, sid: u8) -> Option<DeviceId> {
        self.enumerate_devices()
            .ok()?
            .into_iter()
            .filter(|id| !id.is_gateway())
            .find(|&id| {
                self.get_reported(id, props::SID)
                    .ok()
                    .and_then(|v| v.as_u8())
                    == Some(sid)
            })
    }
}

// ============================================================================
// In-memory Shadow
// ============================================================================

/// Default maximum number of mesh devices, plus one for the gateway.
pub const DEFAULT_MAX_DEVICES: usize = 64 + 1;

#[derive(Debug, Clone, Default)]
struct DeviceRecord {
    reported: BTreeMap<String, PropertyValue>,
    desired: BTreeMap<String, PropertyValue>,
    subscriptions: BTreeSet<String>,
}

/// A [`Shadow`] held in memory.
#[derive(Debug, Clone)]
pub struct MemoryShadow {
    devices: BTreeMap<DeviceId, DeviceRecord>,
    max_devices: usize,
}

impl Default for MemoryShadow {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryShadow {
    /// Create an empty shadow.
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            max_devices: DEFAULT_MAX_DEVICES,
        }
    }

    /// Limit the number of records.
    pub fn with_max_devices(mut self, max_devices: usize) -> Self {
        self.max_devices = max_devices;
        self
    }

    /// Number of registered devices, including the gateway.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// True if `id` has subscribed to desired changes of `name`.
    pub fn is_subscribed(&self, id: DeviceId, name: &str) -> bool {
        self.devices
            .get(&id)
            .is_some_and(|d| d.subscriptions.contains(name))
    }

    /// All reported properties of `id`.
    pub fn reported(&self, id: DeviceId) -> Option<&BTreeMap<String, PropertyValue>> {
        self.devices.get(&id).map(|d| &d.reported)
    }

    fn record(&self, id: DeviceId) -> ShadowResult<&DeviceRecord> {
        self.devices.get(&id).ok_or(ShadowError::DeviceNotFound(id))
    }

    fn record_mut(&mut self, id: DeviceId) -> ShadowResult<&mut DeviceRecord> {
        self.devices
            .get_mut(&id)
            .ok_or(ShadowError::DeviceNotFound(id))
    }
}

impl Shadow for MemoryShadow {
    fn register_device(&mut self, id: DeviceId, device_type: u32) -> ShadowResult<()> {
        if !self.devices.contains_key(&id) && self.devices.len() >= self.max_devices {
            return Err(ShadowError::StoreFull(self.max_devices));
        }
        let record = self.devices.entry(id).or_default();
        record
            .reported
            .insert(props::TYPE.to_string(), PropertyValue::from(device_type));
        debug!("Shadow: registered device {} type {:#x}", id, device_type);
        Ok(())
    }

    fn delete_device(&mut self, id: DeviceId) -> ShadowResult<()> {
        self.devices
            .remove(&id)
            .map(|_| debug!("Shadow: deleted device {}", id))
            .ok_or(ShadowError::DeviceNotFound(id))
    }

    fn is_registered(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }

    fn enumerate_devices(&self) -> ShadowResult<Vec<DeviceId>> {
        Ok(self.devices.keys().copied().collect())
    }

    fn get_reported(&self, id: DeviceId, name: &str) -> ShadowResult<PropertyValue> {
        self.record(id)?
            .reported
            .get(name)
            .cloned()
            .ok_or_else(|| ShadowError::PropertyNotFound {
                device: id,
                name: name.to_string(),
            })
    }

    fn set_reported(&mut self, id: DeviceId, name: &str, value: PropertyValue) -> ShadowResult<()> {
        trace!("Shadow: {} reported {} = {}", id, name, value);
        self.record_mut(id)?.reported.insert(name.to_string(), value);
        Ok(())
    }

    fn get_desired(&self, id: DeviceId, name: &str) -> ShadowResult<PropertyValue> {
        self.record(id)?
            .desired
            .get(name)
            .cloned()
            .ok_or_else(|| ShadowError::PropertyNotFound {
                device: id,
                name: name.to_string(),
            })
    }

    fn set_desired(&mut self, id: DeviceId, name: &str, value: PropertyValue) -> ShadowResult<()> {
        trace!("Shadow: {} desired {} = {}", id, name, value);
        self.record_mut(id)?.desired.insert(name.to_string(), value);
        Ok(())
    }

    fn delete_property(&mut self, id: DeviceId, name: &str) -> ShadowResult<()> {
        self.record_mut(id)?
            .reported
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ShadowError::PropertyNotFound {
                device: id,
                name: name.to_string(),
            })
    }

    fn subscribe_desired(&mut self, id: DeviceId, name: &str) -> ShadowResult<()> {
        self.record_mut(id)?.subscriptions.insert(name.to_string());
        Ok(())
    }
}
