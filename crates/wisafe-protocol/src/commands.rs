//! Commands the gateway sends to the radio module.

use bytes::BufMut;
use wisafe_link::{Buffer, BufferPool};

use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};
use crate::types::*;

/// Outbound commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask for the current SID map.
    RequestSidMap,

    /// Replace the network's SID map.
    UpdateSidMap(SidMap),

    /// Press the radio module's learn button.
    LearnIn,

    /// Identify the gateway (reply to a status request).
    AlarmIdent {
        /// Gateway id.
        id: DeviceId,
        /// Gateway model.
        model: u16,
        /// Gateway priority.
        priority: u8,
        /// Identity flags.
        flags: u8,
        /// Firmware minor version.
        fw_minor: u8,
        /// Firmware major version.
        fw_major: u8,
    },

    /// Start a test on the network, attributed to `id`.
    DeviceTest {
        /// Originating device.
        id: DeviceId,
        /// Model of the originating device.
        model: u16,
        /// Priority of the originating device.
        priority: u8,
    },

    /// Read a device's battery voltage.
    ReadVolts {
        /// Target device.
        id: DeviceId,
        /// Target model.
        model: u16,
    },

    /// Read a device's raw temperature.
    ReadTemperature {
        /// Target device.
        id: DeviceId,
        /// Target model.
        model: u16,
    },

    /// Ask a device for its detailed fault word.
    RequestFaultDetails {
        /// Target device.
        id: DeviceId,
        /// Target model.
        model: u16,
    },

    /// Enable or mute a device's sounder.
    SounderEnable {
        /// Target device.
        id: DeviceId,
        /// True to enable, false to mute.
        enabled: bool,
    },

    /// Ask the radio module at `sid` for its status.
    RequestRemoteStatus {
        /// Target SID.
        sid: u8,
    },

    /// Ask the device at `sid` for its identity.
    RequestRemoteId {
        /// Target SID.
        sid: u8,
    },

    /// Make the device at `sid` identify itself.
    RumourTarget {
        /// Target SID.
        sid: u8,
    },

    /// Ask the local radio module for its diagnostics.
    RmDiagnosticRequest,

    /// Silence every sounding alarm.
    Hush,

    /// Locate the originating alarm.
    Locate,
}

impl Command {
    /// Command byte this encodes to.
    pub fn code(&self) -> u8 {
        match self {
            Command::RequestSidMap
            | Command::UpdateSidMap(_)
            | Command::LearnIn
            | Command::RequestRemoteStatus { .. }
            | Command::RequestRemoteId { .. }
            | Command::RumourTarget { .. } => CMD_EXTDIAG_REQ,
            Command::AlarmIdent { .. } => CMD_ALARM_IDENT,
            Command::DeviceTest { .. } => CMD_DEVICE_TESTED,
            Command::ReadVolts { .. } | Command::ReadTemperature { .. } => CMD_DO_EXTDIG_DATASLOT,
            Command::RequestFaultDetails { .. } => CMD_REQ_FAULT_DETAILS,
            Command::SounderEnable { .. } => CMD_NOTIFY_DEV_ID,
            Command::RmDiagnosticRequest => CMD_RM_DIAG_REQ,
            Command::Hush => CMD_HUSH,
            Command::Locate => CMD_LOCATE,
        }
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Command::RequestSidMap => 2,
            Command::UpdateSidMap(_) => 2 + SID_MAP_BYTES,
            Command::LearnIn => 3,
            Command::AlarmIdent { .. } => 10,
            Command::DeviceTest { .. } => 8,
            Command::ReadVolts { .. } | Command::ReadTemperature { .. } => 7,
            Command::RequestFaultDetails { .. } => 7,
            Command::SounderEnable { .. } => 9,
            Command::RequestRemoteStatus { .. } | Command::RequestRemoteId { .. } => 4,
            Command::RumourTarget { .. } => 3,
            Command::RmDiagnosticRequest => 1,
            Command::Hush => 5,
            Command::Locate => 6,
        }
    }

    /// Encode into the front of `out`, returning the number of bytes written.
    pub fn encode_into(&self, out: &mut [u8]) -> ProtocolResult<usize> {
        let needed = self.encoded_len();
        if out.len() < needed {
            return Err(ProtocolError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        let mut buf = &mut out[..needed];
        buf.put_u8(self.code());

        match self {
            Command::RequestSidMap => buf.put_u8(EXT_SID_MAP),

            Command::UpdateSidMap(map) => {
                buf.put_u8(EXT_SID_MAP_UPDATE);
                buf.put_slice(&map.to_bytes());
            }

            Command::LearnIn => {
                buf.put_u8(EXT_BUTTON_PRESS);
                buf.put_u8(BUTTON_LEARN);
            }

            Command::AlarmIdent {
                id,
                model,
                priority,
                flags,
                fw_minor,
                fw_major,
            } => {
                put_device_id(&mut buf, *id);
                buf.put_u16_le(*model);
                buf.put_u8(*priority);
                buf.put_u8(*flags);
                buf.put_u8(*fw_minor);
                buf.put_u8(*fw_major);
            }

            Command::DeviceTest {
                id,
                model,
                priority,
            } => {
                put_device_id(&mut buf, *id);
                buf.put_u8(*priority);
                buf.put_u8(0x01);
                buf.put_u16_le(*model);
            }

            Command::ReadVolts { id, model } | Command::ReadTemperature { id, model } => {
                put_device_id(&mut buf, *id);
                buf.put_u16_le(*model);
                buf.put_u8(DATASLOT_VARIABLE);
            }

            Command::RequestFaultDetails { id, model } => {
                put_device_id(&mut buf, *id);
                buf.put_u16_le(*model);
                buf.put_u8(0);
            }

            Command::SounderEnable { id, enabled } => {
                put_device_id(&mut buf, *id);
                buf.put_u8(if *enabled { SOUNDER_ENABLE } else { SOUNDER_DISABLE });
                buf.put_bytes(0, 4);
            }

            Command::RequestRemoteStatus { sid } => {
                buf.put_u8(EXT_REMOTE_STATUS);
                buf.put_u8(*sid);
                buf.put_u8(REMOTE_REQ_STATUS);
            }

            Command::RequestRemoteId { sid } => {
                buf.put_u8(EXT_REMOTE_STATUS);
                buf.put_u8(*sid);
                buf.put_u8(REMOTE_REQ_ID_DETAILS);
            }

            Command::RumourTarget { sid } => {
                buf.put_u8(EXT_RUMOUR_TARGET);
                buf.put_u8(*sid);
            }

            Command::RmDiagnosticRequest => {}

            Command::Hush => {
                buf.put_bytes(0, 3);
                buf.put_u8(GATEWAY_PRIORITY);
            }

            Command::Locate => {
                buf.put_bytes(0, 3);
                buf.put_u8(GATEWAY_PRIORITY);
                buf.put_u8(0);
            }
        }

        Ok(needed)
    }

    /// Encode into a pool buffer. Returns `None` if the pool is exhausted.
    pub fn encode(&self, pool: &BufferPool) -> Option<Buffer> {
        let mut buffer = pool.acquire()?;
        let len = self.encode_into(buffer.storage_mut()).ok()?;
        buffer.set_len(len);
        Some(buffer)
    }

    /// Encode into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.encoded_len()];
        // The vector is sized from encoded_len, so this cannot fail.
        let len = self.encode_into(&mut out).unwrap_or(0);
        out.truncate(len);
        out
    }

    /// The gateway's identity reply.
    pub fn gateway_ident() -> Self {
        Command::AlarmIdent {
            id: DeviceId::GATEWAY,
            model: GATEWAY_MODEL,
            priority: GATEWAY_PRIORITY,
            flags: IDENT_FLAG_CALIBRATED,
            fw_minor: GATEWAY_FW_MINOR,
            fw_major: GATEWAY_FW_MAJOR,
        }
    }
}

fn put_device_id(buf: &mut impl BufMut, id: DeviceId) {
    buf.put_slice(&id.to_le_bytes());
}
