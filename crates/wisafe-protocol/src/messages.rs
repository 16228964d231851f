//! Messages received from the radio module.
//!
//! Every inbound layout has a fixed length. [`Message::decode`] checks it
//! exactly before reading any field, so a short or padded frame is rejected
//! rather than partially read.

use bytes::Buf;

use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};
use crate::types::*;

/// A device's test button was pressed (or a remote identity was reported).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTested {
    /// Reporting device.
    pub id: DeviceId,
    /// Device priority, used as a type fallback.
    pub priority: u8,
    /// Device status byte.
    pub status: u8,
    /// Device model.
    pub model: u16,
    /// Device SID.
    pub sid: u8,
    /// Sequence number.
    pub seq: u8,
}

/// Fault flags from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultReport {
    /// Reporting device.
    pub id: DeviceId,
    /// Device model.
    pub model: u16,
    /// Fault flag bits, see [`FaultFlag`].
    pub flags: u8,
    /// Device SID.
    pub sid: u8,
    /// Sequence number.
    pub seq: u8,
}

/// An alarm from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmReport {
    /// Reporting device.
    pub id: DeviceId,
    /// Device priority.
    pub priority: u8,
    /// Alarm status code.
    pub status: u8,
    /// Device SID.
    pub sid: u8,
    /// Sequence number.
    pub seq: u8,
}

/// A data slot value read from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableReport {
    /// Reporting device.
    pub id: DeviceId,
    /// Slot that was read.
    pub slot: u8,
    /// Slot value (millivolts or raw temperature).
    pub value: u16,
    /// Device SID.
    pub sid: u8,
    /// Sequence number.
    pub seq: u8,
}

/// A detailed fault word from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultDetailReport {
    /// Reporting device.
    pub id: DeviceId,
    /// Device model.
    pub model: u16,
    /// One bit per detailed fault.
    pub faults: u16,
    /// Device SID.
    pub sid: u8,
    /// Sequence number.
    pub seq: u8,
}

/// Alarm-stop or hush from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEvent {
    /// Reporting device.
    pub id: DeviceId,
    /// Device priority.
    pub priority: u8,
    /// Device SID.
    pub sid: u8,
    /// Sequence number.
    pub seq: u8,
}

/// A locate from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocateReport {
    /// Reporting device.
    pub id: DeviceId,
    /// Device priority.
    pub priority: u8,
    /// Whether the reporter originated the alarm.
    pub originating: u8,
    /// Device SID.
    pub sid: u8,
    /// Sequence number.
    pub seq: u8,
}

/// Radio module health, local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioStatus {
    /// SID of the reporting radio module.
    pub sid: u8,
    /// Battery voltage without load.
    pub volts_no_load: u8,
    /// Battery voltage under load.
    pub volts_load: u8,
    /// Secondary battery voltage.
    pub volts_secondary: u8,
    /// Last received signal strength.
    pub rssi: u8,
    /// Firmware revision.
    pub fw_rev: u8,
    /// Device the radio module belongs to.
    pub id: DeviceId,
    /// Critical fault flags.
    pub critical: u8,
    /// Radio fault count.
    pub radio_faults: u8,
}

/// A radio-module smoke-detector interface fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmSdFault {
    /// Reporting device.
    pub id: DeviceId,
    /// Device model.
    pub model: u16,
    /// Device SID.
    pub sid: u8,
}

/// Messages received from the radio module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Acknowledgement.
    Ack,
    /// Negative acknowledgement.
    Nack,
    /// The radio module wants the gateway's identity.
    StatusRequest,
    /// Current SID map.
    SidMap(SidMap),
    /// SIDs that did not answer a probe.
    MissingNodes(SidMap),
    /// SID map update acknowledgement.
    SidMapUpdate(SidMap),
    /// Remote radio module status.
    RemoteStatus(RadioStatus),
    /// Remote identity report (not acted upon).
    RemoteIdReport,
    /// Rumour target acknowledgement.
    RumourTarget {
        /// Target SID.
        sid: u8,
        /// Reason bits.
        reasons: u16,
    },
    /// Device test button pressed.
    DeviceTested(DeviceTested),
    /// Device identity, in reply to a remote-id request.
    RemoteId(DeviceTested),
    /// Device fault flags.
    Fault(FaultReport),
    /// Device alarm.
    Alarm(AlarmReport),
    /// Data slot value.
    Variable(VariableReport),
    /// Detailed fault word.
    FaultDetails(FaultDetailReport),
    /// Alarm cleared.
    AlarmStop(DeviceEvent),
    /// Alarm silenced.
    Hush(DeviceEvent),
    /// Locate.
    Locate(LocateReport),
    /// Local radio module diagnostics.
    RmDiagnostic(RadioStatus),
    /// Smoke-detector interface fault.
    RmSdFault(RmSdFault),
}

impl Message {
    /// Decode a message from an unescaped frame.
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        let (&code, body) = frame.split_first().ok_or(ProtocolError::Empty)?;

        match code {
            CMD_ACK => Ok(Message::Ack),
            CMD_NACK => Ok(Message::Nack),
            CMD_STATUS => Ok(Message::StatusRequest),
            CMD_EXTDIAG_RESP => decode_ext_diag(frame),

            CMD_DEVICE_TESTED => {
                expect_len(frame, frame_len::DEVICE_TESTED)?;
                let mut buf = body;
                Ok(Message::DeviceTested(DeviceTested {
                    id: get_device_id(&mut buf),
                    priority: buf.get_u8(),
                    status: buf.get_u8(),
                    model: buf.get_u16_le(),
                    sid: buf.get_u8(),
                    seq: buf.get_u8(),
                }))
            }

            CMD_DO_EXTDIG_ID_RESULT => {
                expect_len(frame, frame_len::REMOTE_ID_RESULT)?;
                let mut buf = body;
                Ok(Message::RemoteId(DeviceTested {
                    id: get_device_id(&mut buf),
                    priority: buf.get_u8(),
                    status: 0,
                    model: buf.get_u16_le(),
                    sid: buf.get_u8(),
                    seq: buf.get_u8(),
                }))
            }

            CMD_FAULT => {
                expect_len(frame, frame_len::FAULT)?;
                let mut buf = body;
                Ok(Message::Fault(FaultReport {
                    id: get_device_id(&mut buf),
                    model: buf.get_u16_le(),
                    flags: buf.get_u8(),
                    sid: buf.get_u8(),
                    seq: buf.get_u8(),
                }))
            }

            CMD_ALARM => {
                expect_len(frame, frame_len::ALARM)?;
                let mut buf = body;
                Ok(Message::Alarm(AlarmReport {
                    id: get_device_id(&mut buf),
                    priority: buf.get_u8(),
                    status: buf.get_u8(),
                    sid: buf.get_u8(),
                    seq: buf.get_u8(),
                }))
            }

            CMD_EXTDIG_DATASLOT_RESULT => {
                expect_len(frame, frame_len::DATASLOT_RESULT)?;
                let mut buf = body;
                let id = get_device_id(&mut buf);
                let slot = buf.get_u8();
                let value = buf.get_u16_le();
                buf.advance(2);
                Ok(Message::Variable(VariableReport {
                    id,
                    slot,
                    value,
                    sid: buf.get_u8(),
                    seq: buf.get_u8(),
                }))
            }

            CMD_FAULT_DETAILS => {
                expect_len(frame, frame_len::FAULT_DETAILS)?;
                let mut buf = body;
                Ok(Message::FaultDetails(FaultDetailReport {
                    id: get_device_id(&mut buf),
                    model: buf.get_u16_le(),
                    faults: buf.get_u16_le(),
                    sid: buf.get_u8(),
                    seq: buf.get_u8(),
                }))
            }

            CMD_ALARM_STOP | CMD_HUSH => {
                expect_len(frame, frame_len::ALARM_STOP)?;
                let mut buf = body;
                let event = DeviceEvent {
                    id: get_device_id(&mut buf),
                    priority: buf.get_u8(),
                    sid: buf.get_u8(),
                    seq: buf.get_u8(),
                };
                Ok(if code == CMD_HUSH {
                    Message::Hush(event)
                } else {
                    Message::AlarmStop(event)
                })
            }

            CMD_LOCATE => {
                expect_len(frame, frame_len::LOCATE)?;
                let mut buf = body;
                Ok(Message::Locate(LocateReport {
                    id: get_device_id(&mut buf),
                    priority: buf.get_u8(),
                    originating: buf.get_u8(),
                    sid: buf.get_u8(),
                    seq: buf.get_u8(),
                }))
            }

            CMD_RM_DIAG_RESULT => {
                expect_len(frame, frame_len::RM_DIAG)?;
                let mut buf = body;
                let volts_no_load = buf.get_u8();
                let volts_load = buf.get_u8();
                let volts_secondary = buf.get_u8();
                let rssi = buf.get_u8();
                let fw_rev = buf.get_u8();
                let id = get_device_id(&mut buf);
                let critical = buf.get_u8();
                let radio_faults = buf.get_u8();
                Ok(Message::RmDiagnostic(RadioStatus {
                    sid: buf.get_u8(),
                    volts_no_load,
                    volts_load,
                    volts_secondary,
                    rssi,
                    fw_rev,
                    id,
                    critical,
                    radio_faults,
                }))
            }

            CMD_RM_SD_FAULT => {
                expect_len(frame, frame_len::RM_SD_FAULT)?;
                let mut buf = body;
                Ok(Message::RmSdFault(RmSdFault {
                    id: get_device_id(&mut buf),
                    model: buf.get_u16_le(),
                    sid: buf.get_u8(),
                }))
            }

            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    /// The device and sequence number, for messages that carry one.
    pub fn sequence(&self) -> Option<(DeviceId, u8)> {
        match self {
            Message::DeviceTested(m) => Some((m.id, m.seq)),
            Message::Fault(m) => Some((m.id, m.seq)),
            Message::Alarm(m) => Some((m.id, m.seq)),
            Message::Variable(m) => Some((m.id, m.seq)),
            Message::FaultDetails(m) => Some((m.id, m.seq)),
            Message::AlarmStop(m) | Message::Hush(m) => Some((m.id, m.seq)),
            Message::Locate(m) => Some((m.id, m.seq)),
            _ => None,
        }
    }
}

fn decode_ext_diag(frame: &[u8]) -> ProtocolResult<Message> {
    let sub = *frame.get(1).ok_or(ProtocolError::LengthMismatch {
        command: CMD_EXTDIAG_RESP,
        expected: 2,
        actual: frame.len(),
    })?;

    match sub {
        EXT_SID_MAP => {
            expect_len(frame, frame_len::SID_MAP)?;
            Ok(Message::SidMap(sid_map_at(frame, 2)))
        }
        EXT_MISSING_NODES => {
            expect_len(frame, frame_len::MISSING_NODES)?;
            Ok(Message::MissingNodes(sid_map_at(frame, 3)))
        }
        EXT_SID_MAP_UPDATE => {
            expect_len(frame, frame_len::SID_MAP_UPDATE)?;
            Ok(Message::SidMapUpdate(sid_map_at(frame, 2)))
        }
        EXT_REMOTE_STATUS => {
            expect_len(frame, frame_len::REMOTE_STATUS)?;
            let mut buf = &frame[2..];
            Ok(Message::RemoteStatus(RadioStatus {
                sid: buf.get_u8(),
                volts_no_load: buf.get_u8(),
                volts_load: buf.get_u8(),
                volts_secondary: buf.get_u8(),
                rssi: buf.get_u8(),
                fw_rev: buf.get_u8(),
                id: get_device_id(&mut buf),
                critical: buf.get_u8(),
                radio_faults: buf.get_u8(),
            }))
        }
        EXT_REMOTE_ID => Ok(Message::RemoteIdReport),
        EXT_RUMOUR_TARGET => {
            expect_len(frame, frame_len::RUMOUR_TARGET)?;
            let mut buf = &frame[2..];
            Ok(Message::RumourTarget {
                sid: buf.get_u8(),
                reasons: buf.get_u16(),
            })
        }
        other => Err(ProtocolError::UnknownSubcommand(other)),
    }
}

fn expect_len(frame: &[u8], expected: usize) -> ProtocolResult<()> {
    if frame.len() == expected {
        Ok(())
    } else {
        Err(ProtocolError::LengthMismatch {
            command: frame.first().copied().unwrap_or_default(),
            expected,
            actual: frame.len(),
        })
    }
}

fn get_device_id(buf: &mut &[u8]) -> DeviceId {
    DeviceId::new(buf.get_uint_le(DEVICE_ID_BYTES) as u32)
}

/// Callers have checked the frame length covers `offset + 8`.
fn sid_map_at(frame: &[u8], offset: usize) -> SidMap {
    SidMap::from_slice(&frame[offset..offset + SID_MAP_BYTES]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_device_tested() {
        let frame = [0x70, 0x01, 0x02, 0x03, 0x81, 0x00, 0x02, 0x01, 0x05, 0x09];
        let Message::DeviceTested(m) = Message::decode(&frame).expect("decode") else {
            panic!("wrong variant");
        };
        assert_eq!(m.id, DeviceId::new(0x030201));
        assert_eq!(m.priority, 0x81);
        assert_eq!(m.model, 0x0102);
        assert_eq!(m.sid, 5);
        assert_eq!(m.seq, 9);
    }

    #[test]
    fn test_decode_length_checked() {
        let frame = [0x70, 0x01, 0x02, 0x03, 0x81, 0x00, 0x02, 0x01, 0x05];
        assert_eq!(
            Message::decode(&frame),
            Err(ProtocolError::LengthMismatch {
                command: 0x70,
                expected: 10,
                actual: 9
            })
        );

        let padded = [0x50, 1, 2, 3, 4, 5, 6, 7, 8];
        assert!(matches!(
            Message::decode(&padded),
            Err(ProtocolError::LengthMismatch { expected: 8, .. })
        ));
    }

    #[test]
    fn test_decode_empty_and_unknown() {
        assert_eq!(Message::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(
            Message::decode(&[0x99, 0x00]),
            Err(ProtocolError::UnknownCommand(0x99))
        );
        assert_eq!(
            Message::decode(&[0xd4, 0x7f]),
            Err(ProtocolError::UnknownSubcommand(0x7f))
        );
        assert!(matches!(
            Message::decode(&[0xd4]),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_sid_maps() {
        let frame = [0xd4, 0x03, 0x21, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            Message::decode(&frame),
            Ok(Message::SidMap(SidMap::from_iter([0, 5])))
        );

        let missing = [0xd4, 0x01, 0x01, 0x20, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            Message::decode(&missing),
            Ok(Message::MissingNodes(SidMap::from_iter([5])))
        );
    }

    #[test]
    fn test_decode_dataslot_result() {
        let frame = [0xc2, 0x01, 0x02, 0x03, 0x06, 0xb8, 0x0b, 0x00, 0x00, 0x04, 0x11];
        let Message::Variable(m) = Message::decode(&frame).expect("decode") else {
            panic!("wrong variant");
        };
        assert_eq!(m.value, 3000);
        assert_eq!(m.slot, 0x06);
        assert_eq!(m.sid, 4);
        assert_eq!(m.seq, 0x11);
    }

    #[test]
    fn test_decode_rm_diagnostic() {
        let frame = [0xd2, 30, 29, 28, 0xc0, 7, 0x01, 0x02, 0x03, 0x00, 2, 12, 0];
        let Message::RmDiagnostic(m) = Message::decode(&frame).expect("decode") else {
            panic!("wrong variant");
        };
        assert_eq!(m.sid, 12);
        assert_eq!(m.rssi, 0xc0);
        assert_eq!(m.radio_faults, 2);
        assert_eq!(m.id, DeviceId::new(0x030201));
    }

    #[test]
    fn test_decode_rumour_target_big_endian() {
        assert_eq!(
            Message::decode(&[0xd4, 0x1a, 9, 0x01, 0x02]),
            Ok(Message::RumourTarget {
                sid: 9,
                reasons: 0x0102
            })
        );
    }

    #[test]
    fn test_sequence_only_on_device_messages() {
        let alarm = Message::decode(&[0x50, 1, 0, 0, 0x81, 3, 4, 0x22]).expect("decode");
        assert_eq!(alarm.sequence(), Some((DeviceId::new(1), 0x22)));
        assert_eq!(Message::Ack.sequence(), None);
    }
}
