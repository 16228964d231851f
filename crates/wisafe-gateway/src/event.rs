//! Turns fault and alarm reports into shadow properties.
//!
//! Some reports need a follow-up read before they can be reported:
//!
//! - battery fault on a device that reads its voltage: [`Command::ReadVolts`]
//! - general fault on a device with fault-detail words: [`Command::RequestFaultDetails`]
//! - alarm on a device that reads its temperature: [`Command::ReadTemperature`]
//!
//! The report frame is parked in a pool slot while the follow-up is
//! outstanding. Each device has at most one pending fault and one pending
//! alarm, and each pending record has a timeout after which the event is
//! reported without the extra data.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};
use wisafe_link::{dump, Buffer, SlotUse};
use wisafe_metrics::metric_defs;
use wisafe_protocol::{
    AlarmReport, Command, DeviceEvent, DeviceId, FaultDetailReport, FaultFlag, FaultReport,
    LocateReport, Message, RadioStatus, RmSdFault, VariableReport,
};

use crate::config::EventConfig;
use crate::context::Context;
use crate::profile::{fault_details_code, find_profile, DeviceProfile, FAULT_DETAIL_BITS};
use crate::shadow::{props, PropertyValue, Shadow};
use crate::timer::{TimerHandle, TimerKind};

/// Alarm state: not in alarm.
pub const ALARM_INACTIVE: u32 = 0;
/// Alarm state: sounding, not silenced.
pub const ALARM_ACTIVE: u32 = 1;
/// Alarm state: sounding but silenced.
pub const ALARM_SILENCED: u32 = 2;

/// Fault code for a device that is not calibrated.
pub const FAULT_CALIBRATION: u8 = 90;
/// Fault code for a general fault without details.
pub const FAULT_GENERAL: u8 = 91;
/// Fault code for a device removed from its base.
pub const FAULT_OFF_BASE: u8 = 92;
/// Fault code for a low detector battery.
pub const FAULT_SD_BATTERY: u8 = 93;
/// Fault code for mains failure.
pub const FAULT_AC: u8 = 94;
/// Fault code for a low radio module battery.
pub const FAULT_RM_BATTERY: u8 = 95;

/// Alarm state for each alarm status byte.
const ALARM_STATE_MAP: [u32; 22] = [
    1, 2, 3, 1, 4, 5, 1, 1, 6, 7, 1, 1, 8, 9, 1, 1, 10, 11, 1, 1, 12, 13,
];

/// Alarm state reported for an alarm status byte.
pub fn alarm_state_for(status: u8) -> u32 {
    match ALARM_STATE_MAP.get(status as usize) {
        Some(&state) => state,
        None => {
            warn!("Alarm status {} out of range, reporting active", status);
            ALARM_ACTIVE
        }
    }
}

/// Temperature in hundredths of a degree for a raw sensor reading,
/// truncated toward zero.
pub fn temperature_centi(raw: u16) -> i32 {
    ((79.9 - 0.096 * f64::from(raw)) * 100.0) as i32
}

/// What a pending fault is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// A battery voltage reading.
    Volts,
    /// A detailed fault word.
    FaultDetails,
}

#[derive(Debug)]
struct PendingFault {
    frame: Buffer,
    awaiting: FollowUp,
    timer: TimerHandle,
}

#[derive(Debug)]
struct PendingAlarm {
    frame: Buffer,
    timer: TimerHandle,
}

/// Pending fault and alarm records, keyed by device.
#[derive(Debug)]
pub struct EventCorrelator {
    config: EventConfig,
    faults: HashMap<DeviceId, PendingFault>,
    alarms: HashMap<DeviceId, PendingAlarm>,
}

impl EventCorrelator {
    /// Create with nothing pending.
    pub fn new(config: EventConfig) -> Self {
        Self {
            config,
            faults: HashMap::new(),
            alarms: HashMap::new(),
        }
    }

    /// Number of pending faults.
    pub fn pending_faults(&self) -> usize {
        self.faults.len()
    }

    /// Number of pending alarms.
    pub fn pending_alarms(&self) -> usize {
        self.alarms.len()
    }

    /// What the pending fault for `id` is waiting for, if any.
    pub fn pending_fault(&self, id: DeviceId) -> Option<FollowUp> {
        self.faults.get(&id).map(|p| p.awaiting)
    }

    /// True if an alarm for `id` is waiting for its temperature.
    pub fn has_pending_alarm(&self, id: DeviceId) -> bool {
        self.alarms.contains_key(&id)
    }

    // ------------------------------------------------------------------
    // Faults
    // ------------------------------------------------------------------

    /// A fault report. `frame` is the decoded frame the report came from.
    pub fn fault<S: Shadow>(&mut self, ctx: &mut Context<S>, report: &FaultReport, frame: &[u8]) {
        let id = report.id;
        let profile = profile_of(ctx, id);
        let details_type = profile.map_or(0, |p| p.fault_details_type);

        for flag in FaultFlag::ALL {
            let set = flag.is_set(report.flags);
            match flag {
                FaultFlag::Calibrated => {
                    send_fault_event(ctx, id, flag.is_fault(report.flags), FAULT_CALIBRATION, None)
                }
                FaultFlag::OnBase => {
                    send_fault_event(ctx, id, flag.is_fault(report.flags), FAULT_OFF_BASE, None)
                }
                FaultFlag::AcFailed => send_fault_event(ctx, id, set, FAULT_AC, None),
                FaultFlag::RmBattery => send_fault_event(ctx, id, set, FAULT_RM_BATTERY, None),
                FaultFlag::Faulty if details_type != 0 => {
                    if set {
                        let request = Command::RequestFaultDetails {
                            id,
                            model: report.model,
                        };
                        if !self.begin_fault(ctx, id, frame, FollowUp::FaultDetails, &request) {
                            send_fault_event(ctx, id, true, FAULT_GENERAL, None);
                        }
                    } else {
                        for bit in 0..FAULT_DETAIL_BITS {
                            let code = fault_details_code(details_type, bit);
                            if code != 0 {
                                send_fault_event(ctx, id, false, code, None);
                            }
                        }
                        send_fault_event(ctx, id, false, FAULT_GENERAL, None);
                    }
                }
                FaultFlag::Faulty => send_fault_event(ctx, id, set, FAULT_GENERAL, None),
                FaultFlag::SdBattery => {
                    let read_volts = set && profile.is_some_and(|p| p.read_volts_on_fault);
                    let request = Command::ReadVolts {
                        id,
                        model: report.model,
                    };
                    if !(read_volts
                        && self.begin_fault(ctx, id, frame, FollowUp::Volts, &request))
                    {
                        send_fault_event(ctx, id, set, FAULT_SD_BATTERY, None);
                    }
                }
                FaultFlag::Unused6 | FaultFlag::Unused7 => {
                    if set {
                        error!("Device {} set unassigned fault bit {}", id, flag.bit());
                    }
                }
            }
        }
    }

    fn begin_fault<S: Shadow>(
        &mut self,
        ctx: &mut Context<S>,
        id: DeviceId,
        frame: &[u8],
        awaiting: FollowUp,
        request: &Command,
    ) -> bool {
        if self.faults.contains_key(&id) {
            debug!("Fault already pending for device {}, reporting directly", id);
            return false;
        }
        let Some(mut parked) = ctx.pool().acquire_with(frame) else {
            warn!("No buffer to park fault for device {}", id);
            return false;
        };
        parked.retag(SlotUse::PendingFault);
        if !ctx.send(request) {
            warn!("Failed to request fault follow-up from device {}", id);
            return false;
        }

        let timer = ctx.schedule(TimerKind::FaultTimeout(id), self.config.transaction_timeout);
        self.faults.insert(
            id,
            PendingFault {
                frame: parked,
                awaiting,
                timer,
            },
        );
        true
    }

    /// A data slot value: the voltage for a pending battery fault or the
    /// temperature for a pending alarm.
    pub fn variable<S: Shadow>(&mut self, ctx: &mut Context<S>, report: &VariableReport) {
        let id = report.id;
        if self.pending_fault(id) == Some(FollowUp::Volts) {
            if let Some(pending) = self.faults.remove(&id) {
                ctx.timers().cancel(pending.timer);
                send_fault_event(ctx, id, true, FAULT_SD_BATTERY, Some(report.value));
            }
        } else if let Some(pending) = self.alarms.remove(&id) {
            ctx.timers().cancel(pending.timer);
            match parked_alarm(&pending.frame) {
                Some(alarm) => {
                    send_alarm_event(ctx, id, alarm_state_for(alarm.status), Some(report.value))
                }
                None => error!("Parked alarm for device {} is unreadable", id),
            }
        } else {
            warn!("Variable from device {} with nothing pending, ignoring", id);
        }
    }

    /// A detailed fault word for a pending general fault.
    pub fn fault_details<S: Shadow>(&mut self, ctx: &mut Context<S>, report: &FaultDetailReport) {
        let id = report.id;
        if self.pending_fault(id) != Some(FollowUp::FaultDetails) {
            warn!("Unexpected fault details from device {}, ignoring", id);
            return;
        }
        if let Some(pending) = self.faults.remove(&id) {
            ctx.timers().cancel(pending.timer);
        }

        let details_type = profile_of(ctx, id).map_or(0, |p| p.fault_details_type);
        if details_type == 0 {
            error!("Device {} sent fault details but has no detail table", id);
            return;
        }
        for bit in 0..FAULT_DETAIL_BITS {
            let code = fault_details_code(details_type, bit);
            let active = report.faults & (1 << bit) != 0;
            send_fault_event(ctx, id, active, code, None);
        }
    }

    // ------------------------------------------------------------------
    // Alarms
    // ------------------------------------------------------------------

    /// An alarm report.
    pub fn alarm<S: Shadow>(&mut self, ctx: &mut Context<S>, report: &AlarmReport, frame: &[u8]) {
        let id = report.id;
        let wants_temperature = profile_of(ctx, id).is_some_and(|p| p.temperature_alarm);
        if wants_temperature && self.begin_alarm(ctx, id, frame) {
            return;
        }
        send_alarm_event(ctx, id, alarm_state_for(report.status), None);
    }

    fn begin_alarm<S: Shadow>(&mut self, ctx: &mut Context<S>, id: DeviceId, frame: &[u8]) -> bool {
        if self.alarms.contains_key(&id) {
            debug!("Alarm already pending for device {}, reporting directly", id);
            return false;
        }
        let model = ctx
            .reported(id, props::MODEL_VALUE)
            .and_then(|v| v.as_i64())
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(0);
        let Some(mut parked) = ctx.pool().acquire_with(frame) else {
            warn!("No buffer to park alarm for device {}", id);
            return false;
        };
        parked.retag(SlotUse::PendingAlarm);
        if !ctx.send(&Command::ReadTemperature { id, model }) {
            warn!("Failed to request temperature from device {}", id);
            return false;
        }

        let timer = ctx.schedule(TimerKind::AlarmTimeout(id), self.config.transaction_timeout);
        self.alarms.insert(
            id,
            PendingAlarm {
                frame: parked,
                timer,
            },
        );
        true
    }

    /// An alarm stopped.
    pub fn alarm_stop<S: Shadow>(&mut self, ctx: &mut Context<S>, event: &DeviceEvent) {
        send_alarm_event(ctx, event.id, ALARM_INACTIVE, None);
    }

    /// Someone pressed hush: every sounding alarm is now silenced.
    pub fn hush<S: Shadow>(&mut self, ctx: &mut Context<S>, event: &DeviceEvent) {
        info!("Hush from device {}", event.id);
        let devices = match ctx.shadow.enumerate_devices() {
            Ok(devices) => devices,
            Err(e) => {
                error!("Failed to enumerate devices: {}", e);
                return;
            }
        };
        for id in devices {
            if alarm_state_of(ctx, id) == Some(ALARM_ACTIVE) {
                send_alarm_event(ctx, id, ALARM_SILENCED, None);
            }
        }
    }

    /// A locate: the reporting device's alarm is silenced.
    pub fn locate<S: Shadow>(&mut self, ctx: &mut Context<S>, report: &LocateReport) {
        debug!(
            "Locate from device {} (originating {})",
            report.id, report.originating
        );
        if alarm_state_of(ctx, report.id) == Some(ALARM_ACTIVE) {
            send_alarm_event(ctx, report.id, ALARM_SILENCED, None);
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// A smoke-detector interface fault on a radio module.
    pub fn rm_sd_fault<S: Shadow>(&mut self, ctx: &mut Context<S>, report: &RmSdFault) {
        match ctx.shadow.increment_reported(report.id, props::RM_SD_FAULT) {
            Ok(count) => info!("RM SD fault {} from device {}", count, report.id),
            Err(e) => error!("Failed to count RM SD fault for {}: {}", report.id, e),
        }
    }

    /// Status of a remote radio module.
    pub fn remote_status<S: Shadow>(&mut self, ctx: &mut Context<S>, status: &RadioStatus) {
        ctx.report(status.id, props::RADIO_FAULT_COUNT, status.radio_faults);
        ctx.report(status.id, props::RADIO_RSSI, status.rssi);
        ctx.report(status.id, props::WISAFE_ID, status.fw_rev.to_string());
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    /// A pending record's timer fired: report without the follow-up data.
    pub fn on_timeout<S: Shadow>(&mut self, ctx: &mut Context<S>, kind: TimerKind) {
        match kind {
            TimerKind::FaultTimeout(id) => {
                let Some(pending) = self.faults.remove(&id) else {
                    return;
                };
                warn!("No fault follow-up from device {}", id);
                dump("Expired fault", &pending.frame);
                metrics::counter!(metric_defs::EVENTS_PENDING_TIMEOUTS.name, "class" => "fault")
                    .increment(1);
                let code = match pending.awaiting {
                    FollowUp::Volts => FAULT_SD_BATTERY,
                    FollowUp::FaultDetails => FAULT_GENERAL,
                };
                send_fault_event(ctx, id, true, code, None);
            }
            TimerKind::AlarmTimeout(id) => {
                let Some(pending) = self.alarms.remove(&id) else {
                    return;
                };
                warn!("No temperature from device {}", id);
                metrics::counter!(metric_defs::EVENTS_PENDING_TIMEOUTS.name, "class" => "alarm")
                    .increment(1);
                match parked_alarm(&pending.frame) {
                    Some(alarm) => send_alarm_event(ctx, id, alarm_state_for(alarm.status), None),
                    None => error!("Parked alarm for device {} is unreadable", id),
                }
            }
            _ => {}
        }
    }
}

fn parked_alarm(frame: &[u8]) -> Option<AlarmReport> {
    match Message::decode(frame) {
        Ok(Message::Alarm(alarm)) => Some(alarm),
        _ => None,
    }
}

fn profile_of<S: Shadow>(ctx: &Context<S>, id: DeviceId) -> Option<&'static DeviceProfile> {
    let device_type = ctx.reported(id, props::TYPE)?.as_u32()?;
    find_profile(device_type)
}

fn alarm_state_of<S: Shadow>(ctx: &Context<S>, id: DeviceId) -> Option<u32> {
    ctx.reported(id, props::ALARM_STATE)?.as_u32()
}

/// Report a fault code's state, its sequence number and when it changed.
///
/// Nothing is written when the fault was and still is inactive. The sequence
/// counts inactive-to-active transitions.
pub fn send_fault_event<S: Shadow>(
    ctx: &mut Context<S>,
    id: DeviceId,
    active: bool,
    code: u8,
    millivolts: Option<u16>,
) {
    if !(1..=99).contains(&code) {
        return;
    }

    let state_name = props::fault(code, "state");
    let was_active = ctx
        .reported(id, &state_name)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !was_active && !active {
        return;
    }

    let seq_name = props::fault(code, "seq");
    let seq = match ctx.reported(id, &seq_name).and_then(|v| v.as_i64()) {
        Some(seq) if !was_active && active => seq + 1,
        Some(seq) => seq,
        None => 0,
    };

    if let Some(mv) = millivolts {
        ctx.report(id, &props::fault(code, "battv"), u32::from(mv / 10));
    }

    debug!("Device {} fault {:02} active={} seq={}", id, code, active, seq);
    let values: Vec<(String, PropertyValue)> = vec![
        (state_name, active.into()),
        (seq_name, seq.into()),
        (props::fault(code, "time"), ctx.unix_time().into()),
    ];
    if let Err(e) = ctx.shadow.set_reported_group(id, values) {
        error!("Failed to report fault {} on device {}: {}", code, id, e);
    }
    metrics::counter!(metric_defs::EVENTS_FAULTS.name).increment(1);
}

/// Report an alarm state with its sequence number and time, plus the
/// temperature if one was read.
pub fn send_alarm_event<S: Shadow>(
    ctx: &mut Context<S>,
    id: DeviceId,
    state: u32,
    raw_temperature: Option<u16>,
) {
    let seq = match ctx.reported(id, props::ALARM_SEQ).and_then(|v| v.as_i64()) {
        Some(seq) if state != ALARM_INACTIVE => seq + 1,
        Some(seq) => seq,
        None => 0,
    };

    if let Some(raw) = raw_temperature {
        ctx.report(id, props::ALARM_TEMPV, temperature_centi(raw));
    }

    info!("Device {} alarm state {} seq {}", id, state, seq);
    let values: Vec<(String, PropertyValue)> = vec![
        (props::ALARM_STATE.to_string(), state.into()),
        (props::ALARM_SEQ.to_string(), seq.into()),
        (props::ALARM_TIME.to_string(), ctx.unix_time().into()),
    ];
    if let Err(e) = ctx.shadow.set_reported_group(id, values) {
        error!("Failed to report alarm on device {}: {}", id, e);
    }
    metrics::counter!(metric_defs::EVENTS_ALARMS.name).increment(1);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use wisafe_link::BufferPool;

    use super::*;
    use crate::context::RecordingSink;
    use crate::profile::WISAFE_TYPE_FLAG;
    use crate::shadow::MemoryShadow;
    use crate::timer::ManualClock;

    const SMOKE: DeviceId = DeviceId::new(0x0a0b0c);
    const COLD: DeviceId = DeviceId::new(0x0d0e0f);

    fn harness() -> (EventCorrelator, Context<MemoryShadow>, RecordingSink, BufferPool) {
        let mut shadow = MemoryShadow::new();
        shadow
            .register_device(SMOKE, 129 | WISAFE_TYPE_FLAG)
            .expect("smoke");
        shadow
            .register_device(COLD, 1 | WISAFE_TYPE_FLAG)
            .expect("cold");
        shadow
            .set_reported(COLD, props::MODEL_VALUE, 1157u32.into())
            .expect("model");
        let pool = BufferPool::new(4);
        let sink = RecordingSink::new();
        let ctx = Context::new(
            shadow,
            pool.clone(),
            Arc::new(sink.clone()),
            Arc::new(ManualClock::new(1_000)),
        );
        let events = EventCorrelator::new(EventConfig {
            transaction_timeout: Duration::from_secs(30),
        });
        (events, ctx, sink, pool)
    }

    fn fault(id: DeviceId, flags: u8) -> FaultReport {
        FaultReport {
            id,
            model: 785,
            flags,
            sid: 3,
            seq: 1,
        }
    }

    const CALIBRATED_ON_BASE: u8 = 0b0000_0101;

    #[test]
    fn test_alarm_state_map() {
        assert_eq!(alarm_state_for(0), 1);
        assert_eq!(alarm_state_for(1), 2);
        assert_eq!(alarm_state_for(21), 13);
        assert_eq!(alarm_state_for(22), 1);
    }

    #[test]
    fn test_temperature_conversion() {
        assert_eq!(temperature_centi(0), 7990);
        assert_eq!(temperature_centi(500), 3190);
        // 79.708 degrees truncates to 7970, not 7971.
        assert_eq!(temperature_centi(2), 7970);
    }

    #[test]
    fn test_inactive_fault_never_written() {
        let (_, mut ctx, _, _) = harness();
        send_fault_event(&mut ctx, SMOKE, false, FAULT_AC, None);
        assert!(ctx.reported(SMOKE, &props::fault(FAULT_AC, "state")).is_none());
    }

    #[test]
    fn test_fault_sequence_counts_activations() {
        let (_, mut ctx, _, _) = harness();
        let seq = props::fault(FAULT_AC, "seq");

        send_fault_event(&mut ctx, SMOKE, true, FAULT_AC, None);
        assert_eq!(ctx.reported(SMOKE, &seq), Some(0i64.into()));
        send_fault_event(&mut ctx, SMOKE, true, FAULT_AC, None);
        assert_eq!(ctx.reported(SMOKE, &seq), Some(0i64.into()));
        send_fault_event(&mut ctx, SMOKE, false, FAULT_AC, None);
        send_fault_event(&mut ctx, SMOKE, true, FAULT_AC, None);
        assert_eq!(ctx.reported(SMOKE, &seq), Some(1i64.into()));
        assert_eq!(
            ctx.reported(SMOKE, &props::fault(FAULT_AC, "time")),
            Some(1_000i64.into())
        );
    }

    #[test]
    fn test_battery_fault_waits_for_volts() {
        let (mut events, mut ctx, sink, pool) = harness();
        let report = fault(SMOKE, CALIBRATED_ON_BASE | 0b1000);
        let frame = [0x71u8, 0, 0, 0, 0, 0, 0, 0, 0];

        events.fault(&mut ctx, &report, &frame);
        assert_eq!(events.pending_fault(SMOKE), Some(FollowUp::Volts));
        assert_eq!(pool.in_use(SlotUse::PendingFault), 1);
        assert_eq!(
            sink.take(),
            vec![Command::ReadVolts { id: SMOKE, model: 785 }.to_vec()]
        );
        assert!(ctx.reported(SMOKE, &props::fault(FAULT_SD_BATTERY, "state")).is_none());

        let variable = VariableReport {
            id: SMOKE,
            slot: 6,
            value: 2950,
            sid: 3,
            seq: 2,
        };
        events.variable(&mut ctx, &variable);
        assert_eq!(events.pending_faults(), 0);
        assert_eq!(pool.in_use(SlotUse::PendingFault), 0);
        assert_eq!(
            ctx.reported(SMOKE, &props::fault(FAULT_SD_BATTERY, "state")),
            Some(true.into())
        );
        assert_eq!(
            ctx.reported(SMOKE, &props::fault(FAULT_SD_BATTERY, "battv")),
            Some(295u32.into())
        );
    }

    #[test]
    fn test_battery_fault_timeout_reports_without_volts() {
        let (mut events, mut ctx, _, pool) = harness();
        let report = fault(SMOKE, CALIBRATED_ON_BASE | 0b1000);
        events.fault(&mut ctx, &report, &[0x71]);

        events.on_timeout(&mut ctx, TimerKind::FaultTimeout(SMOKE));
        assert_eq!(events.pending_faults(), 0);
        assert_eq!(pool.in_use(SlotUse::PendingFault), 0);
        assert_eq!(
            ctx.reported(SMOKE, &props::fault(FAULT_SD_BATTERY, "state")),
            Some(true.into())
        );
        assert!(ctx.reported(SMOKE, &props::fault(FAULT_SD_BATTERY, "battv")).is_none());
    }

    #[test]
    fn test_battery_fault_without_buffer_reports_at_once() {
        let (mut events, mut ctx, sink, pool) = harness();
        let held: Vec<_> = (0..pool.capacity())
            .map(|_| pool.acquire().expect("slot"))
            .collect();
        assert_eq!(pool.available(), 0);

        events.fault(&mut ctx, &fault(SMOKE, CALIBRATED_ON_BASE | 0b1000), &[0x71]);
        assert_eq!(events.pending_faults(), 0);
        assert!(sink.is_empty());
        assert_eq!(
            ctx.reported(SMOKE, &props::fault(FAULT_SD_BATTERY, "state")),
            Some(true.into())
        );
        assert!(ctx.reported(SMOKE, &props::fault(FAULT_SD_BATTERY, "battv")).is_none());

        drop(held);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_general_and_battery_fault_together() {
        let (mut events, mut ctx, sink, _) = harness();
        events.fault(&mut ctx, &fault(SMOKE, CALIBRATED_ON_BASE | 0b1010), &[0x71]);

        // Only one follow-up per device: fault details win, the battery
        // fault goes out without a voltage.
        assert_eq!(events.pending_fault(SMOKE), Some(FollowUp::FaultDetails));
        assert_eq!(
            sink.take(),
            vec![Command::RequestFaultDetails { id: SMOKE, model: 785 }.to_vec()]
        );
        assert_eq!(
            ctx.reported(SMOKE, &props::fault(FAULT_SD_BATTERY, "state")),
            Some(true.into())
        );
        assert!(ctx.reported(SMOKE, &props::fault(FAULT_SD_BATTERY, "battv")).is_none());
    }

    #[test]
    fn test_general_fault_uses_details() {
        let (mut events, mut ctx, sink, _) = harness();
        events.fault(&mut ctx, &fault(SMOKE, CALIBRATED_ON_BASE | 0b10), &[0x71]);
        assert_eq!(events.pending_fault(SMOKE), Some(FollowUp::FaultDetails));
        assert_eq!(
            sink.take(),
            vec![Command::RequestFaultDetails { id: SMOKE, model: 785 }.to_vec()]
        );

        let details = FaultDetailReport {
            id: SMOKE,
            model: 785,
            faults: 0b11,
            sid: 3,
            seq: 2,
        };
        events.fault_details(&mut ctx, &details);
        assert_eq!(events.pending_faults(), 0);
        assert_eq!(ctx.reported(SMOKE, &props::fault(2, "state")), Some(true.into()));
        assert_eq!(ctx.reported(SMOKE, &props::fault(4, "state")), Some(true.into()));
        assert!(ctx.reported(SMOKE, &props::fault(6, "state")).is_none());
    }

    #[test]
    fn test_missing_calibration_is_a_fault() {
        let (mut events, mut ctx, _, _) = harness();
        events.fault(&mut ctx, &fault(COLD, 0b0000_0100), &[0x71]);
        assert_eq!(
            ctx.reported(COLD, &props::fault(FAULT_CALIBRATION, "state")),
            Some(true.into())
        );
        assert!(ctx.reported(COLD, &props::fault(FAULT_OFF_BASE, "state")).is_none());
    }

    #[test]
    fn test_alarm_reads_temperature() {
        let (mut events, mut ctx, sink, _) = harness();
        let alarm = AlarmReport {
            id: COLD,
            priority: 1,
            status: 0,
            sid: 4,
            seq: 1,
        };
        let frame = [0x50, 0x0f, 0x0e, 0x0d, 0x01, 0x00, 0x04, 0x01];
        events.alarm(&mut ctx, &alarm, &frame);
        assert!(events.has_pending_alarm(COLD));
        assert_eq!(
            sink.take(),
            vec![Command::ReadTemperature { id: COLD, model: 1157 }.to_vec()]
        );

        let variable = VariableReport {
            id: COLD,
            slot: 6,
            value: 500,
            sid: 4,
            seq: 2,
        };
        events.variable(&mut ctx, &variable);
        assert!(!events.has_pending_alarm(COLD));
        assert_eq!(ctx.reported(COLD, props::ALARM_TEMPV), Some(3190i32.into()));
        assert_eq!(ctx.reported(COLD, props::ALARM_STATE), Some(ALARM_ACTIVE.into()));
        assert_eq!(ctx.reported(COLD, props::ALARM_SEQ), Some(0i64.into()));
    }

    #[test]
    fn test_alarm_without_buffer_reports_at_once() {
        let (mut events, mut ctx, sink, pool) = harness();
        let held: Vec<_> = (0..pool.capacity())
            .map(|_| pool.acquire().expect("slot"))
            .collect();

        let alarm = AlarmReport {
            id: COLD,
            priority: 1,
            status: 0,
            sid: 4,
            seq: 1,
        };
        events.alarm(&mut ctx, &alarm, &[0x50, 0x0f, 0x0e, 0x0d, 0x01, 0x00, 0x04, 0x01]);
        assert!(!events.has_pending_alarm(COLD));
        assert!(sink.is_empty());
        assert_eq!(ctx.reported(COLD, props::ALARM_STATE), Some(ALARM_ACTIVE.into()));
        assert!(ctx.reported(COLD, props::ALARM_TEMPV).is_none());

        drop(held);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_hush_silences_active_alarms() {
        let (mut events, mut ctx, _, _) = harness();
        send_alarm_event(&mut ctx, SMOKE, ALARM_ACTIVE, None);
        send_alarm_event(&mut ctx, COLD, 3, None);

        let hush = DeviceEvent {
            id: SMOKE,
            priority: 0x81,
            sid: 3,
            seq: 1,
        };
        events.hush(&mut ctx, &hush);
        assert_eq!(ctx.reported(SMOKE, props::ALARM_STATE), Some(ALARM_SILENCED.into()));
        assert_eq!(ctx.reported(SMOKE, props::ALARM_SEQ), Some(1i64.into()));
        assert_eq!(ctx.reported(COLD, props::ALARM_STATE), Some(3u32.into()));
    }

    #[test]
    fn test_variable_without_pending_ignored() {
        let (mut events, mut ctx, _, _) = harness();
        let variable = VariableReport {
            id: SMOKE,
            slot: 6,
            value: 1,
            sid: 3,
            seq: 1,
        };
        events.variable(&mut ctx, &variable);
        assert!(ctx.reported(SMOKE, props::ALARM_STATE).is_none());
    }
}
