//! End-to-end engine tests: frames in, shadow properties and commands out.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use wisafe_gateway::shadow::props;
use wisafe_gateway::{
    Context, ControlOp, Engine, GatewayConfig, GatewayMessage, GatewayState, ManualClock,
    MemoryShadow, Online, PropertyDelta, PropertyValue, RecordingSink, ScanPhase, Shadow,
    SystemClock,
};
use wisafe_link::BufferPool;
use wisafe_protocol::{Command, DeviceId, SidMap};

const SMOKE_MODEL: u16 = 785;
const COLD_MODEL: u16 = 1157;

struct Gateway {
    engine: Engine<MemoryShadow>,
    sink: RecordingSink,
    clock: ManualClock,
    seq: u8,
}

impl Gateway {
    fn new() -> Self {
        let config = GatewayConfig::default();
        let sink = RecordingSink::new();
        let clock = ManualClock::new(1_700_000_000);
        let ctx = Context::new(
            MemoryShadow::new(),
            BufferPool::new(10),
            Arc::new(sink.clone()),
            Arc::new(clock.clone()),
        );
        let mut engine = Engine::new(&config, ctx);
        engine.start();
        Self {
            engine,
            sink,
            clock,
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u8 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn receive(&mut self, frame: &[u8]) {
        self.engine.process_received(frame);
    }

    fn control(&mut self, op: ControlOp) {
        self.engine.process_control(op);
    }

    fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.engine.run_expired_timers();
    }

    fn sid_map(&mut self, map: SidMap) {
        let mut frame = vec![0xd4, 0x03];
        frame.extend_from_slice(&map.to_bytes());
        self.receive(&frame);
    }

    fn missing(&mut self, map: SidMap) {
        let mut frame = vec![0xd4, 0x01, 0x00];
        frame.extend_from_slice(&map.to_bytes());
        self.receive(&frame);
    }

    fn device_tested(&mut self, id: DeviceId, model: u16, sid: u8) {
        let seq = self.next_seq();
        let mut frame = vec![0x70];
        frame.extend_from_slice(&id.to_le_bytes());
        frame.extend_from_slice(&[0x81, 0x00]);
        frame.extend_from_slice(&model.to_le_bytes());
        frame.extend_from_slice(&[sid, seq]);
        self.receive(&frame);
    }

    fn fault(&mut self, id: DeviceId, model: u16, flags: u8, sid: u8) {
        let seq = self.next_seq();
        let mut frame = vec![0x71];
        frame.extend_from_slice(&id.to_le_bytes());
        frame.extend_from_slice(&model.to_le_bytes());
        frame.extend_from_slice(&[flags, sid, seq]);
        self.receive(&frame);
    }

    fn alarm_with_seq(&mut self, id: DeviceId, status: u8, sid: u8, seq: u8) {
        let mut frame = vec![0x50];
        frame.extend_from_slice(&id.to_le_bytes());
        frame.extend_from_slice(&[0x01, status, sid, seq]);
        self.receive(&frame);
    }

    fn variable(&mut self, id: DeviceId, value: u16, sid: u8) {
        let seq = self.next_seq();
        let mut frame = vec![0xc2];
        frame.extend_from_slice(&id.to_le_bytes());
        frame.push(0x06);
        frame.extend_from_slice(&value.to_le_bytes());
        frame.extend_from_slice(&[0, 0, sid, seq]);
        self.receive(&frame);
    }

    fn hush(&mut self, id: DeviceId, sid: u8) {
        let seq = self.next_seq();
        let mut frame = vec![0x52];
        frame.extend_from_slice(&id.to_le_bytes());
        frame.extend_from_slice(&[0x81, sid, seq]);
        self.receive(&frame);
    }

    fn reported(&self, id: DeviceId, name: &str) -> Option<PropertyValue> {
        self.engine.shadow().get_reported(id, name).ok()
    }

    fn gateway(&self, name: &str) -> Option<PropertyValue> {
        self.reported(DeviceId::GATEWAY, name)
    }

    /// Join a network at SID 0 and register one device per entry.
    fn with_devices(&mut self, devices: &[(DeviceId, u16, u8)]) {
        let map: SidMap = std::iter::once(0)
            .chain(devices.iter().map(|&(_, _, sid)| sid))
            .collect();
        self.sid_map(map);
        for &(id, model, sid) in devices {
            self.device_tested(id, model, sid);
        }
        // Every SID is now known, so interrogation stops.
        self.sid_map(map);
        assert!(!self.engine.discovery().is_interrogating());
        self.sink.take();
    }
}

fn device(n: u32) -> DeviceId {
    DeviceId::new(0x100000 + n)
}

#[test]
fn test_startup_creates_gateway_properties() {
    let gw = Gateway::new();
    let shadow = gw.engine.shadow();
    assert!(shadow.is_registered(DeviceId::GATEWAY));
    assert_eq!(gw.gateway(props::IN_NETWORK), Some(false.into()));
    assert_eq!(gw.gateway(props::STATE), Some(GatewayState::Running.into()));
    assert_eq!(gw.gateway(props::CMD_LEARN), Some(PropertyValue::Integer(0)));
    assert!(shadow.is_subscribed(DeviceId::GATEWAY, props::CMD_TEST_MODE));
    assert!(shadow.is_subscribed(DeviceId::GATEWAY, props::STATE));
    assert!(gw.sink.is_empty());
}

#[test]
fn test_first_sid_map_fetch_after_startup_delay() {
    let mut gw = Gateway::new();
    gw.advance(Duration::from_secs(2));
    assert!(gw.sink.is_empty());
    gw.advance(Duration::from_secs(1));
    assert_eq!(gw.sink.take(), vec![Command::RequestSidMap.to_vec()]);
}

#[test]
fn test_status_request_answered_with_ident() {
    let mut gw = Gateway::new();
    gw.receive(&[0x41]);
    assert_eq!(gw.sink.take(), vec![Command::gateway_ident().to_vec()]);
}

#[test]
fn test_join_detection_and_unknown_count() {
    let mut gw = Gateway::new();
    gw.sid_map(SidMap::from_iter([0]));
    assert_eq!(gw.gateway(props::IN_NETWORK), Some(false.into()));
    assert_eq!(gw.gateway(props::UNKNOWN_SIDS), Some(0u32.into()));

    gw.sid_map(SidMap::from_iter([0, 3, 4]));
    assert!(gw.engine.discovery().in_network());
    assert_eq!(gw.gateway(props::IN_NETWORK), Some(true.into()));
    assert_eq!(gw.gateway(props::UNKNOWN_SIDS), Some(2u32.into()));
}

#[test]
fn test_device_tested_registers_unknown_sid() {
    let mut gw = Gateway::new();
    gw.sid_map(SidMap::from_iter([0, 5]));
    assert_eq!(gw.engine.discovery().unknown_count(), 1);

    let id = device(5);
    gw.device_tested(id, SMOKE_MODEL, 5);

    assert!(gw.engine.shadow().is_registered(id));
    assert_eq!(gw.engine.discovery().unknown_count(), 0);
    assert_eq!(gw.reported(id, props::SID), Some(5u8.into()));
    assert_eq!(gw.reported(id, props::MODEL), Some("785".into()));
    assert_eq!(gw.reported(id, props::MANUFACTURER), Some("Sprue".into()));
    assert_eq!(gw.reported(id, props::ONLINE), Some(Online::Unknown.into()));
    assert_eq!(
        gw.reported(id, props::TEST_TIMESTAMP),
        Some(1_700_000_000i64.into())
    );
}

#[test]
fn test_duplicate_sequence_dropped() {
    let mut gw = Gateway::new();
    let id = device(1);
    gw.with_devices(&[(id, SMOKE_MODEL, 1)]);

    gw.alarm_with_seq(id, 0, 1, 40);
    assert_eq!(gw.reported(id, props::ALARM_SEQ), Some(0i64.into()));
    let first_time = gw.reported(id, props::ALARM_TIME);

    gw.clock.advance(Duration::from_secs(5));
    gw.alarm_with_seq(id, 0, 1, 40);
    assert_eq!(gw.reported(id, props::ALARM_SEQ), Some(0i64.into()));
    assert_eq!(gw.reported(id, props::ALARM_TIME), first_time);

    gw.alarm_with_seq(id, 0, 1, 41);
    assert_eq!(gw.reported(id, props::ALARM_SEQ), Some(1i64.into()));
    assert_eq!(gw.reported(id, props::LAST_SEQUENCE), Some(41u8.into()));
}

#[test]
fn test_missing_device_deleted_after_confirmations() {
    let mut gw = Gateway::new();
    let devices: Vec<(DeviceId, u16, u8)> = (1..=50u8)
        .map(|sid| (device(u32::from(sid)), SMOKE_MODEL, sid))
        .collect();
    gw.with_devices(&devices);
    assert_eq!(gw.engine.shadow().device_count(), 51);
    assert_eq!(gw.engine.discovery().unknown_count(), 0);

    let full = gw.engine.discovery().current_map();
    let gone = SidMap::from_iter([17]);

    gw.control(ControlOp::BeginMissingNodeScan { delete: true });
    assert_eq!(gw.engine.discovery().scan_phase(), ScanPhase::Probing);
    assert_eq!(gw.sink.take(), vec![Command::UpdateSidMap(full).to_vec()]);

    for _ in 0..2 {
        gw.missing(gone);
        assert!(gw.sink.is_empty());
        gw.advance(Duration::from_secs(30));
        assert_eq!(gw.sink.take(), vec![Command::UpdateSidMap(full).to_vec()]);
    }

    gw.missing(gone);
    let kept = full.difference(gone);
    assert_eq!(gw.engine.discovery().scan_phase(), ScanPhase::UpdatingMap);
    assert_eq!(gw.sink.take(), vec![Command::UpdateSidMap(kept).to_vec()]);
    assert_eq!(
        gw.reported(device(17), props::ONLINE),
        Some(Online::Offline.into())
    );
    assert_eq!(
        gw.reported(device(16), props::ONLINE),
        Some(Online::Online.into())
    );

    gw.missing(SidMap::EMPTY);
    assert_eq!(gw.engine.discovery().scan_phase(), ScanPhase::Idle);
    assert!(!gw.engine.shadow().is_registered(device(17)));
    assert_eq!(gw.engine.shadow().device_count(), 50);
    assert_eq!(gw.gateway(props::CMD_TEST_MODE_RESULT), Some(true.into()));
}

#[test]
fn test_scan_times_out_without_deleting() {
    let mut gw = Gateway::new();
    gw.with_devices(&[(device(1), SMOKE_MODEL, 1), (device(2), SMOKE_MODEL, 2)]);

    gw.control(ControlOp::BeginMissingNodeScan { delete: true });
    gw.sink.take();
    for _ in 0..6 {
        gw.advance(Duration::from_secs(60));
    }
    gw.advance(Duration::from_secs(60));

    assert_eq!(gw.engine.discovery().scan_phase(), ScanPhase::Idle);
    assert_eq!(gw.engine.shadow().device_count(), 3);
}

#[test]
fn test_all_zero_report_ends_scan_early() {
    let mut gw = Gateway::new();
    gw.with_devices(&[(device(1), SMOKE_MODEL, 1), (device(2), SMOKE_MODEL, 2)]);

    gw.control(ControlOp::BeginMissingNodeScan { delete: true });
    gw.sink.take();
    gw.missing(SidMap::EMPTY);

    assert_eq!(gw.engine.discovery().scan_phase(), ScanPhase::Idle);
    assert_eq!(gw.engine.shadow().device_count(), 3);
    for n in [1, 2] {
        assert_eq!(
            gw.reported(device(n), props::ONLINE),
            Some(Online::Online.into())
        );
    }
    assert!(gw.sink.is_empty());
}

#[test]
fn test_battery_fault_reports_voltage() {
    let mut gw = Gateway::new();
    let id = device(3);
    gw.with_devices(&[(id, SMOKE_MODEL, 3)]);

    gw.fault(id, SMOKE_MODEL, 0b0000_1101, 3);
    assert_eq!(
        gw.sink.take(),
        vec![Command::ReadVolts {
            id,
            model: SMOKE_MODEL
        }
        .to_vec()]
    );
    assert_eq!(gw.engine.events().pending_faults(), 1);

    gw.variable(id, 2870, 3);
    assert_eq!(gw.engine.events().pending_faults(), 0);
    assert_eq!(gw.reported(id, "flt93_state"), Some(true.into()));
    assert_eq!(gw.reported(id, "flt93_battv"), Some(287u32.into()));
    assert_eq!(gw.reported(id, "flt93_seq"), Some(0i64.into()));
}

#[test]
fn test_battery_fault_timeout_reports_without_voltage() {
    let mut gw = Gateway::new();
    let id = device(3);
    gw.with_devices(&[(id, SMOKE_MODEL, 3)]);

    gw.fault(id, SMOKE_MODEL, 0b0000_1101, 3);
    gw.advance(Duration::from_secs(29));
    assert_eq!(gw.engine.events().pending_faults(), 1);
    gw.advance(Duration::from_secs(1));

    assert_eq!(gw.engine.events().pending_faults(), 0);
    assert_eq!(gw.reported(id, "flt93_state"), Some(true.into()));
    assert!(gw.reported(id, "flt93_battv").is_none());
}

#[test]
fn test_alarm_waits_for_temperature() {
    let mut gw = Gateway::new();
    let id = device(4);
    gw.with_devices(&[(id, COLD_MODEL, 4)]);

    let seq = gw.next_seq();
    gw.alarm_with_seq(id, 1, 4, seq);
    assert_eq!(
        gw.sink.take(),
        vec![Command::ReadTemperature {
            id,
            model: COLD_MODEL
        }
        .to_vec()]
    );
    assert!(gw.reported(id, props::ALARM_STATE).is_none());

    gw.variable(id, 100, 4);
    assert_eq!(gw.reported(id, props::ALARM_STATE), Some(2u32.into()));
    assert_eq!(gw.reported(id, props::ALARM_TEMPV), Some(7030i32.into()));
}

#[test]
fn test_hush_silences_active_alarms() {
    let mut gw = Gateway::new();
    let (a, b) = (device(1), device(2));
    gw.with_devices(&[(a, SMOKE_MODEL, 1), (b, SMOKE_MODEL, 2)]);

    let seq = gw.next_seq();
    gw.alarm_with_seq(a, 0, 1, seq);
    assert_eq!(gw.reported(a, props::ALARM_STATE), Some(1u32.into()));

    gw.hush(b, 2);
    assert_eq!(gw.reported(a, props::ALARM_STATE), Some(2u32.into()));
    assert!(gw.reported(b, props::ALARM_STATE).is_none());
}

#[test]
fn test_flush_all_deletes_every_device() {
    let mut gw = Gateway::new();
    gw.with_devices(&[(device(1), SMOKE_MODEL, 1), (device(2), SMOKE_MODEL, 2)]);

    gw.control(ControlOp::FlushAll);
    assert_eq!(
        gw.sink.take(),
        vec![Command::UpdateSidMap(SidMap::EMPTY).to_vec()]
    );
    gw.missing(SidMap::EMPTY);

    assert_eq!(gw.engine.shadow().device_count(), 1);
    assert!(gw.engine.shadow().is_registered(DeviceId::GATEWAY));
}

#[test]
fn test_learn_delta_enters_learn_mode() {
    let mut gw = Gateway::new();
    {
        let shadow = &mut gw.engine.context_mut().shadow;
        shadow
            .set_desired(DeviceId::GATEWAY, props::STATE, GatewayState::Learning.into())
            .expect("state");
        shadow
            .set_desired(DeviceId::GATEWAY, props::CMD_LEARN_TIMEOUT, 60u32.into())
            .expect("timeout");
    }

    gw.control(ControlOp::PropertyDeltas(vec![
        PropertyDelta::new(DeviceId::GATEWAY, props::CMD_LEARN, 1u32),
        PropertyDelta::new(DeviceId::GATEWAY, props::STATE, GatewayState::Learning),
    ]));
    assert!(gw.engine.discovery().is_learning());
    assert_eq!(gw.gateway(props::STATE), Some(GatewayState::Learning.into()));
    assert_eq!(gw.gateway(props::CMD_LEARN_TIMEOUT), Some(60u32.into()));
    assert_eq!(gw.sink.take(), vec![Command::LearnIn.to_vec()]);

    gw.advance(Duration::from_secs(60));
    assert!(!gw.engine.discovery().is_learning());
    assert_eq!(gw.gateway(props::STATE), Some(GatewayState::Running.into()));
}

#[test]
fn test_mute_delta_disables_sounder() {
    let mut gw = Gateway::new();
    let id = device(6);
    gw.with_devices(&[(id, SMOKE_MODEL, 6)]);

    gw.control(ControlOp::PropertyDeltas(vec![PropertyDelta::new(
        id,
        props::MUTE,
        true,
    )]));
    assert_eq!(
        gw.sink.take(),
        vec![Command::SounderEnable { id, enabled: false }.to_vec()]
    );
    assert_eq!(gw.reported(id, props::MUTE), Some(true.into()));
}

#[test]
fn test_identify_device_targets_its_sid() {
    let mut gw = Gateway::new();
    let id = device(9);
    gw.with_devices(&[(id, SMOKE_MODEL, 9)]);

    gw.control(ControlOp::IdentifyDevice(id));
    assert_eq!(gw.sink.take(), vec![Command::RumourTarget { sid: 9 }.to_vec()]);
}

#[test]
fn test_issue_test_uses_first_device() {
    let mut gw = Gateway::new();
    let id = device(2);
    gw.with_devices(&[(id, SMOKE_MODEL, 2)]);

    gw.control(ControlOp::IssueTest);
    assert_eq!(
        gw.sink.take(),
        vec![Command::DeviceTest {
            id,
            model: SMOKE_MODEL,
            priority: 129
        }
        .to_vec()]
    );
}

#[test]
fn test_malformed_frames_dropped() {
    let mut gw = Gateway::new();
    gw.receive(&[]);
    gw.receive(&[0x99, 0x01]);
    gw.receive(&[0x71, 0x01, 0x02]);
    gw.receive(&[0xd4, 0x77]);
    assert!(gw.sink.is_empty());
    assert_eq!(gw.engine.shadow().device_count(), 1);
}

#[test]
fn test_run_loop_handles_messages_in_order() {
    let config = GatewayConfig::default();
    let sink = RecordingSink::new();
    let pool = BufferPool::new(4);
    let ctx = Context::new(
        MemoryShadow::new(),
        pool.clone(),
        Arc::new(sink.clone()),
        Arc::new(SystemClock),
    );
    let mut engine = Engine::new(&config, ctx);
    engine.start();

    let (tx, rx) = crossbeam_channel::unbounded::<GatewayMessage>();
    let status = pool.acquire_with(&[0x41]).expect("buffer");
    tx.send(GatewayMessage::from(status)).expect("send");
    tx.send(GatewayMessage::Control(ControlOp::Locate)).expect("send");
    tx.send(GatewayMessage::Shutdown).expect("send");

    let handle = thread::spawn(move || {
        engine.run(rx);
        engine
    });
    let engine = handle.join().expect("engine thread");

    assert_eq!(
        sink.take(),
        vec![Command::gateway_ident().to_vec(), Command::Locate.to_vec()]
    );
    assert!(engine.shadow().is_registered(DeviceId::GATEWAY));
    assert_eq!(pool.available(), 4);
}
