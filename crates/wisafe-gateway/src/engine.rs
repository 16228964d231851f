//! The consumer loop: decodes received frames, applies control operations and
//! fires timers, all on one thread.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, trace, warn};
use wisafe_link::{dump, Buffer};
use wisafe_metrics::metric_defs;
use wisafe_protocol::{command_name, Command, DeviceId, Message, GATEWAY_PRIORITY};

use crate::config::GatewayConfig;
use crate::context::Context;
use crate::control::{ControlOp, PropertyDelta};
use crate::discovery::Discovery;
use crate::event::EventCorrelator;
use crate::profile::WISAFE_TYPE_FLAG;
use crate::shadow::{props, GatewayState, Online, PropertyValue, Shadow};
use crate::timer::TimerKind;

/// Everything the engine thread consumes, in arrival order.
#[derive(Debug)]
pub enum GatewayMessage {
    /// A decoded-from-the-wire frame.
    Received(Buffer),
    /// A control operation.
    Control(ControlOp),
    /// Stop the loop.
    Shutdown,
}

impl From<Buffer> for GatewayMessage {
    fn from(buffer: Buffer) -> Self {
        GatewayMessage::Received(buffer)
    }
}

/// Gateway properties the platform drives, with their initial values.
const GATEWAY_TRIGGERS: &[(&str, PropertyValue)] = &[
    (props::CMD_TEST_MODE, PropertyValue::Integer(0)),
    (props::CMD_TEST_MODE_FLUSH, PropertyValue::Bool(false)),
    (props::CMD_LEARN, PropertyValue::Integer(0)),
    (props::CMD_LEARN_TIMEOUT, PropertyValue::Integer(0)),
    (props::CMD_FLUSH, PropertyValue::Integer(0)),
    (props::IN_NETWORK, PropertyValue::Bool(false)),
    (props::CMD_DELETE_ALL, PropertyValue::Integer(0)),
    (props::CMD_SOUNDER_TEST, PropertyValue::Integer(0)),
    (props::CMD_SILENCE_ALL, PropertyValue::Integer(0)),
    (props::CMD_LOCATE, PropertyValue::Integer(0)),
];

/// Gateway properties whose desired changes are delivered as deltas.
const GATEWAY_SUBSCRIPTIONS: &[&str] = &[
    props::CMD_TEST_MODE,
    props::CMD_LEARN,
    props::CMD_FLUSH,
    props::CMD_DELETE_ALL,
    props::STATE,
    props::CMD_SOUNDER_TEST,
    props::CMD_SILENCE_ALL,
    props::CMD_LOCATE,
];

/// The gateway engine.
pub struct Engine<S: Shadow> {
    ctx: Context<S>,
    discovery: Discovery,
    events: EventCorrelator,
}

impl<S: Shadow> Engine<S> {
    /// Create an engine. Call [`start`](Self::start) before feeding it.
    pub fn new(config: &GatewayConfig, ctx: Context<S>) -> Self {
        Self {
            ctx,
            discovery: Discovery::new(config.discovery.clone()),
            events: EventCorrelator::new(config.events.clone()),
        }
    }

    /// Make sure the gateway device and its properties exist, then start
    /// discovery.
    pub fn start(&mut self) {
        let gateway = DeviceId::GATEWAY;
        if !self.ctx.shadow.is_registered(gateway) {
            let device_type = WISAFE_TYPE_FLAG | u32::from(GATEWAY_PRIORITY);
            if let Err(e) = self.ctx.shadow.register_device(gateway, device_type) {
                error!("Failed to register the gateway device: {}", e);
            }
        }

        for (name, initial) in GATEWAY_TRIGGERS {
            if self.ctx.reported(gateway, name).is_none() {
                self.ctx.report(gateway, name, initial.clone());
            }
        }
        self.ctx.report(gateway, props::STATE, GatewayState::Running);
        for name in GATEWAY_SUBSCRIPTIONS {
            if let Err(e) = self.ctx.shadow.subscribe_desired(gateway, name) {
                error!("Failed to subscribe to {}: {}", name, e);
            }
        }

        self.discovery.start(&mut self.ctx);
        info!("Engine started");
    }

    /// The shared context.
    pub fn context(&self) -> &Context<S> {
        &self.ctx
    }

    /// The shared context, mutably.
    pub fn context_mut(&mut self) -> &mut Context<S> {
        &mut self.ctx
    }

    /// The device shadow.
    pub fn shadow(&self) -> &S {
        &self.ctx.shadow
    }

    /// Network membership state.
    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Pending event state.
    pub fn events(&self) -> &EventCorrelator {
        &self.events
    }

    /// Handle one inbound message. Returns false on shutdown.
    pub fn handle(&mut self, message: GatewayMessage) -> bool {
        match message {
            GatewayMessage::Received(frame) => self.process_received(&frame),
            GatewayMessage::Control(op) => self.process_control(op),
            GatewayMessage::Shutdown => {
                info!("Engine shutting down");
                return false;
            }
        }
        true
    }

    /// Run until shutdown or until every sender is gone.
    pub fn run(&mut self, receiver: Receiver<GatewayMessage>) {
        loop {
            self.run_expired_timers();

            let message = match self.ctx.timers().next_deadline() {
                Some(deadline) => match receiver.recv_deadline(deadline) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match receiver.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };

            if !self.handle(message) {
                break;
            }
        }
        debug!("Engine loop exited");
    }

    /// Fire every timer whose deadline has passed.
    pub fn run_expired_timers(&mut self) {
        let now = self.ctx.now();
        while let Some((_, kind)) = self.ctx.timers().pop_expired(now) {
            self.process_timer(kind);
        }
    }

    /// Handle one expired timer.
    pub fn process_timer(&mut self, kind: TimerKind) {
        trace!("Timer {:?} fired", kind);
        match kind {
            TimerKind::FaultTimeout(_) | TimerKind::AlarmTimeout(_) => {
                self.events.on_timeout(&mut self.ctx, kind)
            }
            _ => self.discovery.on_timer(&mut self.ctx, kind),
        }
    }

    // ------------------------------------------------------------------
    // Received frames
    // ------------------------------------------------------------------

    /// Decode and route one unescaped frame.
    pub fn process_received(&mut self, frame: &[u8]) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping received frame: {}", e);
                dump("Dropped", frame);
                metrics::counter!(metric_defs::ENGINE_DROPPED.name, "reason" => e.reason())
                    .increment(1);
                return;
            }
        };
        if let Some(&code) = frame.first() {
            metrics::counter!(metric_defs::ENGINE_FRAMES.name, "command" => command_name(code))
                .increment(1);
        }

        if let Some((id, seq)) = message.sequence() {
            if self.is_duplicate(id, seq) {
                warn!("Duplicate message ignored for device {}", id);
                metrics::counter!(metric_defs::ENGINE_DUPLICATES.name).increment(1);
                return;
            }
        }

        let ctx = &mut self.ctx;
        match message {
            Message::Ack => trace!("ACK"),
            Message::Nack => warn!("NACK from radio module"),
            Message::StatusRequest => {
                if !ctx.send(&Command::gateway_ident()) {
                    error!("Failed to answer status request");
                }
            }
            Message::SidMap(map) => self.discovery.process_sid_map(ctx, map),
            Message::MissingNodes(map) => self.discovery.missing_node_report(ctx, map),
            Message::SidMapUpdate(map) => self.discovery.process_sid_map_update(ctx, map),
            Message::RemoteStatus(status) => self.events.remote_status(ctx, &status),
            Message::RemoteIdReport => debug!("Remote ID report ignored"),
            Message::RumourTarget { sid, reasons } => {
                self.discovery.rumour_target_response(ctx, sid, reasons)
            }
            Message::DeviceTested(msg) => {
                self.discovery
                    .device_tested(ctx, &msg, Online::Unknown, true)
            }
            Message::RemoteId(msg) => self.discovery.remote_id_received(ctx, &msg),
            Message::Fault(report) => self.events.fault(ctx, &report, frame),
            Message::Alarm(report) => self.events.alarm(ctx, &report, frame),
            Message::Variable(report) => self.events.variable(ctx, &report),
            Message::FaultDetails(report) => self.events.fault_details(ctx, &report),
            Message::AlarmStop(event) => self.events.alarm_stop(ctx, &event),
            Message::Hush(event) => self.events.hush(ctx, &event),
            Message::Locate(report) => self.events.locate(ctx, &report),
            Message::RmDiagnostic(status) => self.discovery.process_rm_diagnostic(ctx, &status),
            Message::RmSdFault(report) => self.events.rm_sd_fault(ctx, &report),
        }
    }

    /// Compare `seq` with the last sequence seen from `id`, then remember it.
    ///
    /// The stored sequence is updated even when the message is a duplicate.
    fn is_duplicate(&mut self, id: DeviceId, seq: u8) -> bool {
        let last = self
            .ctx
            .reported(id, props::LAST_SEQUENCE)
            .and_then(|v| v.as_u8());
        if self.ctx.shadow.is_registered(id) {
            self.ctx.report(id, props::LAST_SEQUENCE, seq);
        }
        last == Some(seq)
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Apply a control operation.
    pub fn process_control(&mut self, op: ControlOp) {
        debug!("Control operation {:?}", op);
        let ctx = &mut self.ctx;
        match op {
            ControlOp::BeginMissingNodeScan { delete } => self.discovery.test_mode(ctx, true, delete),
            ControlOp::StopMissingNodeScan => self.discovery.test_mode(ctx, false, false),
            ControlOp::IssueTest => self.issue_test(),
            ControlOp::Learn {
                enabled,
                timeout_secs,
            } => self.discovery.set_learn_mode(ctx, enabled, timeout_secs),
            ControlOp::Leave => self.discovery.leave(ctx),
            ControlOp::FlushAll => self.discovery.flush_all(ctx),
            ControlOp::Flush(id) => self.discovery.flush(ctx, id),
            ControlOp::IdentifyDevice(id) => self.identify_device(id),
            ControlOp::SilenceAll => self.transmit(&Command::Hush),
            ControlOp::Locate => self.transmit(&Command::Locate),
            ControlOp::SounderEnable { id, enabled } => {
                self.transmit(&Command::SounderEnable { id, enabled })
            }
            ControlOp::PropertyDeltas(deltas) => self.property_deltas(&deltas),
        }
    }

    fn transmit(&mut self, command: &Command) {
        if !self.ctx.send(command) {
            error!("Failed to send {}", command_name(command.code()));
        }
    }

    /// Sound a test, attributed to the first known device.
    fn issue_test(&mut self) {
        let Some(id) = self.ctx.mesh_devices().first().copied() else {
            error!("No devices to issue a test from");
            return;
        };
        let priority = self
            .ctx
            .reported(id, props::TYPE)
            .and_then(|v| v.as_u32())
            .and_then(|t| u8::try_from(t & !WISAFE_TYPE_FLAG).ok());
        let model = self
            .ctx
            .reported(id, props::MODEL_VALUE)
            .and_then(|v| v.as_i64())
            .and_then(|m| u16::try_from(m).ok());
        match (priority, model) {
            (Some(priority), Some(model)) => {
                info!("Issuing test from device {}", id);
                self.transmit(&Command::DeviceTest {
                    id,
                    model,
                    priority,
                });
            }
            _ => error!("Device {} has no type or model, cannot issue test", id),
        }
    }

    fn identify_device(&mut self, id: DeviceId) {
        match self.ctx.reported(id, props::SID).and_then(|v| v.as_u8()) {
            Some(sid) => self.transmit(&Command::RumourTarget { sid }),
            None => error!("Cannot identify device {}: no SID", id),
        }
    }

    /// Translate desired property changes into operations.
    ///
    /// A group that carries a learn trigger handles the gateway state through
    /// it, so a `state` delta in the same group is skipped.
    pub fn property_deltas(&mut self, deltas: &[PropertyDelta]) {
        let has_learn = deltas
            .iter()
            .any(|d| d.device.is_gateway() && d.name == props::CMD_LEARN);
        for delta in deltas {
            if has_learn && delta.device.is_gateway() && delta.name == props::STATE {
                continue;
            }
            if delta.device.is_gateway() {
                self.gateway_delta(delta);
            } else {
                self.device_delta(delta);
            }
        }
    }

    fn gateway_delta(&mut self, delta: &PropertyDelta) {
        let gateway = DeviceId::GATEWAY;
        match delta.name.as_str() {
            props::CMD_TEST_MODE => {
                let flush = match self
                    .ctx
                    .shadow
                    .get_desired(gateway, props::CMD_TEST_MODE_FLUSH)
                    .ok()
                    .and_then(|v| v.as_bool())
                {
                    Some(flush) => flush,
                    None => {
                        error!("Test mode requested without a flush flag");
                        return;
                    }
                };
                self.ctx.report(gateway, props::STATE, GatewayState::TestMode);
                self.discovery.test_mode(&mut self.ctx, true, flush);
                self.ctx.report(gateway, props::CMD_TEST_MODE, delta.value.clone());
                self.ctx.report(gateway, props::CMD_TEST_MODE_FLUSH, flush);
            }
            props::CMD_LEARN => {
                let desired_state = self
                    .ctx
                    .shadow
                    .get_desired(gateway, props::STATE)
                    .ok()
                    .as_ref()
                    .and_then(GatewayState::from_value);
                let timeout = self
                    .ctx
                    .shadow
                    .get_desired(gateway, props::CMD_LEARN_TIMEOUT)
                    .ok()
                    .and_then(|v| v.as_u32())
                    .unwrap_or(0);

                if desired_state == Some(GatewayState::Learning) && timeout != 0 {
                    self.discovery.set_learn_mode(&mut self.ctx, true, timeout);
                    self.ctx.report(gateway, props::CMD_LEARN, delta.value.clone());
                    self.ctx.report(gateway, props::CMD_LEARN_TIMEOUT, timeout);
                } else {
                    self.ctx.report(gateway, props::CMD_LEARN, delta.value.clone());
                    self.discovery.set_learn_mode(&mut self.ctx, false, 0);
                }
            }
            props::STATE => {
                let desired = GatewayState::from_value(&delta.value);
                let current = self
                    .ctx
                    .reported(gateway, props::STATE)
                    .as_ref()
                    .and_then(GatewayState::from_value);
                match (current, desired) {
                    (Some(GatewayState::Learning), Some(GatewayState::Running)) => {
                        self.discovery.set_learn_mode(&mut self.ctx, false, 0)
                    }
                    (Some(GatewayState::TestMode), Some(GatewayState::Running)) => {
                        self.discovery.test_mode(&mut self.ctx, false, false)
                    }
                    _ => debug!("Ignoring state change {:?} -> {:?}", current, desired),
                }
            }
            props::CMD_FLUSH => self.discovery.leave(&mut self.ctx),
            props::CMD_DELETE_ALL => self.discovery.flush_all(&mut self.ctx),
            props::CMD_SOUNDER_TEST => {
                self.issue_test();
                self.ctx.report(gateway, props::CMD_SOUNDER_TEST, delta.value.clone());
            }
            props::CMD_SILENCE_ALL => {
                self.transmit(&Command::Hush);
                self.ctx.report(gateway, props::CMD_SILENCE_ALL, delta.value.clone());
            }
            props::CMD_LOCATE => {
                self.transmit(&Command::Locate);
                self.ctx.report(gateway, props::CMD_LOCATE, delta.value.clone());
            }
            other => debug!("Ignoring gateway delta for {}", other),
        }
    }

    fn device_delta(&mut self, delta: &PropertyDelta) {
        let id = delta.device;
        match delta.name.as_str() {
            props::MUTE => match delta.value.as_bool() {
                Some(mute) => {
                    self.transmit(&Command::SounderEnable { id, enabled: !mute });
                    self.ctx.report(id, props::MUTE, mute);
                }
                None => warn!("Mute delta for {} is not a boolean", id),
            },
            props::CMD_IDENTIFY_DEVICE => {
                self.identify_device(id);
                self.ctx.report(id, props::CMD_IDENTIFY_DEVICE, delta.value.clone());
            }
            props::CMD_DEVICE_FLUSH => {
                if delta.value.as_bool() == Some(true) {
                    self.discovery.flush(&mut self.ctx, id);
                }
            }
            other => debug!("Ignoring delta for {} on device {}", other, id),
        }
    }
}
