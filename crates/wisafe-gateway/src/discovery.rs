//! Network membership: SID map tracking, missing-node testing, interrogation
//! of unknown SIDs, learn mode and flushing.
//!
//! All state here is owned by the engine thread. Timers are requested through
//! the [`Context`] and come back as [`TimerKind`]s via [`Discovery::on_timer`].
//!
//! A missing-node scan works in two phases. First the current SID map is sent
//! as a probe up to `required_scans` times; each reply narrows the set of SIDs
//! that have been missing every time. If the scan may delete devices and some
//! SIDs stayed missing, the map without them is pushed to the network up to
//! `update_delete_count` times before the offline devices are removed from the
//! shadow.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use wisafe_metrics::metric_defs;
use wisafe_protocol::{
    Command, DeviceId, DeviceTested, RadioStatus, SidMap, GATEWAY_MODEL, GATEWAY_PRIORITY,
    GATEWAY_SID_UNLEARNT, SID_COUNT,
};

use crate::config::DiscoveryConfig;
use crate::context::Context;
use crate::profile::{device_type_for, find_profile};
use crate::shadow::{props, GatewayState, Online, PropertyValue, Shadow};
use crate::timer::{TimerHandle, TimerKind};

/// Delay before re-running a scan that was queued behind a flush.
const RERUN_DELAY: Duration = Duration::from_millis(1);

/// Retry delay when no buffer was free for a probe.
const PROBE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Manufacturer reported for every WiSafe device.
pub const MANUFACTURER: &str = "Sprue";

/// Where a missing-node scan is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    /// No scan running.
    Idle,
    /// Probing the network with the current SID map.
    Probing,
    /// Pushing the reduced SID map that drops missing devices.
    UpdatingMap,
}

#[derive(Debug)]
struct MissingNodeScan {
    active: bool,
    started: Option<Instant>,
    last_request: Option<Instant>,
    delete: bool,
    replies: u32,
    outstanding: u32,
    removal: SidMap,
    update_count: u32,
    ran_out_of_time: bool,
    rerun: bool,
    flushing_all: u8,
}

impl Default for MissingNodeScan {
    fn default() -> Self {
        Self {
            active: false,
            started: None,
            last_request: None,
            delete: false,
            replies: 0,
            outstanding: 0,
            removal: SidMap::from_bits(u64::MAX),
            update_count: 0,
            ran_out_of_time: false,
            rerun: false,
            flushing_all: 0,
        }
    }
}

#[derive(Debug)]
struct Interrogation {
    active: bool,
    cursor: u8,
    attempts: [u8; SID_COUNT],
}

impl Default for Interrogation {
    fn default() -> Self {
        Self {
            active: false,
            cursor: 0,
            attempts: [0; SID_COUNT],
        }
    }
}

/// Network membership state.
#[derive(Debug)]
pub struct Discovery {
    config: DiscoveryConfig,
    current: SidMap,
    in_network: bool,
    learning: bool,
    gateway_sid: u8,
    unknown: u32,
    diagnostics_requested: bool,
    scan: MissingNodeScan,
    interrogation: Interrogation,
    refresh_timer: Option<TimerHandle>,
    missing_timer: Option<TimerHandle>,
    learn_timer: Option<TimerHandle>,
    interrogate_timer: Option<TimerHandle>,
}

impl Discovery {
    /// Create with nothing known about the network.
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            current: SidMap::EMPTY,
            in_network: false,
            learning: false,
            gateway_sid: GATEWAY_SID_UNLEARNT,
            unknown: 0,
            diagnostics_requested: false,
            scan: MissingNodeScan::default(),
            interrogation: Interrogation::default(),
            refresh_timer: None,
            missing_timer: None,
            learn_timer: None,
            interrogate_timer: None,
        }
    }

    /// The last SID map received.
    pub fn current_map(&self) -> SidMap {
        self.current
    }

    /// True if the last SID map showed the gateway joined to a network.
    pub fn in_network(&self) -> bool {
        self.in_network
    }

    /// True while learn mode is on.
    pub fn is_learning(&self) -> bool {
        self.learning
    }

    /// The gateway radio module's SID, or 64 if not yet known.
    pub fn gateway_sid(&self) -> u8 {
        self.gateway_sid
    }

    /// SIDs in the map with no registered device, not counting the gateway.
    pub fn unknown_count(&self) -> u32 {
        self.unknown
    }

    /// True while unknown SIDs are being asked for their identity.
    pub fn is_interrogating(&self) -> bool {
        self.interrogation.active
    }

    /// Current missing-node scan phase.
    pub fn scan_phase(&self) -> ScanPhase {
        match (self.scan.active, self.scan.update_count) {
            (false, _) => ScanPhase::Idle,
            (true, 0) => ScanPhase::Probing,
            (true, _) => ScanPhase::UpdatingMap,
        }
    }

    /// Reset network flags, initialise known devices and schedule the first
    /// SID map request and missing-node test.
    pub fn start<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        self.in_network = false;
        ctx.report(DeviceId::GATEWAY, props::IN_NETWORK, false);
        self.interrogation.active = false;
        ctx.report(DeviceId::GATEWAY, props::INTERROGATING, false);

        ctx.restart(
            &mut self.refresh_timer,
            TimerKind::RetrieveSidMap,
            self.config.startup_fetch,
        );
        ctx.restart(
            &mut self.missing_timer,
            TimerKind::TestMissingInit,
            self.config.missing_test_period,
        );

        for id in ctx.mesh_devices() {
            init_device_properties(ctx, id);
        }
    }

    /// Handle a discovery timer. Other timer kinds are ignored.
    pub fn on_timer<S: Shadow>(&mut self, ctx: &mut Context<S>, kind: TimerKind) {
        match kind {
            TimerKind::RetrieveSidMap => {
                self.refresh_timer = None;
                self.refresh(ctx);
            }
            TimerKind::TestMissingInit => {
                self.missing_timer = None;
                self.scan.delete = true;
                self.init_missing_node_scan(ctx);
            }
            TimerKind::TestMissingTimeout => {
                self.missing_timer = None;
                self.probe_timed_out(ctx);
            }
            TimerKind::TestMissingContinue => {
                self.missing_timer = None;
                self.continue_missing_node_scan(ctx);
            }
            TimerKind::TestMissingUpdateMap => {
                self.missing_timer = None;
                self.update_map_at_end(ctx);
            }
            TimerKind::LearnModeTimeout => {
                self.learn_timer = None;
                info!("Learn mode timed out");
                self.set_learn_mode(ctx, false, 0);
            }
            TimerKind::Interrogate => {
                self.interrogate_timer = None;
                self.interrogate_continue(ctx);
            }
            TimerKind::FaultTimeout(_) | TimerKind::AlarmTimeout(_) => {}
        }
    }

    fn refresh<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        if self.scan.active {
            info!("Missing node test in progress, skipping SID map request");
        } else if !ctx.send(&Command::RequestSidMap) {
            error!("Failed to send SID map request");
        }

        let period = if self.learning {
            self.config.learn_refresh
        } else {
            self.config.normal_refresh
        };
        ctx.restart(&mut self.refresh_timer, TimerKind::RetrieveSidMap, period);
    }

    // ------------------------------------------------------------------
    // SID map
    // ------------------------------------------------------------------

    /// A new SID map arrived from the radio module.
    pub fn process_sid_map<S: Shadow>(&mut self, ctx: &mut Context<S>, map: SidMap) {
        let known = known_sids(ctx);
        let unknown = map.difference(known);
        for sid in unknown.iter().filter(|&sid| sid != self.gateway_sid) {
            debug!("No device registered for SID {}", sid);
        }

        let in_network = map.in_network();
        if in_network != self.in_network {
            if in_network {
                info!("Gateway joined a network ({} SIDs)", map.count());
            } else {
                info!("Gateway is not in a network");
            }
        }
        self.in_network = in_network;
        ctx.report(DeviceId::GATEWAY, props::IN_NETWORK, in_network);

        let need_diagnostics = !self.diagnostics_requested
            || (in_network && self.gateway_sid == GATEWAY_SID_UNLEARNT);
        if need_diagnostics && ctx.send(&Command::RmDiagnosticRequest) {
            self.diagnostics_requested = true;
        }

        // The gateway's own SID is never registered in the shadow.
        self.unknown = unknown.count().saturating_sub(1);
        ctx.report(DeviceId::GATEWAY, props::UNKNOWN_SIDS, self.unknown);
        metrics::gauge!(metric_defs::DISCOVERY_UNKNOWN.name).set(f64::from(self.unknown));

        self.current = map;
        self.interrogate_check(ctx);
    }

    /// The radio module acknowledged a SID map update: anything no longer in
    /// the map is offline and flagged missing.
    pub fn process_sid_map_update<S: Shadow>(&mut self, ctx: &mut Context<S>, map: SidMap) {
        for id in ctx.mesh_devices() {
            let Some(sid) = device_sid(ctx, id) else {
                continue;
            };
            if !map.contains(sid) {
                info!("Device {} (SID {}) dropped from the SID map", id, sid);
                ctx.report(id, props::ONLINE, Online::Offline);
                ctx.report(id, props::DEVICE_MISSING, true);
            }
        }
    }

    /// The local radio module reported its diagnostics.
    pub fn process_rm_diagnostic<S: Shadow>(&mut self, ctx: &mut Context<S>, status: &RadioStatus) {
        info!(
            "RM diagnostic result from device {}, SID {}, firmware {:x}",
            status.id, status.sid, status.fw_rev
        );
        self.gateway_sid = status.sid;
        ctx.report(status.id, props::RADIO_FAULT_COUNT, status.radio_faults);
        ctx.report(status.id, props::RADIO_RSSI, status.rssi);
    }

    /// A rumour target acknowledgement: start a test attributed to the gateway.
    pub fn rumour_target_response<S: Shadow>(
        &mut self,
        ctx: &mut Context<S>,
        sid: u8,
        reasons: u16,
    ) {
        debug!("Rumour target response for SID {}, reasons {:04x}", sid, reasons);
        let test = Command::DeviceTest {
            id: DeviceId::new(0),
            model: GATEWAY_MODEL,
            priority: GATEWAY_PRIORITY,
        };
        if !ctx.send(&test) {
            error!("Failed to send device test after rumour target");
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// A device identified itself. `real` is false when the report was
    /// synthesised from a remote-id reply, in which case a known device is
    /// left untouched.
    pub fn device_tested<S: Shadow>(
        &mut self,
        ctx: &mut Context<S>,
        msg: &DeviceTested,
        online: Online,
        real: bool,
    ) {
        if msg.sid as usize >= SID_COUNT {
            error!("Device {} reported invalid SID {}", msg.id, msg.sid);
            return;
        }
        if !self.current.contains(msg.sid) {
            warn!(
                "Device {} at SID {} is not in the current SID map, ignoring",
                msg.id, msg.sid
            );
            return;
        }

        if !ctx.shadow.is_registered(msg.id) {
            if self.unknown > 0 {
                self.unknown -= 1;
                ctx.report(DeviceId::GATEWAY, props::UNKNOWN_SIDS, self.unknown);
                metrics::gauge!(metric_defs::DISCOVERY_UNKNOWN.name).set(f64::from(self.unknown));
            } else {
                error!("New device {} but no SIDs were unknown", msg.id);
            }

            let (device_type, known_model) = device_type_for(msg.model, msg.priority);
            if !known_model {
                warn!(
                    "Unrecognised model {} for device {}, using priority {:02x}",
                    msg.model, msg.id, msg.priority
                );
            }
            if find_profile(device_type).is_none() {
                warn!("No profile for device type {:x}", device_type);
            }
            if let Err(e) = ctx.shadow.register_device(msg.id, device_type) {
                error!("Failed to register device {}: {}", msg.id, e);
                return;
            }
            info!("Registered device {} at SID {}", msg.id, msg.sid);
            metrics::counter!(metric_defs::DISCOVERY_REGISTERED.name).increment(1);

            init_device_properties(ctx, msg.id);
            write_identity(ctx, msg, online);
        } else if real {
            write_identity(ctx, msg, online);
        }
    }

    /// A reply to a remote-id request.
    pub fn remote_id_received<S: Shadow>(&mut self, ctx: &mut Context<S>, msg: &DeviceTested) {
        self.device_tested(ctx, msg, Online::Online, false);
        if self.interrogation.active {
            ctx.cancel(&mut self.interrogate_timer);
            self.interrogate_continue(ctx);
        }
    }

    // ------------------------------------------------------------------
    // Interrogation
    // ------------------------------------------------------------------

    fn interrogate_check<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        if self.scan.active {
            return;
        }
        if self.unknown > 0 {
            if !self.interrogation.active {
                self.interrogation.cursor = 0;
                self.set_interrogating(ctx, true);
                self.interrogate_continue(ctx);
            }
        } else if self.interrogation.active {
            ctx.cancel(&mut self.interrogate_timer);
            self.set_interrogating(ctx, false);
        }
    }

    fn interrogate_continue<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        if !self.interrogation.active {
            return;
        }

        let known = known_sids(ctx);
        let start = self.interrogation.cursor;
        let mut found = false;
        loop {
            let sid = self.interrogation.cursor;
            self.interrogation.cursor = (sid + 1) % SID_COUNT as u8;

            let slot = &mut self.interrogation.attempts[sid as usize];
            if !self.current.contains(sid) {
                *slot = 0;
            } else if sid != self.gateway_sid
                && !known.contains(sid)
                && *slot < self.config.max_interrogations
            {
                *slot += 1;
                info!("Requesting identity of SID {} (attempt {})", sid, *slot);
                if !ctx.send(&Command::RequestRemoteId { sid }) {
                    warn!("Failed to send remote id request for SID {}", sid);
                }
                ctx.restart(
                    &mut self.interrogate_timer,
                    TimerKind::Interrogate,
                    self.config.interrogation_period,
                );
                found = true;
                break;
            }

            if self.interrogation.cursor == start {
                break;
            }
        }

        if !found {
            debug!("No more unknown SIDs to interrogate");
            self.set_interrogating(ctx, false);
        }
    }

    fn set_interrogating<S: Shadow>(&mut self, ctx: &mut Context<S>, active: bool) {
        self.interrogation.active = active;
        ctx.report(DeviceId::GATEWAY, props::INTERROGATING, active);
    }

    // ------------------------------------------------------------------
    // Missing-node scan
    // ------------------------------------------------------------------

    fn init_missing_node_scan<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        if self.scan.active {
            warn!("Missing node test already running");
            return;
        }

        let delete = self.scan.delete;
        let flushing_all = self.scan.flushing_all;
        self.scan = MissingNodeScan {
            delete,
            flushing_all,
            ..MissingNodeScan::default()
        };

        if self.in_network {
            if self.learning {
                info!("In learn mode, skipping missing node test");
            } else if ctx.send(&Command::UpdateSidMap(self.current)) {
                info!("Starting missing node test (delete: {})", delete);
                let now = ctx.now();
                self.scan.active = true;
                self.scan.started = Some(now);
                self.scan.last_request = Some(now);
                self.scan.outstanding += 1;
                ctx.restart(
                    &mut self.missing_timer,
                    TimerKind::TestMissingTimeout,
                    self.config.reply_timeout,
                );
                return;
            } else {
                warn!("No buffer to start missing node test, retrying");
            }
        } else {
            info!("Not in a network, skipping missing node test");
            if self.scan.flushing_all > 0 {
                self.flush_all_complete(ctx);
            }
        }

        let delay = if self.in_network {
            self.config.min_spacing
        } else {
            self.config.missing_test_period
        };
        ctx.restart(&mut self.missing_timer, TimerKind::TestMissingInit, delay);
    }

    fn probe_timed_out<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        warn!("Missing node test: no reply to probe");
        self.continue_missing_node_scan(ctx);
    }

    fn continue_missing_node_scan<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        if self.elapsed_since_start(ctx) > self.config.max_test_duration {
            warn!("Missing node test ran out of time");
            self.scan.ran_out_of_time = true;
            self.update_map_at_end(ctx);
            return;
        }

        if ctx.send(&Command::UpdateSidMap(self.current)) {
            self.scan.last_request = Some(ctx.now());
            self.scan.outstanding += 1;
            ctx.restart(
                &mut self.missing_timer,
                TimerKind::TestMissingTimeout,
                self.config.reply_timeout,
            );
        } else {
            ctx.restart(
                &mut self.missing_timer,
                TimerKind::TestMissingTimeout,
                PROBE_RETRY_DELAY,
            );
        }
    }

    /// The radio module reported which SIDs did not answer a probe.
    pub fn missing_node_report<S: Shadow>(&mut self, ctx: &mut Context<S>, map: SidMap) {
        if self.scan.outstanding > 0 {
            if self.elapsed_since_start(ctx) > self.config.max_test_duration {
                warn!("Missing node report arrived after the test deadline");
                self.scan.ran_out_of_time = true;
                self.update_map_at_end(ctx);
                return;
            }

            self.scan.replies += 1;
            self.scan.outstanding -= 1;
            ctx.cancel(&mut self.missing_timer);
            self.scan.removal = self.scan.removal.intersection(map);
            debug!(
                "Missing node report {}: {} (still missing {})",
                self.scan.replies, map, self.scan.removal
            );

            if self.scan.replies >= self.config.required_scans || self.scan.removal.is_empty() {
                self.mark_devices(ctx);
                self.update_map_at_end(ctx);
            } else {
                let elapsed = self
                    .scan
                    .last_request
                    .map(|t| ctx.now().saturating_duration_since(t))
                    .unwrap_or_default();
                if elapsed >= self.config.min_spacing {
                    self.continue_missing_node_scan(ctx);
                } else {
                    ctx.restart(
                        &mut self.missing_timer,
                        TimerKind::TestMissingContinue,
                        self.config.min_spacing - elapsed,
                    );
                }
            }
        } else if self.scan.update_count > 0 && map.is_empty() {
            info!("SID map update confirmed by the network");
            self.scan.update_count = self.config.update_delete_count;
            self.update_map_at_end(ctx);
        } else {
            info!("Ignoring unsolicited missing node report {}", map);
        }
    }

    fn mark_devices<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        for id in ctx.mesh_devices() {
            let Some(sid) = device_sid(ctx, id) else {
                warn!("Device {} has no SID", id);
                continue;
            };
            let flagged = ctx
                .reported(id, props::DEVICE_MISSING)
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let online = if self.scan.removal.contains(sid) || flagged {
                Online::Offline
            } else {
                Online::Online
            };
            ctx.report(id, props::ONLINE, online);
        }
    }

    fn update_map_at_end<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        ctx.cancel(&mut self.missing_timer);
        let completed = self.scan.update_count >= self.config.update_delete_count;

        if self.scan.ran_out_of_time || completed || !self.scan.delete {
            if self.scan.delete && !self.scan.ran_out_of_time {
                self.delete_offline_devices(ctx);
            }
            if self.scan.flushing_all > 0 {
                self.scan.flushing_all -= 1;
                if self.scan.flushing_all == 0 {
                    self.flush_all_complete(ctx);
                }
            }

            info!("Missing node test finished");
            metrics::counter!(metric_defs::DISCOVERY_SCANS.name).increment(1);
            self.scan.update_count = 0;
            self.scan.active = false;
            self.scan.delete = false;

            let delay = if self.scan.rerun {
                self.scan.rerun = false;
                RERUN_DELAY
            } else {
                self.config.missing_test_period
            };
            ctx.restart(&mut self.missing_timer, TimerKind::TestMissingInit, delay);
            end_test_mode(ctx, true);
            return;
        }

        if self.scan.update_count == 0 {
            let kept = self.current.difference(self.scan.removal);
            let any_missing = kept != self.current;
            // Only the gateway left: clear the map entirely.
            let kept = if kept.count() == 1 { SidMap::EMPTY } else { kept };
            self.scan.outstanding = 0;
            self.scan.removal = kept;

            if !any_missing {
                self.scan.update_count = self.config.update_delete_count;
                self.update_map_at_end(ctx);
                if self.scan.flushing_all > 0 {
                    self.flush_all_complete(ctx);
                }
                return;
            }
        }

        if ctx.send(&Command::UpdateSidMap(self.scan.removal)) {
            self.scan.update_count += 1;
            info!(
                "Sent reduced SID map {} ({} of {})",
                self.scan.removal, self.scan.update_count, self.config.update_delete_count
            );
        }
        ctx.restart(
            &mut self.missing_timer,
            TimerKind::TestMissingUpdateMap,
            self.config.update_delete_period,
        );
    }

    fn delete_offline_devices<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        for id in ctx.mesh_devices() {
            match ctx.reported(id, props::ONLINE).as_ref().and_then(Online::from_value) {
                Some(Online::Offline) => match ctx.shadow.delete_device(id) {
                    Ok(()) => {
                        info!("Deleted offline device {}", id);
                        metrics::counter!(metric_defs::DISCOVERY_DELETED.name).increment(1);
                    }
                    Err(e) => error!("Failed to delete device {}: {}", id, e),
                },
                Some(_) => {}
                None => error!("Failed to read online status of device {}", id),
            }
        }
    }

    fn cancel_missing_node_test<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        if self.scan.active {
            info!("Cancelling missing node test");
            self.scan.ran_out_of_time = true;
            self.update_map_at_end(ctx);
        }
    }

    fn elapsed_since_start<S: Shadow>(&self, ctx: &Context<S>) -> Duration {
        self.scan
            .started
            .map(|t| ctx.now().saturating_duration_since(t))
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Start or stop a missing-node test on request. `delete` decides whether
    /// devices still missing at the end are removed.
    pub fn test_mode<S: Shadow>(&mut self, ctx: &mut Context<S>, enabled: bool, delete: bool) {
        self.scan.delete = delete;
        if enabled == self.scan.active {
            info!("Missing node test already {}", if enabled { "running" } else { "stopped" });
            return;
        }

        if enabled {
            if self.interrogation.active {
                ctx.cancel(&mut self.interrogate_timer);
            }
            self.set_interrogating(ctx, false);
            if let Err(e) = ctx
                .shadow
                .delete_property(DeviceId::GATEWAY, props::CMD_TEST_MODE_RESULT)
            {
                if !e.is_not_found() {
                    error!("Failed to clear test result: {}", e);
                }
            }

            if !self.in_network {
                info!("Not in a network, test mode has nothing to do");
                end_test_mode(ctx, true);
            } else {
                ctx.cancel(&mut self.missing_timer);
                self.init_missing_node_scan(ctx);
            }
        } else {
            self.cancel_missing_node_test(ctx);
        }
    }

    /// Turn learn mode on or off. A zero timeout with `enabled` keeps learn
    /// mode on until it is turned off.
    pub fn set_learn_mode<S: Shadow>(&mut self, ctx: &mut Context<S>, enabled: bool, timeout_secs: u32) {
        if enabled == self.learning {
            warn!("Learn mode already {}", if enabled { "on" } else { "off" });
            return;
        }
        self.learning = enabled;

        if enabled {
            info!("Entering learn mode for {}s", timeout_secs);
            ctx.report(DeviceId::GATEWAY, props::STATE, GatewayState::Learning);
            if !self.in_network && !ctx.send(&Command::LearnIn) {
                error!("Failed to send learn-in button press");
            }
            ctx.restart(
                &mut self.refresh_timer,
                TimerKind::RetrieveSidMap,
                self.config.learn_refresh,
            );
            if timeout_secs > 0 {
                ctx.restart(
                    &mut self.learn_timer,
                    TimerKind::LearnModeTimeout,
                    Duration::from_secs(u64::from(timeout_secs)),
                );
            } else {
                ctx.cancel(&mut self.learn_timer);
            }
        } else {
            info!("Leaving learn mode");
            ctx.report(DeviceId::GATEWAY, props::STATE, GatewayState::Running);
            ctx.restart(
                &mut self.refresh_timer,
                TimerKind::RetrieveSidMap,
                self.config.normal_refresh,
            );
            ctx.cancel(&mut self.learn_timer);
        }
    }

    /// Leave the network. Not supported by the radio module.
    pub fn leave<S: Shadow>(&mut self, _ctx: &mut Context<S>) {
        error!("Leaving the network is not supported");
    }

    /// Remove every device: mark them all offline and push an emptied map.
    pub fn flush_all<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        if self.scan.flushing_all > 0 {
            error!("Delete all already in progress");
            return;
        }
        self.cancel_missing_node_test(ctx);

        for id in ctx.mesh_devices() {
            ctx.report(id, props::ONLINE, Online::Offline);
        }

        info!("Deleting all devices");
        self.scan.removal = self.current;
        self.scan.update_count = 0;
        self.scan.ran_out_of_time = false;
        self.scan.delete = true;
        self.scan.active = true;
        self.scan.rerun = true;
        self.scan.flushing_all = 2;
        self.update_map_at_end(ctx);
    }

    fn flush_all_complete<S: Shadow>(&mut self, ctx: &mut Context<S>) {
        self.scan.flushing_all = 0;
        info!("Delete all complete");
        match ctx.shadow.get_desired(DeviceId::GATEWAY, props::CMD_DELETE_ALL) {
            Ok(value) => ctx.report(DeviceId::GATEWAY, props::CMD_DELETE_ALL, value),
            Err(e) => debug!("No desired {}: {}", props::CMD_DELETE_ALL, e),
        }
    }

    /// Remove one device.
    pub fn flush<S: Shadow>(&mut self, ctx: &mut Context<S>, id: DeviceId) {
        let Some(sid) = device_sid(ctx, id) else {
            error!("Cannot flush device {}: no SID", id);
            return;
        };
        self.cancel_missing_node_test(ctx);

        info!("Flushing device {} at SID {}", id, sid);
        ctx.report(id, props::ONLINE, Online::Offline);
        self.scan.removal = SidMap::from_iter([sid]);
        self.scan.update_count = 0;
        self.scan.ran_out_of_time = false;
        self.scan.delete = true;
        self.scan.active = true;
        self.scan.rerun = true;
        self.update_map_at_end(ctx);
    }
}

/// Report the end of a test on the gateway and return it to running.
fn end_test_mode<S: Shadow>(ctx: &mut Context<S>, success: bool) {
    let result = ctx.shadow.set_reported_group(
        DeviceId::GATEWAY,
        vec![
            (props::CMD_TEST_MODE_RESULT.to_string(), success.into()),
            (props::STATE.to_string(), GatewayState::Running.into()),
        ],
    );
    if let Err(e) = result {
        error!("Failed to report test mode result: {}", e);
    }
}

/// Defaults and subscriptions every mesh device carries.
fn init_device_properties<S: Shadow>(ctx: &mut Context<S>, id: DeviceId) {
    ctx.report(id, props::FAULT, false);
    if ctx.reported(id, props::MUTE).is_none() {
        ctx.report(id, props::MUTE, false);
    }
    ctx.report(id, props::CMD_DEVICE_FLUSH, false);
    ctx.report(id, props::CMD_IDENTIFY_DEVICE, 0u32);

    for name in [props::MUTE, props::CMD_DEVICE_FLUSH, props::CMD_IDENTIFY_DEVICE] {
        if let Err(e) = ctx.shadow.subscribe_desired(id, name) {
            error!("Failed to subscribe to {} on device {}: {}", name, id, e);
        }
    }
}

fn write_identity<S: Shadow>(ctx: &mut Context<S>, msg: &DeviceTested, online: Online) {
    let values: Vec<(String, PropertyValue)> = vec![
        (props::MANUFACTURER.to_string(), MANUFACTURER.into()),
        (props::MODEL_VALUE.to_string(), u32::from(msg.model).into()),
        (props::MODEL.to_string(), msg.model.to_string().into()),
        (props::ONLINE.to_string(), online.into()),
        (props::SID.to_string(), msg.sid.into()),
        (props::TEST_TIMESTAMP.to_string(), ctx.unix_time().into()),
    ];
    if let Err(e) = ctx.shadow.set_reported_group(msg.id, values) {
        error!("Failed to update device {}: {}", msg.id, e);
    }
}

fn device_sid<S: Shadow>(ctx: &Context<S>, id: DeviceId) -> Option<u8> {
    ctx.reported(id, props::SID).and_then(|v| v.as_u8())
}

/// SIDs of every registered mesh device.
fn known_sids<S: Shadow>(ctx: &Context<S>) -> SidMap {
    ctx.mesh_devices()
        .into_iter()
        .filter_map(|id| device_sid(ctx, id))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use wisafe_link::BufferPool;

    use super::*;
    use crate::context::RecordingSink;
    use crate::shadow::MemoryShadow;
    use crate::timer::ManualClock;

    struct Harness {
        discovery: Discovery,
        ctx: Context<MemoryShadow>,
        sink: RecordingSink,
        clock: ManualClock,
    }

    impl Harness {
        fn new() -> Self {
            let config = DiscoveryConfig::default();
            let sink = RecordingSink::new();
            let clock = ManualClock::new(1_700_000_000);
            let mut shadow = MemoryShadow::new();
            shadow
                .register_device(DeviceId::GATEWAY, 0)
                .expect("gateway");
            let ctx = Context::new(
                shadow,
                BufferPool::new(8),
                Arc::new(sink.clone()),
                Arc::new(clock.clone()),
            );
            Self {
                discovery: Discovery::new(config),
                ctx,
                sink,
                clock,
            }
        }

        fn tested(&mut self, id: u32, sid: u8) {
            let msg = DeviceTested {
                id: DeviceId::new(id),
                priority: 0x81,
                status: 0,
                model: 785,
                sid,
                seq: 1,
            };
            self.discovery
                .device_tested(&mut self.ctx, &msg, Online::Online, true);
        }

        fn gateway(&self, name: &str) -> Option<PropertyValue> {
            self.ctx.reported(DeviceId::GATEWAY, name)
        }

        fn fire(&mut self, kind: TimerKind) {
            self.discovery.on_timer(&mut self.ctx, kind);
        }
    }

    #[test]
    fn test_start_schedules_first_fetch() {
        let mut h = Harness::new();
        h.discovery.start(&mut h.ctx);
        assert_eq!(h.gateway(props::IN_NETWORK), Some(false.into()));
        assert_eq!(h.ctx.timers().len(), 2);

        h.clock.advance(Duration::from_secs(3));
        let now = h.ctx.now();
        let (_, kind) = h.ctx.timers().pop_expired(now).expect("fetch timer");
        assert_eq!(kind, TimerKind::RetrieveSidMap);
        h.fire(kind);
        assert_eq!(h.sink.take(), vec![Command::RequestSidMap.to_vec()]);
    }

    #[test]
    fn test_sid_map_counts_unknown_devices() {
        let mut h = Harness::new();
        h.discovery
            .process_sid_map(&mut h.ctx, SidMap::from_iter([0, 5, 9]));

        assert!(h.discovery.in_network());
        assert_eq!(h.discovery.unknown_count(), 2);
        assert_eq!(h.gateway(props::UNKNOWN_SIDS), Some(2u32.into()));
        assert!(h.discovery.is_interrogating());

        let frames = h.sink.take();
        assert_eq!(frames[0], Command::RmDiagnosticRequest.to_vec());
        assert_eq!(frames[1], Command::RequestRemoteId { sid: 0 }.to_vec());
    }

    #[test]
    fn test_interrogation_gives_up_after_max_attempts() {
        let mut h = Harness::new();
        h.discovery
            .process_sid_map(&mut h.ctx, SidMap::from_iter([0, 5]));
        assert!(h.discovery.is_interrogating());

        for _ in 0..15 {
            h.fire(TimerKind::Interrogate);
        }

        let frames = h.sink.take();
        let max = DiscoveryConfig::default().max_interrogations as usize;
        for sid in [0, 5] {
            let request = Command::RequestRemoteId { sid }.to_vec();
            assert_eq!(frames.iter().filter(|f| **f == request).count(), max);
        }
        assert!(!h.discovery.is_interrogating());
        assert_eq!(h.gateway(props::INTERROGATING), Some(false.into()));
    }

    #[test]
    fn test_device_tested_registers_new_device() {
        let mut h = Harness::new();
        h.discovery
            .process_sid_map(&mut h.ctx, SidMap::from_iter([0, 5]));
        assert_eq!(h.discovery.unknown_count(), 1);

        h.tested(0x1234, 5);
        let id = DeviceId::new(0x1234);
        assert!(h.ctx.shadow.is_registered(id));
        assert_eq!(h.discovery.unknown_count(), 0);
        assert_eq!(h.ctx.reported(id, props::SID), Some(5u8.into()));
        assert_eq!(h.ctx.reported(id, props::MANUFACTURER), Some("Sprue".into()));
        assert_eq!(h.ctx.reported(id, props::MODEL), Some("785".into()));
        assert_eq!(
            h.ctx.reported(id, props::TEST_TIMESTAMP),
            Some(1_700_000_000i64.into())
        );
        assert!(h.ctx.shadow.is_subscribed(id, props::MUTE));
    }

    #[test]
    fn test_device_tested_outside_map_ignored() {
        let mut h = Harness::new();
        h.discovery
            .process_sid_map(&mut h.ctx, SidMap::from_iter([0, 5]));
        h.tested(0x1234, 7);
        assert!(!h.ctx.shadow.is_registered(DeviceId::new(0x1234)));
    }

    #[test]
    fn test_sid_map_update_flags_missing_devices() {
        let mut h = Harness::new();
        h.discovery
            .process_sid_map(&mut h.ctx, SidMap::from_iter([0, 5, 6]));
        h.tested(0x1005, 5);
        h.tested(0x1006, 6);

        h.discovery
            .process_sid_map_update(&mut h.ctx, SidMap::from_iter([0, 5]));
        let gone = DeviceId::new(0x1006);
        assert_eq!(h.ctx.reported(gone, props::ONLINE), Some(Online::Offline.into()));
        assert_eq!(h.ctx.reported(gone, props::DEVICE_MISSING), Some(true.into()));
        assert_eq!(
            h.ctx.reported(DeviceId::new(0x1005), props::ONLINE),
            Some(Online::Online.into())
        );
    }

    #[test]
    fn test_learn_mode_on_and_timeout() {
        let mut h = Harness::new();
        h.discovery.set_learn_mode(&mut h.ctx, true, 120);
        assert!(h.discovery.is_learning());
        assert_eq!(h.gateway(props::STATE), Some(GatewayState::Learning.into()));
        assert_eq!(h.sink.take(), vec![Command::LearnIn.to_vec()]);

        h.fire(TimerKind::LearnModeTimeout);
        assert!(!h.discovery.is_learning());
        assert_eq!(h.gateway(props::STATE), Some(GatewayState::Running.into()));
    }

    #[test]
    fn test_test_mode_outside_network_ends_at_once() {
        let mut h = Harness::new();
        h.discovery.test_mode(&mut h.ctx, true, true);
        assert_eq!(h.discovery.scan_phase(), ScanPhase::Idle);
        assert_eq!(h.gateway(props::CMD_TEST_MODE_RESULT), Some(true.into()));
        assert!(h.sink.is_empty());
    }

    #[test]
    fn test_scan_without_missing_devices_ends_early() {
        let mut h = Harness::new();
        h.discovery
            .process_sid_map(&mut h.ctx, SidMap::from_iter([0, 5]));
        h.tested(0x1005, 5);
        h.sink.take();

        h.discovery.test_mode(&mut h.ctx, true, true);
        assert_eq!(h.discovery.scan_phase(), ScanPhase::Probing);
        assert_eq!(
            h.sink.take(),
            vec![Command::UpdateSidMap(SidMap::from_iter([0, 5])).to_vec()]
        );

        h.discovery.missing_node_report(&mut h.ctx, SidMap::EMPTY);
        assert_eq!(h.discovery.scan_phase(), ScanPhase::Idle);
        assert!(h.ctx.shadow.is_registered(DeviceId::new(0x1005)));
        assert_eq!(h.gateway(props::CMD_TEST_MODE_RESULT), Some(true.into()));
        assert!(h.sink.is_empty());
    }

    #[test]
    fn test_flush_removes_one_device() {
        let mut h = Harness::new();
        h.discovery
            .process_sid_map(&mut h.ctx, SidMap::from_iter([0, 5, 6]));
        h.tested(0x1005, 5);
        h.tested(0x1006, 6);
        h.sink.take();

        h.discovery.flush(&mut h.ctx, DeviceId::new(0x1006));
        assert_eq!(h.discovery.scan_phase(), ScanPhase::UpdatingMap);
        assert_eq!(
            h.sink.take(),
            vec![Command::UpdateSidMap(SidMap::from_iter([0, 5])).to_vec()]
        );

        for _ in 1..3 {
            h.fire(TimerKind::TestMissingUpdateMap);
        }
        assert_eq!(h.sink.take().len(), 2);
        h.fire(TimerKind::TestMissingUpdateMap);

        assert_eq!(h.discovery.scan_phase(), ScanPhase::Idle);
        assert!(!h.ctx.shadow.is_registered(DeviceId::new(0x1006)));
        assert!(h.ctx.shadow.is_registered(DeviceId::new(0x1005)));
    }

    #[test]
    fn test_flush_unknown_device_does_nothing() {
        let mut h = Harness::new();
        h.discovery.flush(&mut h.ctx, DeviceId::new(0x4242));
        assert_eq!(h.discovery.scan_phase(), ScanPhase::Idle);
        assert!(h.sink.is_empty());
    }

    #[test]
    fn test_rm_diagnostic_sets_gateway_sid() {
        let mut h = Harness::new();
        let status = RadioStatus {
            sid: 0,
            volts_no_load: 0,
            volts_load: 0,
            volts_secondary: 0,
            rssi: 40,
            fw_rev: 0x12,
            id: DeviceId::GATEWAY,
            critical: 0,
            radio_faults: 3,
        };
        h.discovery.process_rm_diagnostic(&mut h.ctx, &status);
        assert_eq!(h.discovery.gateway_sid(), 0);
        assert_eq!(h.gateway(props::RADIO_FAULT_COUNT), Some(3u8.into()));
        assert_eq!(h.gateway(props::RADIO_RSSI), Some(40u8.into()));
    }
}
