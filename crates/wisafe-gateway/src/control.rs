//! Operations posted to the engine from other threads.
//!
//! Nothing here touches engine state directly. Every operation is queued on
//! the same channel as received frames and handled in order on the engine
//! thread.

use crossbeam_channel::Sender;
use tracing::warn;
use wisafe_protocol::DeviceId;

use crate::engine::GatewayMessage;
use crate::shadow::PropertyValue;

/// A desired property changed on the platform side.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDelta {
    /// Device the property belongs to.
    pub device: DeviceId,
    /// Property name.
    pub name: String,
    /// New desired value.
    pub value: PropertyValue,
}

impl PropertyDelta {
    /// Create a delta.
    pub fn new(device: DeviceId, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self {
            device,
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A control operation for the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOp {
    /// Start a missing-node test.
    BeginMissingNodeScan {
        /// Delete devices still missing at the end.
        delete: bool,
    },
    /// Stop a running missing-node test.
    StopMissingNodeScan,
    /// Sound a test on the network.
    IssueTest,
    /// Turn learn mode on or off.
    Learn {
        /// On or off.
        enabled: bool,
        /// Seconds before learn mode turns itself off; 0 for no limit.
        timeout_secs: u32,
    },
    /// Leave the network.
    Leave,
    /// Remove every device.
    FlushAll,
    /// Remove one device.
    Flush(DeviceId),
    /// Make a device identify itself.
    IdentifyDevice(DeviceId),
    /// Silence every sounding alarm.
    SilenceAll,
    /// Locate the alarm that started.
    Locate,
    /// Mute or unmute a device's sounder.
    SounderEnable {
        /// Target device.
        id: DeviceId,
        /// True to enable, false to mute.
        enabled: bool,
    },
    /// Desired properties changed together.
    PropertyDeltas(Vec<PropertyDelta>),
}

/// Cloneable handle for posting [`ControlOp`]s to the engine.
#[derive(Debug, Clone)]
pub struct ControlQueue {
    sender: Sender<GatewayMessage>,
}

impl ControlQueue {
    /// Wrap the engine's inbound channel.
    pub fn new(sender: Sender<GatewayMessage>) -> Self {
        Self { sender }
    }

    /// Queue an operation. Returns false if the engine has stopped.
    pub fn post(&self, op: ControlOp) -> bool {
        match self.sender.send(GatewayMessage::Control(op)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Engine stopped, dropping control operation {:?}", e.into_inner());
                false
            }
        }
    }

    /// Start a missing-node test.
    pub fn begin_missing_node_scan(&self, delete: bool) -> bool {
        self.post(ControlOp::BeginMissingNodeScan { delete })
    }

    /// Stop a missing-node test.
    pub fn stop_missing_node_scan(&self) -> bool {
        self.post(ControlOp::StopMissingNodeScan)
    }

    /// Sound a test.
    pub fn issue_test(&self) -> bool {
        self.post(ControlOp::IssueTest)
    }

    /// Turn learn mode on or off.
    pub fn learn(&self, enabled: bool, timeout_secs: u32) -> bool {
        self.post(ControlOp::Learn {
            enabled,
            timeout_secs,
        })
    }

    /// Leave the network.
    pub fn leave(&self) -> bool {
        self.post(ControlOp::Leave)
    }

    /// Remove every device.
    pub fn flush_all(&self) -> bool {
        self.post(ControlOp::FlushAll)
    }

    /// Remove one device.
    pub fn flush(&self, id: DeviceId) -> bool {
        self.post(ControlOp::Flush(id))
    }

    /// Make a device identify itself.
    pub fn identify_device(&self, id: DeviceId) -> bool {
        self.post(ControlOp::IdentifyDevice(id))
    }

    /// Silence every alarm.
    pub fn silence_all(&self) -> bool {
        self.post(ControlOp::SilenceAll)
    }

    /// Locate.
    pub fn locate(&self) -> bool {
        self.post(ControlOp::Locate)
    }

    /// Mute or unmute a sounder.
    pub fn sounder_enable(&self, id: DeviceId, enabled: bool) -> bool {
        self.post(ControlOp::SounderEnable { id, enabled })
    }

    /// Report a desired property change.
    pub fn property_delta(&self, delta: PropertyDelta) -> bool {
        self.post(ControlOp::PropertyDeltas(vec![delta]))
    }

    /// Report desired property changes that arrived as one group.
    pub fn property_deltas(&self, deltas: Vec<PropertyDelta>) -> bool {
        self.post(ControlOp::PropertyDeltas(deltas))
    }

    /// Ask the engine loop to exit.
    pub fn shutdown(&self) -> bool {
        self.sender.send(GatewayMessage::Shutdown).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_arrive_in_order() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = ControlQueue::new(tx);

        assert!(queue.learn(true, 60));
        assert!(queue.flush(DeviceId::new(7)));
        assert!(queue.shutdown());

        let received: Vec<GatewayMessage> = rx.try_iter().collect();
        assert!(matches!(
            received[0],
            GatewayMessage::Control(ControlOp::Learn {
                enabled: true,
                timeout_secs: 60
            })
        ));
        assert!(matches!(
            &received[1],
            GatewayMessage::Control(ControlOp::Flush(id)) if *id == DeviceId::new(7)
        ));
        assert!(matches!(received[2], GatewayMessage::Shutdown));
    }

    #[test]
    fn test_post_after_engine_stopped() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let queue = ControlQueue::new(tx);
        assert!(!queue.silence_all());
    }
}
