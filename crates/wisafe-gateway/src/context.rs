//! State shared by every handler on the engine thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, warn};
use wisafe_link::{Buffer, BufferPool, FrameSink};
use wisafe_metrics::metric_defs;
use wisafe_protocol::{command_name, Command, DeviceId};

use crate::shadow::{PropertyValue, Shadow};
use crate::timer::{Clock, TimerHandle, TimerKind, TimerQueue};

/// What the engine thread owns besides the discovery and correlation state.
///
/// Handlers receive `&mut Context` explicitly; nothing here is global.
pub struct Context<S: Shadow> {
    /// The device shadow.
    pub shadow: S,
    pool: BufferPool,
    sink: Arc<dyn FrameSink>,
    clock: Arc<dyn Clock>,
    timers: TimerQueue,
}

impl<S: Shadow> Context<S> {
    /// Create a context.
    pub fn new(
        shadow: S,
        pool: BufferPool,
        sink: Arc<dyn FrameSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shadow,
            pool,
            sink,
            clock,
            timers: TimerQueue::new(),
        }
    }

    /// Monotonic now.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Wall-clock unix seconds.
    pub fn unix_time(&self) -> i64 {
        self.clock.unix_time()
    }

    /// The frame buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// The timer queue.
    pub fn timers(&mut self) -> &mut TimerQueue {
        &mut self.timers
    }

    /// Schedule a timer.
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) -> TimerHandle {
        let now = self.clock.now();
        self.timers.schedule(now, kind, delay)
    }

    /// Cancel the timer in `slot`, if any.
    pub fn cancel(&mut self, slot: &mut Option<TimerHandle>) {
        if let Some(handle) = slot.take() {
            self.timers.cancel(handle);
        }
    }

    /// Replace the timer in `slot` with a new one.
    pub fn restart(&mut self, slot: &mut Option<TimerHandle>, kind: TimerKind, delay: Duration) {
        self.cancel(slot);
        *slot = Some(self.schedule(kind, delay));
    }

    /// Encode and transmit `command`. Returns false if no buffer was free.
    pub fn send(&self, command: &Command) -> bool {
        match command.encode(&self.pool) {
            Some(frame) => {
                self.sink.transmit(frame);
                true
            }
            None => {
                warn!(
                    "No buffer free to send {} command",
                    command_name(command.code())
                );
                metrics::counter!(metric_defs::ENGINE_SEND_DEFERRED.name).increment(1);
                false
            }
        }
    }

    /// Read a reported property, treating any error as absent.
    pub fn reported(&self, id: DeviceId, name: &str) -> Option<PropertyValue> {
        self.shadow.get_reported(id, name).ok()
    }

    /// Write a reported property, logging on failure.
    pub fn report(&mut self, id: DeviceId, name: &str, value: impl Into<PropertyValue>) {
        if let Err(e) = self.shadow.set_reported(id, name, value.into()) {
            error!("Failed to set {} on device {}: {}", name, id, e);
        }
    }

    /// Every registered device except the gateway.
    pub fn mesh_devices(&self) -> Vec<DeviceId> {
        match self.shadow.enumerate_devices() {
            Ok(devices) => devices.into_iter().filter(|id| !id.is_gateway()).collect(),
            Err(e) => {
                error!("Failed to enumerate devices: {}", e);
                Vec::new()
            }
        }
    }
}

/// A sink that keeps transmitted frames instead of writing them.
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything transmitted so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock())
    }

    /// Number of frames held.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// True if nothing has been transmitted since the last [`take`](Self::take).
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

impl FrameSink for RecordingSink {
    fn transmit(&self, frame: Buffer) {
        self.frames.lock().push(frame.to_vec());
    }
}
