//! Timers and clocks for the engine thread.
//!
//! Timers never run code. Each expiry is handed back to the engine loop as a
//! [`TimerKind`] and processed in order with received frames and control
//! operations. Cancelling a timer removes it from the live set, so a
//! cancelled or superseded timer can never fire.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wisafe_protocol::DeviceId;

/// What a timer means when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Time to request the SID map again.
    RetrieveSidMap,
    /// Time to start a missing-node test.
    TestMissingInit,
    /// No missing-node report arrived in time.
    TestMissingTimeout,
    /// Send the next probe of a missing-node test.
    TestMissingContinue,
    /// Send the next SID map update that removes missing devices.
    TestMissingUpdateMap,
    /// Learn mode has run for its requested time.
    LearnModeTimeout,
    /// No identity reply arrived; move on to the next unknown SID.
    Interrogate,
    /// A fault's follow-up did not arrive.
    FaultTimeout(DeviceId),
    /// An alarm's follow-up did not arrive.
    AlarmTimeout(DeviceId),
}

/// Identifies a scheduled timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Timers ordered by deadline.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    live: HashMap<u64, TimerKind>,
    next_id: u64,
}

impl TimerQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `kind` to fire `delay` after `now`.
    pub fn schedule(&mut self, now: Instant, kind: TimerKind, delay: Duration) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((now + delay, id)));
        self.live.insert(id, kind);
        TimerHandle(id)
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.live.remove(&handle.0).is_some()
    }

    /// True if `handle` has neither fired nor been cancelled.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.live.contains_key(&handle.0)
    }

    /// Deadline of the earliest live timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_dead();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Remove and return the earliest timer due at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerHandle, TimerKind)> {
        self.discard_dead();
        let Reverse((deadline, id)) = *self.heap.peek()?;
        if deadline > now {
            return None;
        }
        self.heap.pop();
        let kind = self.live.remove(&id)?;
        Some((TimerHandle(id), kind))
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// True if no timers are live.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn discard_dead(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.live.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Source of time for the engine.
pub trait Clock: Send + Sync {
    /// Monotonic time, for timers.
    fn now(&self) -> Instant;

    /// Wall-clock time in unix seconds, for timestamps reported to the shadow.
    fn unix_time(&self) -> i64;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_time(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<(Instant, i64)>>,
}

impl ManualClock {
    /// Start at the current instant and the given unix time.
    pub fn new(unix_time: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new((Instant::now(), unix_time))),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.0 += by;
        inner.1 += by.as_secs() as i64;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.lock().0
    }

    fn unix_time(&self) -> i64 {
        self.inner.lock().1
    }
}
