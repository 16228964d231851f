//! Fixed-capacity pool of frame buffers.
//!
//! Every frame that moves through the gateway lives in one of a small, fixed
//! number of 32-byte slots. A [`Buffer`] is the owned handle to a slot: it can
//! be moved between components but not copied, and the slot goes back on the
//! free list when the handle is released or dropped. A slot is therefore never
//! both free and referenced, and it cannot be returned twice.
//!
//! Slots carry a [`SlotUse`] tag describing how their bytes are interpreted,
//! which lets pending correlation records park a message snapshot in the pool
//! and lets diagnostics report what the pool is holding.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{trace, warn};
use wisafe_metrics::metric_defs;

/// Capacity of a single frame buffer in bytes.
pub const BUFFER_CAPACITY: usize = 32;

/// Default number of slots in the pool.
pub const DEFAULT_POOL_SLOTS: usize = 10;

/// Default interval between blocking acquire attempts.
pub const DEFAULT_ACQUIRE_RETRY: Duration = Duration::from_millis(1000);

/// Default number of failed blocking attempts between warnings.
pub const DEFAULT_ACQUIRE_WARN_EVERY: u32 = 10;

/// What an occupied slot is currently holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotUse {
    /// A wire frame in flight (received or about to be transmitted).
    Frame,
    /// A fault message parked while its follow-up is outstanding.
    PendingFault,
    /// An alarm message parked while its follow-up is outstanding.
    PendingAlarm,
}

#[derive(Debug)]
struct PoolState {
    free: Vec<usize>,
    tags: Vec<Option<SlotUse>>,
}

impl PoolState {
    fn in_use(&self) -> usize {
        self.tags.len() - self.free.len()
    }

    fn release(&mut self, slot: usize) {
        match self.tags.get_mut(slot) {
            Some(tag @ Some(_)) => {
                *tag = None;
                self.free.push(slot);
            }
            _ => warn!("BufferPool: release of slot {} that is not in use", slot),
        }
    }
}

/// A fixed pool of [`BUFFER_CAPACITY`]-byte frame buffers.
///
/// Cloning the pool yields another handle to the same slots.
#[derive(Clone)]
pub struct BufferPool {
    state: Arc<Mutex<PoolState>>,
    capacity: usize,
    retry_interval: Duration,
    warn_every: u32,
}

impl BufferPool {
    /// Create a pool with `slots` buffers.
    pub fn new(slots: usize) -> Self {
        BufferPool {
            state: Arc::new(Mutex::new(PoolState {
                free: (0..slots).rev().collect(),
                tags: vec![None; slots],
            })),
            capacity: slots,
            retry_interval: DEFAULT_ACQUIRE_RETRY,
            warn_every: DEFAULT_ACQUIRE_WARN_EVERY,
        }
    }

    /// Set how long [`acquire_blocking`](Self::acquire_blocking) sleeps between attempts.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set how many consecutive failed blocking attempts pass between warnings.
    pub fn with_warn_every(mut self, attempts: u32) -> Self {
        self.warn_every = attempts.max(1);
        self
    }

    /// Take a free buffer, or `None` if every slot is owned.
    pub fn acquire(&self) -> Option<Buffer> {
        let mut state = self.state.lock();
        let Some(slot) = state.free.pop() else {
            drop(state);
            trace!("BufferPool: no free slot");
            metrics::counter!(metric_defs::POOL_EXHAUSTED.name).increment(1);
            return None;
        };
        state.tags[slot] = Some(SlotUse::Frame);
        metrics::gauge!(metric_defs::POOL_IN_USE.name).set(state.in_use() as f64);
        Some(Buffer {
            data: [0; BUFFER_CAPACITY],
            len: 0,
            slot,
            tag: SlotUse::Frame,
            pool: Arc::clone(&self.state),
        })
    }

    /// Take a free buffer holding a copy of `bytes`.
    ///
    /// Returns `None` if the pool is empty or `bytes` does not fit.
    pub fn acquire_with(&self, bytes: &[u8]) -> Option<Buffer> {
        if bytes.len() > BUFFER_CAPACITY {
            return None;
        }
        let mut buf = self.acquire()?;
        buf.data[..bytes.len()].copy_from_slice(bytes);
        buf.len = bytes.len();
        Some(buf)
    }

    /// Take a free buffer, sleeping and retrying until one is available.
    pub fn acquire_blocking(&self) -> Buffer {
        loop {
            if let Some(buf) = self.acquire_while(|| true) {
                return buf;
            }
        }
    }

    /// Retry [`acquire`](Self::acquire) until it succeeds or `keep_going` returns false.
    pub fn acquire_while(&self, mut keep_going: impl FnMut() -> bool) -> Option<Buffer> {
        let mut attempts: u32 = 0;
        loop {
            if let Some(buf) = self.acquire() {
                return Some(buf);
            }
            if !keep_going() {
                return None;
            }
            attempts = attempts.wrapping_add(1);
            if attempts % self.warn_every == 0 {
                warn!(
                    "BufferPool: still waiting for a free buffer after {} attempts",
                    attempts
                );
            }
            thread::sleep(self.retry_interval);
        }
    }

    /// Return a buffer to the pool. Equivalent to dropping it.
    pub fn release(&self, buffer: Buffer) {
        drop(buffer);
    }

    /// Free space left in `buffer`.
    pub fn remaining_space(buffer: &Buffer) -> usize {
        buffer.remaining_space()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Number of owned slots carrying `tag`.
    pub fn in_use(&self, tag: SlotUse) -> usize {
        self.state
            .lock()
            .tags
            .iter()
            .filter(|t| **t == Some(tag))
            .count()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SLOTS)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// An owned pool slot holding up to [`BUFFER_CAPACITY`] bytes.
///
/// Dereferences to the filled portion of the slot.
pub struct Buffer {
    data: [u8; BUFFER_CAPACITY],
    len: usize,
    slot: usize,
    tag: SlotUse,
    pool: Arc<Mutex<PoolState>>,
}

impl Buffer {
    /// Number of filled bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bytes are filled.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity minus length, or 0 if the length is somehow past capacity.
    pub fn remaining_space(&self) -> usize {
        BUFFER_CAPACITY.saturating_sub(self.len)
    }

    /// Index of the slot this buffer occupies.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Current slot tag.
    pub fn tag(&self) -> SlotUse {
        self.tag
    }

    /// Change how this slot is accounted for.
    pub fn retag(&mut self, tag: SlotUse) {
        self.tag = tag;
        if let Some(entry) = self.pool.lock().tags.get_mut(self.slot) {
            *entry = Some(tag);
        }
    }

    /// Append one byte. Returns false if the buffer is full.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.len >= BUFFER_CAPACITY {
            return false;
        }
        self.data[self.len] = byte;
        self.len += 1;
        true
    }

    /// Append `bytes`. Returns false, leaving the buffer unchanged, if they do not fit.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining_space() {
            return false;
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    /// Replace the contents with `bytes`. Returns false if they do not fit.
    pub fn fill_from(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > BUFFER_CAPACITY {
            return false;
        }
        self.len = 0;
        self.extend_from_slice(bytes)
    }

    /// Empty the buffer without releasing the slot.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// The whole backing slot, for in-place codecs and transport reads.
    pub fn storage_mut(&mut self) -> &mut [u8; BUFFER_CAPACITY] {
        &mut self.data
    }

    /// Set the filled length, clamped to capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(BUFFER_CAPACITY);
    }

    /// Return the slot to its pool.
    pub fn release(self) {}
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.release(self.slot);
        metrics::gauge!(metric_defs::POOL_IN_USE.name).set(state.in_use() as f64);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("slot", &self.slot)
            .field("tag", &self.tag)
            .field("data", &hex::encode(&self[..]))
            .finish()
    }
}

/// Log `bytes` in hex at debug level, prefixed with a direction marker.
pub fn dump(prefix: &str, bytes: &[u8]) {
    tracing::debug!("{} [{}] {}", prefix, bytes.len(), hex::encode(bytes));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion() {
        let pool = BufferPool::new(DEFAULT_POOL_SLOTS);
        let mut held: Vec<_> = (0..DEFAULT_POOL_SLOTS)
            .map(|_| pool.acquire().expect("slot available"))
            .collect();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);

        held.pop();
        assert!(pool.acquire().is_some(), "one release frees exactly one slot");

        let extra = pool.acquire().expect("released slot reusable");
        assert!(pool.acquire().is_none());
        drop(extra);
        drop(held);
        assert_eq!(pool.available(), DEFAULT_POOL_SLOTS);
    }

    #[test]
    fn test_slots_are_distinct() {
        let pool = BufferPool::new(3);
        let a = pool.acquire().expect("a");
        let b = pool.acquire().expect("b");
        let c = pool.acquire().expect("c");
        let mut slots = vec![a.slot(), b.slot(), c.slot()];
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 3);
    }

    #[test]
    fn test_remaining_space() {
        let pool = BufferPool::new(1);
        let mut buf = pool.acquire().expect("buffer");
        assert_eq!(buf.remaining_space(), BUFFER_CAPACITY);
        assert!(buf.extend_from_slice(&[1, 2, 3]));
        assert_eq!(BufferPool::remaining_space(&buf), BUFFER_CAPACITY - 3);
        assert!(!buf.extend_from_slice(&[0; BUFFER_CAPACITY]));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_push_until_full() {
        let pool = BufferPool::new(1);
        let mut buf = pool.acquire().expect("buffer");
        for i in 0..BUFFER_CAPACITY {
            assert!(buf.push(i as u8));
        }
        assert!(!buf.push(0xff));
        assert_eq!(buf.remaining_space(), 0);
    }

    #[test]
    fn test_retag_accounting() {
        let pool = BufferPool::new(4);
        let mut a = pool.acquire_with(&[0x71, 1, 2, 3]).expect("a");
        let _b = pool.acquire().expect("b");
        assert_eq!(pool.in_use(SlotUse::Frame), 2);

        a.retag(SlotUse::PendingFault);
        assert_eq!(a.tag(), SlotUse::PendingFault);
        assert_eq!(pool.in_use(SlotUse::PendingFault), 1);
        assert_eq!(pool.in_use(SlotUse::Frame), 1);

        a.release();
        assert_eq!(pool.in_use(SlotUse::PendingFault), 0);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_acquire_with_too_large() {
        let pool = BufferPool::new(1);
        assert!(pool.acquire_with(&[0; BUFFER_CAPACITY + 1]).is_none());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_acquire_while_gives_up() {
        let pool = BufferPool::new(1).with_retry_interval(Duration::from_millis(1));
        let _held = pool.acquire().expect("held");
        let mut tries = 0;
        let result = pool.acquire_while(|| {
            tries += 1;
            tries < 3
        });
        assert!(result.is_none());
        assert_eq!(tries, 3);
    }

    #[test]
    fn test_acquire_blocking_waits_for_release() {
        let pool = BufferPool::new(1).with_retry_interval(Duration::from_millis(5));
        let held = pool.acquire().expect("held");
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(held);
        });
        let buf = pool.acquire_blocking();
        assert_eq!(buf.len(), 0);
        releaser.join().expect("releaser thread");
    }
}
