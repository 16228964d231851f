//! The link driver: one receive thread plus a locked transmit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use wisafe_metrics::metric_defs;

use crate::buffer::{dump, Buffer, BufferPool, DEFAULT_POOL_SLOTS};
use crate::error::{LinkError, LinkResult};
use crate::framer::{self, FLAG};
use crate::transport::{is_timeout, Readiness, Transport};

/// Link tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Number of frame buffers in the pool.
    pub pool_slots: usize,
    /// Sleep between blocking acquire attempts, in milliseconds.
    pub acquire_retry_ms: u64,
    /// Failed blocking acquire attempts between warnings.
    pub acquire_warn_every: u32,
    /// How long the receive thread waits for data before rechecking for shutdown, in milliseconds.
    pub read_poll_ms: u64,
    /// Pause after a transport error, in milliseconds.
    pub error_backoff_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            pool_slots: DEFAULT_POOL_SLOTS,
            acquire_retry_ms: 1000,
            acquire_warn_every: 10,
            read_poll_ms: 100,
            error_backoff_ms: 500,
        }
    }
}

impl LinkConfig {
    /// Build the buffer pool this configuration describes.
    pub fn build_pool(&self) -> BufferPool {
        BufferPool::new(self.pool_slots)
            .with_retry_interval(Duration::from_millis(self.acquire_retry_ms))
            .with_warn_every(self.acquire_warn_every)
    }

    /// Receive poll interval.
    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }
}

/// Something that can put a frame on the wire.
///
/// The frame is consumed; its buffer is released once written or dropped.
pub trait FrameSink: Send + Sync {
    /// Escape, terminate and write `frame`.
    fn transmit(&self, frame: Buffer);
}

/// Owns the transport, its receive thread and the lock that serialises access.
pub struct LinkDriver<T: Transport> {
    transport: Arc<Mutex<T>>,
    stop: Arc<AtomicBool>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> LinkDriver<T> {
    /// Start the receive thread.
    ///
    /// Each received frame is unescaped and delivered to `queue` as `M::from(buffer)`.
    pub fn start<M>(
        transport: T,
        pool: BufferPool,
        queue: Sender<M>,
        config: &LinkConfig,
    ) -> LinkResult<Self>
    where
        M: From<Buffer> + Send + 'static,
    {
        let readiness = transport.readiness()?;
        let transport = Arc::new(Mutex::new(transport));
        let stop = Arc::new(AtomicBool::new(false));

        let rx = ReceiveLoop {
            transport: Arc::clone(&transport),
            readiness,
            pool,
            queue,
            stop: Arc::clone(&stop),
            backoff: Duration::from_millis(config.error_backoff_ms),
        };
        let handle = thread::Builder::new()
            .name("wisafe-rx".to_string())
            .spawn(move || rx.run())
            .map_err(LinkError::Spawn)?;

        info!("LinkDriver: receive thread started");
        Ok(LinkDriver {
            transport,
            stop,
            rx_thread: Mutex::new(Some(handle)),
        })
    }

    /// Escape, terminate and write `frame`, then release it.
    pub fn transmit(&self, frame: Buffer) {
        let Some(mut frame) = framer::escape(frame) else {
            warn!("LinkDriver: TX overflow, frame dropped");
            metrics::counter!(metric_defs::LINK_TX_OVERFLOW.name).increment(1);
            return;
        };
        if !frame.push(FLAG) {
            warn!("LinkDriver: TX overflow, no room for terminator");
            metrics::counter!(metric_defs::LINK_TX_OVERFLOW.name).increment(1);
            return;
        }

        let result = self.transport.lock().write_frame(&frame);
        match result {
            Ok(()) => {
                dump("-> TX", &frame);
                metrics::counter!(metric_defs::LINK_TX_FRAMES.name).increment(1);
            }
            Err(e) => {
                warn!("LinkDriver: write failed: {}", e);
                metrics::counter!(metric_defs::LINK_IO_ERRORS.name, "direction" => "tx")
                    .increment(1);
            }
        }
    }

    /// True while the receive thread is running.
    pub fn is_running(&self) -> bool {
        self.rx_thread
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop and join the receive thread, then close the transport.
    pub fn close(&self) -> LinkResult<()> {
        let handle = self.rx_thread.lock().take().ok_or(LinkError::Closed)?;
        self.stop.store(true, Ordering::Release);
        let joined = handle.join();
        self.transport.lock().close()?;
        info!("LinkDriver: closed");
        joined.map_err(|_| LinkError::ThreadPanicked)
    }
}

impl<T: Transport> FrameSink for LinkDriver<T> {
    fn transmit(&self, frame: Buffer) {
        LinkDriver::transmit(self, frame);
    }
}

impl<T: Transport> Drop for LinkDriver<T> {
    fn drop(&mut self) {
        if self.rx_thread.lock().is_some() {
            if let Err(e) = self.close() {
                debug!("LinkDriver: close on drop: {}", e);
            }
        }
    }
}

struct ReceiveLoop<T: Transport, M> {
    transport: Arc<Mutex<T>>,
    readiness: Box<dyn Readiness>,
    pool: BufferPool,
    queue: Sender<M>,
    stop: Arc<AtomicBool>,
    backoff: Duration,
}

impl<T: Transport, M: From<Buffer>> ReceiveLoop<T, M> {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run(mut self) {
        // A buffer is held across idle polls so the pool is not churned.
        let mut spare: Option<Buffer> = None;

        while !self.stopping() {
            let mut buffer = match spare.take() {
                Some(buffer) => buffer,
                None => {
                    let stop = Arc::clone(&self.stop);
                    match self.pool.acquire_while(|| !stop.load(Ordering::Acquire)) {
                        Some(buffer) => buffer,
                        None => break,
                    }
                }
            };

            match self.readiness.wait() {
                Ok(true) => {}
                Ok(false) => {
                    spare = Some(buffer);
                    continue;
                }
                Err(e) => {
                    self.read_failed(&e);
                    spare = Some(buffer);
                    continue;
                }
            }

            buffer.clear();
            let read = self.transport.lock().read_frame(buffer.storage_mut());
            match read {
                Ok(0) => spare = Some(buffer),
                Ok(n) => {
                    buffer.set_len(n);
                    framer::unescape(&mut buffer);
                    dump("<- RX", &buffer);
                    metrics::counter!(metric_defs::LINK_RX_FRAMES.name).increment(1);
                    metrics::histogram!(metric_defs::LINK_RX_FRAME_SIZE.name)
                        .record(buffer.len() as f64);
                    if self.queue.send(M::from(buffer)).is_err() {
                        debug!("LinkDriver: consumer queue closed, receive thread exiting");
                        break;
                    }
                }
                Err(e) if is_timeout(&e) => spare = Some(buffer),
                Err(e) => {
                    self.read_failed(&e);
                    spare = Some(buffer);
                }
            }
        }
        trace!("LinkDriver: receive loop finished");
    }

    fn read_failed(&self, error: &std::io::Error) {
        warn!("LinkDriver: read failed: {}", error);
        metrics::counter!(metric_defs::LINK_IO_ERRORS.name, "direction" => "rx").increment(1);
        if !self.stopping() {
            thread::sleep(self.backoff);
        }
    }
}
