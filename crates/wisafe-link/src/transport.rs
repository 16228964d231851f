//! Physical channels to the radio module.
//!
//! A [`Transport`] moves whole escaped frames. Waiting for data is split from
//! reading it: the receive thread blocks on a [`Readiness`] handle without
//! holding the link lock, then takes the lock only for the read itself, so a
//! transmit is never stuck behind an idle receive.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::buffer::BUFFER_CAPACITY;
use crate::framer::FLAG;

/// Longest run of bytes without a terminator before the stream is resynchronised.
const MAX_UNTERMINATED: usize = 4 * BUFFER_CAPACITY;

/// Blocks until the transport has something to read.
pub trait Readiness: Send {
    /// Wait up to the transport's poll interval.
    ///
    /// Returns `Ok(true)` if a read is likely to produce a frame.
    fn wait(&mut self) -> io::Result<bool>;
}

/// A half-duplex frame channel to the radio module.
///
/// `read_frame` and `write_frame` are always called with the link lock held.
pub trait Transport: Send + 'static {
    /// A handle the receive thread can block on without the link lock.
    fn readiness(&self) -> io::Result<Box<dyn Readiness>>;

    /// Read one escaped frame, without its terminator, into `out`.
    ///
    /// `WouldBlock` and `TimedOut` errors mean no complete frame was available.
    fn read_frame(&mut self, out: &mut [u8]) -> io::Result<usize>;

    /// Write one escaped, terminated frame.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Release the channel.
    fn close(&mut self) -> io::Result<()>;
}

// ============================================================================
// TCP
// ============================================================================

/// Frames carried over a TCP stream, delimited by [`FLAG`].
///
/// Used to reach a radio module bridge or simulator.
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    pending: BytesMut,
    buffered: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Connect to `addr`, polling reads every `poll`.
    pub fn connect(addr: impl ToSocketAddrs, poll: Duration) -> io::Result<Self> {
        Self::from_stream(TcpStream::connect(addr)?, poll)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, poll: Duration) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(poll))?;
        let peer = stream.peer_addr()?;
        debug!("TcpTransport: connected to {}", peer);
        Ok(TcpTransport {
            stream,
            peer,
            pending: BytesMut::with_capacity(MAX_UNTERMINATED),
            buffered: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn take_buffered_frame(&mut self, out: &mut [u8]) -> Option<io::Result<usize>> {
        loop {
            let pos = self.pending.iter().position(|&b| b == FLAG)?;
            let frame = self.pending.split_to(pos + 1);
            self.buffered
                .store(self.pending.contains(&FLAG), Ordering::Release);
            let body = &frame[..pos];
            if body.is_empty() {
                continue;
            }
            if body.len() > out.len() {
                return Some(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {} bytes exceeds {}", body.len(), out.len()),
                )));
            }
            out[..body.len()].copy_from_slice(body);
            return Some(Ok(body.len()));
        }
    }
}

impl Transport for TcpTransport {
    fn readiness(&self) -> io::Result<Box<dyn Readiness>> {
        Ok(Box::new(TcpReadiness {
            stream: self.stream.try_clone()?,
            buffered: Arc::clone(&self.buffered),
        }))
    }

    fn read_frame(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(result) = self.take_buffered_frame(out) {
                return result;
            }
            if self.pending.len() > MAX_UNTERMINATED {
                warn!(
                    "TcpTransport: {} bytes without terminator, discarding",
                    self.pending.len()
                );
                self.pending.advance(self.pending.len());
            }
            let mut chunk = [0u8; 64];
            match self.stream.read(&mut chunk)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ))
                }
                n => self.pending.extend_from_slice(&chunk[..n]),
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame)?;
        self.stream.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

struct TcpReadiness {
    stream: TcpStream,
    buffered: Arc<AtomicBool>,
}

impl Readiness for TcpReadiness {
    fn wait(&mut self) -> io::Result<bool> {
        if self.buffered.load(Ordering::Acquire) {
            return Ok(true);
        }
        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            Ok(_) => Ok(true),
            Err(e) if is_timeout(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// True for the error kinds a timed-out read reports.
pub fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

// ============================================================================
// In-memory
// ============================================================================

struct Inbound {
    frames: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
}

/// An in-process transport, driven from the other side by a [`MemoryPeer`].
pub struct MemoryTransport {
    inbound: Arc<Inbound>,
    outbound: Sender<Vec<u8>>,
    poll: Duration,
    closed: bool,
}

/// The radio-module side of a [`MemoryTransport`].
pub struct MemoryPeer {
    inbound: Arc<Inbound>,
    outbound: Receiver<Vec<u8>>,
}

/// Create a connected transport and peer.
pub fn memory_pair(poll: Duration) -> (MemoryTransport, MemoryPeer) {
    let inbound = Arc::new(Inbound {
        frames: Mutex::new(VecDeque::new()),
        ready: Condvar::new(),
    });
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        MemoryTransport {
            inbound: Arc::clone(&inbound),
            outbound: tx,
            poll,
            closed: false,
        },
        MemoryPeer {
            inbound,
            outbound: rx,
        },
    )
}

impl MemoryPeer {
    /// Queue wire bytes (escaped, optionally terminated) for the gateway to read.
    pub fn send_wire(&self, wire: &[u8]) {
        self.inbound.frames.lock().push_back(wire.to_vec());
        self.inbound.ready.notify_one();
    }

    /// Wait for the next frame the gateway wrote, as wire bytes.
    pub fn recv_wire(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.outbound.recv_timeout(timeout).ok()
    }

    /// Frames the gateway wrote that have not been received yet.
    pub fn drain_wire(&self) -> Vec<Vec<u8>> {
        self.outbound.try_iter().collect()
    }
}

impl Transport for MemoryTransport {
    fn readiness(&self) -> io::Result<Box<dyn Readiness>> {
        Ok(Box::new(MemoryReadiness {
            inbound: Arc::clone(&self.inbound),
            poll: self.poll,
        }))
    }

    fn read_frame(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let Some(mut wire) = self.inbound.frames.lock().pop_front() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        if wire.last() == Some(&FLAG) {
            wire.pop();
        }
        if wire.len() > out.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds {}", wire.len(), out.len()),
            ));
        }
        out[..wire.len()].copy_from_slice(&wire);
        Ok(wire.len())
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

struct MemoryReadiness {
    inbound: Arc<Inbound>,
    poll: Duration,
}

impl Readiness for MemoryReadiness {
    fn wait(&mut self) -> io::Result<bool> {
        let mut frames = self.inbound.frames.lock();
        if frames.is_empty() {
            self.inbound.ready.wait_for(&mut frames, self.poll);
        }
        Ok(!frames.is_empty())
    }
}
