//! WiSafe radio module link
//!
//! This crate owns the byte-level side of the gateway's connection to the
//! WiSafe radio module (RM): a fixed pool of frame buffers, the byte-stuffing
//! codec, and a driver that runs a dedicated receive thread and serialises
//! transmit and receive on a single lock.
//!
//! # Data flow
//!
//! ```text
//! transport ──read──▶ Buffer ──unescape──▶ consumer queue
//! FrameSink::transmit(Buffer) ──escape + 0x7e──▶ transport
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use wisafe_link::{LinkConfig, LinkDriver, TcpTransport};
//!
//! let config = LinkConfig::default();
//! let pool = config.build_pool();
//! let (tx, rx) = crossbeam_channel::unbounded::<wisafe_link::Buffer>();
//! let transport = TcpTransport::connect("127.0.0.1:7400", config.read_poll())?;
//! let link = LinkDriver::start(transport, pool.clone(), tx, &config)?;
//! ```

mod buffer;
mod driver;
mod error;
pub mod framer;
mod transport;

pub use buffer::*;
pub use driver::*;
pub use error::*;
pub use transport::*;
