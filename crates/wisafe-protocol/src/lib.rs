//! WiSafe radio module protocol
//!
//! Types and codecs for the binary messages exchanged with the WiSafe radio
//! module once frames have been unescaped by `wisafe-link`.
//!
//! # Protocol Overview
//!
//! Every frame starts with a command byte. Extended-diagnostic frames
//! (`0xd3` requests, `0xd4` responses) carry a sub-opcode in the second byte.
//! Multi-byte integers are little-endian and device ids are 24 bits.
//!
//! - **Commands** (gateway → RM): [`Command`], encoded into pool buffers
//! - **Messages** (RM → gateway): [`Message`], decoded with exact length checks
//!
//! # Example
//!
//! ```rust,ignore
//! use wisafe_protocol::{Command, Message};
//!
//! let frame = Command::RequestSidMap.encode(&pool)?;
//! let message = Message::decode(&received)?;
//! ```

mod commands;
mod constants;
mod error;
mod messages;
mod types;

pub use commands::*;
pub use constants::*;
pub use error::*;
pub use messages::*;
pub use types::*;
