//! Protocol error types.

use thiserror::Error;

/// Errors that can occur when encoding or decoding frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame has no command byte.
    #[error("empty frame")]
    Empty,

    /// Unknown command code.
    #[error("unknown command code: 0x{0:02X}")]
    UnknownCommand(u8),

    /// Unknown extended-diagnostic sub-opcode.
    #[error("unknown extended-diagnostic sub-opcode: 0x{0:02X}")]
    UnknownSubcommand(u8),

    /// Frame length does not match the layout for its command.
    #[error("command 0x{command:02X}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Command byte.
        command: u8,
        /// Length the layout requires.
        expected: usize,
        /// Length received.
        actual: usize,
    },

    /// Output buffer cannot hold the encoded command.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
}

impl ProtocolError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::Empty => "empty",
            ProtocolError::UnknownCommand(_) => "unknown_command",
            ProtocolError::UnknownSubcommand(_) => "unknown_subcommand",
            ProtocolError::LengthMismatch { .. } => "length",
            ProtocolError::BufferTooSmall { .. } => "buffer",
        }
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
