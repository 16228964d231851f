//! Link error types.

use thiserror::Error;

/// Errors raised by the link driver and its transports.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Transport I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The receive thread could not be started.
    #[error("failed to spawn receive thread: {0}")]
    Spawn(std::io::Error),

    /// The driver was already closed.
    #[error("link already closed")]
    Closed,

    /// The receive thread panicked.
    #[error("receive thread panicked")]
    ThreadPanicked,
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;
