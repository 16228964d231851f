//! Error types for the gateway.

use std::io;
use std::time::Duration;

use thiserror::Error;
use wisafe_link::LinkError;
use wisafe_protocol::DeviceId;

/// Errors reported by a [`Shadow`](crate::shadow::Shadow) store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShadowError {
    /// No record exists for the device.
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    /// The device exists but the property does not.
    #[error("property '{name}' not found on device {device}")]
    PropertyNotFound {
        /// Device that was queried.
        device: DeviceId,
        /// Property name.
        name: String,
    },

    /// The stored value has a different type than the caller needs.
    #[error("property '{name}' on device {device} is not {expected}")]
    TypeMismatch {
        /// Device that was queried.
        device: DeviceId,
        /// Property name.
        name: String,
        /// The type the caller expected.
        expected: &'static str,
    },

    /// The store cannot hold another device.
    #[error("device store is full ({0} devices)")]
    StoreFull(usize),
}

impl ShadowError {
    /// True if the property (or its device) simply does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ShadowError::PropertyNotFound { .. } | ShadowError::DeviceNotFound(_)
        )
    }
}

/// Result type for shadow operations.
pub type ShadowResult<T> = Result<T, ShadowError>;

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    /// Configuration file is not valid YAML for [`GatewayConfig`](crate::config::GatewayConfig).
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A duration string could not be parsed.
    #[error("invalid duration '{0}' (expected e.g. 18h, 30m, 60s, 250ms)")]
    InvalidDuration(String),

    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Probes would be spaced further apart than a reply can take.
    #[error("min_spacing ({spacing:?}) must be less than reply_timeout ({timeout:?})")]
    Spacing {
        /// Configured minimum spacing.
        spacing: Duration,
        /// Configured reply timeout.
        timeout: Duration,
    },
}

/// Result type for configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level errors for the gateway binary.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Link problem.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Connecting to the radio module failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address that was dialled.
        addr: String,
        /// Underlying error.
        source: io::Error,
    },

    /// The engine thread could not be started or panicked.
    #[error("engine thread: {0}")]
    Engine(String),

    /// Installing the Ctrl-C handler failed.
    #[error("signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    /// A required setting is missing.
    #[error("{0}")]
    Missing(&'static str),
}

/// Result type for the gateway binary.
pub type GatewayResult<T> = Result<T, GatewayError>;
