//! WiSafe gateway engine.
//!
//! Frames received by the link driver, control operations and timer expiries
//! are all handled on a single engine thread:
//!
//! - [`engine`]: the consumer loop and frame routing
//! - [`discovery`]: SID map tracking, missing-node tests, learn mode, flushing
//! - [`event`]: fault and alarm correlation with follow-up reads
//! - [`control`]: operations posted from other threads
//! - [`shadow`]: the device shadow the engine reports into
//! - [`timer`]: timer queue and clocks
//! - [`config`]: YAML configuration

pub mod config;
pub mod context;
pub mod control;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod event;
pub mod profile;
pub mod shadow;
pub mod timer;

pub use config::{DiscoveryConfig, EventConfig, GatewayConfig};
pub use context::{Context, RecordingSink};
pub use control::{ControlOp, ControlQueue, PropertyDelta};
pub use discovery::{Discovery, ScanPhase};
pub use engine::{Engine, GatewayMessage};
pub use error::{ConfigError, GatewayError, GatewayResult, ShadowError, ShadowResult};
pub use event::EventCorrelator;
pub use shadow::{GatewayState, MemoryShadow, Online, PropertyValue, Shadow};
pub use timer::{Clock, ManualClock, SystemClock, TimerKind};
