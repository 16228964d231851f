//! Metrics for the WiSafe gateway.
//!
//! Every metric the gateway records is declared once here as a const [`Metric`],
//! so the link, engine and discovery code never spell a metric name by hand.
//! Recording goes through the `metrics` facade, which is a no-op until the
//! binary installs a recorder.
//!
//! # Example
//!
//! ```rust,ignore
//! use wisafe_metrics::{describe_metrics, metric_defs};
//!
//! describe_metrics();
//! metrics::counter!(metric_defs::LINK_RX_FRAMES.name).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use wisafe_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const FRAMES: Metric = Metric::counter("wisafe.test.frames")
///     .with_description("Frames seen")
///     .with_unit(Unit::Count)
///     .with_labels(&["command"]);
///
/// assert_eq!(FRAMES.name, "wisafe.test.frames");
/// assert_eq!(FRAMES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "wisafe.link.rx_frames").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn new(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a counter metric.
    pub const fn counter(name: &'static str) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    /// Creates a gauge metric.
    pub const fn gauge(name: &'static str) -> Self {
        Self::new(name, MetricKind::Gauge)
    }

    /// Creates a histogram metric.
    pub const fn histogram(name: &'static str) -> Self {
        Self::new(name, MetricKind::Histogram)
    }

    /// Sets the description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => describe_counter!(self.name, unit, self.description),
            (MetricKind::Counter, None) => describe_counter!(self.name, self.description),
            (MetricKind::Gauge, Some(unit)) => describe_gauge!(self.name, unit, self.description),
            (MetricKind::Gauge, None) => describe_gauge!(self.name, self.description),
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description)
            }
            (MetricKind::Histogram, None) => describe_histogram!(self.name, self.description),
        }
    }
}

/// All metric definitions for the gateway.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Link Layer
    // ========================================================================

    /// Frames read from the radio module.
    pub const LINK_RX_FRAMES: Metric = Metric::counter("wisafe.link.rx_frames")
        .with_description("Frames received from the radio module")
        .with_unit(Unit::Count);

    /// Frames written to the radio module.
    pub const LINK_TX_FRAMES: Metric = Metric::counter("wisafe.link.tx_frames")
        .with_description("Frames transmitted to the radio module")
        .with_unit(Unit::Count);

    /// Frames dropped because escaping overflowed the buffer.
    pub const LINK_TX_OVERFLOW: Metric = Metric::counter("wisafe.link.tx_overflow")
        .with_description("Outbound frames dropped on escape overflow")
        .with_unit(Unit::Count);

    /// Transport read/write failures.
    pub const LINK_IO_ERRORS: Metric = Metric::counter("wisafe.link.io_errors")
        .with_description("Transport read or write failures")
        .with_unit(Unit::Count)
        .with_labels(&["direction"]);

    /// Received frame size in bytes (unescaped).
    pub const LINK_RX_FRAME_SIZE: Metric = Metric::histogram("wisafe.link.rx_frame_size_bytes")
        .with_description("Unescaped received frame size")
        .with_unit(Unit::Bytes);

    // ========================================================================
    // Buffer Pool
    // ========================================================================

    /// Acquire attempts that found the pool empty.
    pub const POOL_EXHAUSTED: Metric = Metric::counter("wisafe.pool.exhausted")
        .with_description("Buffer acquire attempts that found no free slot")
        .with_unit(Unit::Count);

    /// Slots currently in use.
    pub const POOL_IN_USE: Metric = Metric::gauge("wisafe.pool.in_use")
        .with_description("Buffer pool slots currently owned")
        .with_unit(Unit::Count);

    // ========================================================================
    // Engine
    // ========================================================================

    /// Frames dispatched, by command.
    pub const ENGINE_FRAMES: Metric = Metric::counter("wisafe.engine.frames")
        .with_description("Frames dispatched by command")
        .with_unit(Unit::Count)
        .with_labels(&["command"]);

    /// Duplicate sequence numbers suppressed.
    pub const ENGINE_DUPLICATES: Metric = Metric::counter("wisafe.engine.duplicates")
        .with_description("Messages dropped as sequence duplicates")
        .with_unit(Unit::Count);

    /// Frames dropped as malformed or unknown.
    pub const ENGINE_DROPPED: Metric = Metric::counter("wisafe.engine.dropped_frames")
        .with_description("Frames dropped by the decoder")
        .with_unit(Unit::Count)
        .with_labels(&["reason"]);

    /// Outbound commands abandoned because no buffer was free.
    pub const ENGINE_SEND_DEFERRED: Metric = Metric::counter("wisafe.engine.send_deferred")
        .with_description("Outbound commands abandoned on pool exhaustion")
        .with_unit(Unit::Count);

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Missing-node scans completed.
    pub const DISCOVERY_SCANS: Metric = Metric::counter("wisafe.discovery.scans_completed")
        .with_description("Missing-node test sessions completed")
        .with_unit(Unit::Count);

    /// Devices deleted after a missing-node test or flush.
    pub const DISCOVERY_DELETED: Metric = Metric::counter("wisafe.discovery.devices_deleted")
        .with_description("Devices removed from the shadow")
        .with_unit(Unit::Count);

    /// Devices registered from device-tested or remote-id reports.
    pub const DISCOVERY_REGISTERED: Metric = Metric::counter("wisafe.discovery.devices_registered")
        .with_description("Devices newly registered in the shadow")
        .with_unit(Unit::Count);

    /// SIDs present in the map with no known device.
    pub const DISCOVERY_UNKNOWN: Metric = Metric::gauge("wisafe.discovery.unknown_devices")
        .with_description("SIDs present in the network with no known device")
        .with_unit(Unit::Count);

    // ========================================================================
    // Events
    // ========================================================================

    /// Pending fault/alarm records resolved by timeout.
    pub const EVENTS_PENDING_TIMEOUTS: Metric = Metric::counter("wisafe.events.pending_timeouts")
        .with_description("Pending correlation records resolved without a reply")
        .with_unit(Unit::Count)
        .with_labels(&["class"]);

    /// Fault events written to the shadow.
    pub const EVENTS_FAULTS: Metric = Metric::counter("wisafe.events.faults")
        .with_description("Fault events emitted")
        .with_unit(Unit::Count);

    /// Alarm events written to the shadow.
    pub const EVENTS_ALARMS: Metric = Metric::counter("wisafe.events.alarms")
        .with_description("Alarm events emitted")
        .with_unit(Unit::Count);

    /// All metric definitions.
    pub const ALL: &[&Metric] = &[
        &LINK_RX_FRAMES,
        &LINK_TX_FRAMES,
        &LINK_TX_OVERFLOW,
        &LINK_IO_ERRORS,
        &LINK_RX_FRAME_SIZE,
        &POOL_EXHAUSTED,
        &POOL_IN_USE,
        &ENGINE_FRAMES,
        &ENGINE_DUPLICATES,
        &ENGINE_DROPPED,
        &ENGINE_SEND_DEFERRED,
        &DISCOVERY_SCANS,
        &DISCOVERY_DELETED,
        &DISCOVERY_REGISTERED,
        &DISCOVERY_UNKNOWN,
        &EVENTS_PENDING_TIMEOUTS,
        &EVENTS_FAULTS,
        &EVENTS_ALARMS,
    ];
}

/// Registers descriptions for every metric in [`metric_defs::ALL`].
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
