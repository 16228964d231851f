//! Gateway configuration.
//!
//! Loaded from YAML. Every section and field has a default, so an empty file
//! (or no file at all) yields the timings the radio network expects:
//!
//! ```yaml
//! connect: 127.0.0.1:7300
//! link:
//!   pool_slots: 10
//! discovery:
//!   missing_test_period: 18h
//!   min_spacing: 30s
//!   reply_timeout: 60s
//! events:
//!   transaction_timeout: 30s
//! ```
//!
//! Durations are written with a unit suffix (`h`, `m`, `s` or `ms`); a bare
//! number is taken as seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use wisafe_link::LinkConfig;

use crate::error::{ConfigError, ConfigResult};

/// Environment variable overriding [`DiscoveryConfig::missing_test_period`].
pub const MISSING_TEST_PERIOD_ENV: &str = "testMissingNormalPeriod";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address of the radio module bridge, if not given on the command line.
    pub connect: Option<String>,
    /// Link and buffer pool settings.
    pub link: LinkConfig,
    /// Discovery and missing-node test timings.
    pub discovery: DiscoveryConfig,
    /// Event correlation settings.
    pub events: EventConfig,
}

impl GatewayConfig {
    /// Load from a YAML file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_yaml(&text)?;
        config.apply_env()?;
        config.validate()?;
        info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Parse from YAML text without applying overrides.
    pub fn from_yaml(text: &str) -> ConfigResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        if let Ok(value) = std::env::var(MISSING_TEST_PERIOD_ENV) {
            self.discovery.missing_test_period = parse_duration(&value)?;
            info!(
                "{} = {:?}",
                MISSING_TEST_PERIOD_ENV, self.discovery.missing_test_period
            );
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.link.pool_slots == 0 {
            return Err(ConfigError::InvalidValue {
                field: "link.pool_slots",
                reason: "must be at least 1".to_string(),
            });
        }
        self.discovery.validate()?;
        if self.events.transaction_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "events.transaction_timeout",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Set the radio module address.
    pub fn with_connect(mut self, addr: impl Into<String>) -> Self {
        self.connect = Some(addr.into());
        self
    }

    /// Set the discovery section.
    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }
}

/// Network membership and missing-node test timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Delay before the first SID map request after startup.
    #[serde(with = "duration_str")]
    pub startup_fetch: Duration,
    /// SID map refresh interval in normal operation.
    #[serde(with = "duration_str")]
    pub normal_refresh: Duration,
    /// SID map refresh interval while in learn mode.
    #[serde(with = "duration_str")]
    pub learn_refresh: Duration,
    /// Interval between periodic missing-node tests.
    #[serde(with = "duration_str")]
    pub missing_test_period: Duration,
    /// Minimum time between probes within one test.
    #[serde(with = "duration_str")]
    pub min_spacing: Duration,
    /// How long to wait for a missing-node report.
    #[serde(with = "duration_str")]
    pub reply_timeout: Duration,
    /// A test that runs longer than this is abandoned.
    #[serde(with = "duration_str")]
    pub max_test_duration: Duration,
    /// Missing-node reports needed to confirm a device is gone.
    pub required_scans: u32,
    /// Interval between SID map updates that remove missing devices.
    #[serde(with = "duration_str")]
    pub update_delete_period: Duration,
    /// Number of removal updates to send.
    pub update_delete_count: u32,
    /// How long to wait for a remote identity reply.
    #[serde(with = "duration_str")]
    pub interrogation_period: Duration,
    /// Identity requests per SID before giving up on it.
    pub max_interrogations: u8,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            startup_fetch: Duration::from_secs(3),
            normal_refresh: Duration::from_secs(60),
            learn_refresh: Duration::from_secs(5),
            missing_test_period: Duration::from_secs(18 * 60 * 60),
            min_spacing: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(60),
            max_test_duration: Duration::from_secs(360),
            required_scans: 3,
            update_delete_period: Duration::from_secs(30),
            update_delete_count: 3,
            interrogation_period: Duration::from_secs(60),
            max_interrogations: 5,
        }
    }
}

impl DiscoveryConfig {
    /// Check that the timings are usable.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_spacing >= self.reply_timeout {
            return Err(ConfigError::Spacing {
                spacing: self.min_spacing,
                timeout: self.reply_timeout,
            });
        }
        let counts = [
            ("discovery.required_scans", self.required_scans),
            ("discovery.update_delete_count", self.update_delete_count),
            ("discovery.max_interrogations", u32::from(self.max_interrogations)),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.missing_test_period < self.max_test_duration {
            warn!(
                "missing_test_period {:?} is shorter than max_test_duration {:?}",
                self.missing_test_period, self.max_test_duration
            );
        }
        Ok(())
    }

    /// Set the periodic missing-node test interval.
    pub fn with_missing_test_period(mut self, period: Duration) -> Self {
        self.missing_test_period = period;
        self
    }

    /// Set the probe spacing and reply timeout.
    pub fn with_probe_timing(mut self, min_spacing: Duration, reply_timeout: Duration) -> Self {
        self.min_spacing = min_spacing;
        self.reply_timeout = reply_timeout;
        self
    }
}

/// Event correlation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// How long a fault or alarm waits for its follow-up before being reported anyway.
    #[serde(with = "duration_str")]
    pub transaction_timeout: Duration,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(30),
        }
    }
}

/// Parse `"18h"`, `"30m"`, `"60s"`, `"250ms"` or a bare number of seconds.
pub fn parse_duration(text: &str) -> ConfigResult<Duration> {
    let text = text.trim();
    let invalid = || ConfigError::InvalidDuration(text.to_string());

    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let secs = match unit.trim() {
        "ms" => return Ok(Duration::from_millis(value)),
        "" | "s" => value,
        "m" => value.checked_mul(60).ok_or_else(invalid)?,
        "h" => value.checked_mul(60 * 60).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(secs))
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() != 0 || duration.as_secs() == 0 {
        return format!("{}ms", duration.as_millis());
    }
    let secs = duration.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("18h").expect("h"), Duration::from_secs(64_800));
        assert_eq!(parse_duration("30m").expect("m"), Duration::from_secs(1800));
        assert_eq!(parse_duration("60s").expect("s"), Duration::from_secs(60));
        assert_eq!(parse_duration("45").expect("bare"), Duration::from_secs(45));
        assert_eq!(parse_duration("1ms").expect("ms"), Duration::from_millis(1));
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(64_800)), "18h");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = GatewayConfig::from_yaml("").expect("empty");
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.discovery.required_scans, 3);
        assert_eq!(config.link.pool_slots, 10);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_yaml_sections() {
        let yaml = r#"
connect: "10.0.0.2:7300"
discovery:
  missing_test_period: 2h
  min_spacing: 10s
  reply_timeout: 20
events:
  transaction_timeout: 5s
"#;
        let config = GatewayConfig::from_yaml(yaml).expect("parse");
        assert_eq!(config.connect.as_deref(), Some("10.0.0.2:7300"));
        assert_eq!(config.discovery.missing_test_period, Duration::from_secs(7200));
        assert_eq!(config.discovery.min_spacing, Duration::from_secs(10));
        assert_eq!(config.discovery.reply_timeout, Duration::from_secs(20));
        assert_eq!(config.discovery.learn_refresh, Duration::from_secs(5));
        assert_eq!(config.events.transaction_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_spacing_must_be_below_reply_timeout() {
        let discovery = DiscoveryConfig::default()
            .with_probe_timing(Duration::from_secs(60), Duration::from_secs(60));
        let config = GatewayConfig::default().with_discovery(discovery);
        assert!(matches!(config.validate(), Err(ConfigError::Spacing { .. })));
    }

    #[test]
    fn test_zero_counts_rejected() {
        let mut config = GatewayConfig::default();
        config.discovery.required_scans = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "discovery.required_scans",
                ..
            })
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides_missing_test_period() {
        std::env::set_var(MISSING_TEST_PERIOD_ENV, "15m");
        let mut config = GatewayConfig::default();
        let result = config.apply_env();
        std::env::remove_var(MISSING_TEST_PERIOD_ENV);
        result.expect("override");
        assert_eq!(config.discovery.missing_test_period, Duration::from_secs(900));
    }

    #[test]
    #[serial]
    fn test_env_override_rejects_garbage() {
        std::env::set_var(MISSING_TEST_PERIOD_ENV, "soon");
        let mut config = GatewayConfig::default();
        let result = config.apply_env();
        std::env::remove_var(MISSING_TEST_PERIOD_ENV);
        assert!(matches!(result, Err(ConfigError::InvalidDuration(_))));
    }
}
