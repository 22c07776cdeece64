//! Bus connection configuration
//!
//! Priority (highest to lowest):
//! 1. Environment variables prefixed `ETH3BUS_` (nested keys split on `__`)
//! 2. YAML config file, when given
//! 3. Built-in defaults

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{BusError, Result};
use crate::packet::GATEWAY_PORT;
use crate::router::DeviceRecord;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ETH3BUS_";

/// Upper bound for every `*_ms` setting (one day)
pub const MAX_TIMING_MS: u64 = 86_400_000;

/// Upper bound for `queue_capacity`
pub const MAX_QUEUE_CAPACITY: usize = 65_536;

/// Gateway connection and protocol timing
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    /// Gateway host name or IP
    pub host: String,
    /// Gateway TCP port
    pub port: u16,
    /// TCP handshake limit
    pub connect_timeout_ms: u64,
    /// Limit for a single frame write; also the fire-and-forget timeout
    pub write_timeout_ms: u64,
    /// Extra wait for an ACK/NACK on acknowledged requests
    pub ack_margin_ms: u64,
    /// Extra wait for both enumeration ACKs
    pub enumeration_margin_ms: u64,
    /// Gateway closes idle connections; we close first after this long
    pub idle_timeout_ms: u64,
    /// Minimum spacing between two enumeration broadcasts
    pub min_enumeration_interval_ms: u64,
    /// Period of the background enumeration task
    pub enumeration_period_ms: u64,
    /// Operations the driver holds before submitters wait for room
    pub queue_capacity: usize,
    /// Known devices for packet routing
    pub devices: Vec<DeviceRecord>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: GATEWAY_PORT,
            connect_timeout_ms: 3_000,
            write_timeout_ms: 500,
            ack_margin_ms: 1_000,
            enumeration_margin_ms: 2_000,
            idle_timeout_ms: 30_000,
            min_enumeration_interval_ms: 60_000,
            enumeration_period_ms: 60_000,
            queue_capacity: 64,
            devices: Vec::new(),
        }
    }
}

impl BusConfig {
    /// Config for `host:port` with default timing
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Layered figment: defaults, optional YAML file, environment
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(BusConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(BusError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
        }
        Self::from_figment(Self::figment(path))
    }

    /// Extract and validate
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: BusConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the driver cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BusError::config("host must not be empty"));
        }
        if self.port == 0 {
            return Err(BusError::config("port must not be 0"));
        }
        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(BusError::config(format!(
                "queue_capacity must be between 1 and {MAX_QUEUE_CAPACITY}"
            )));
        }

        // (name, value, zero allowed)
        let timing = [
            ("connect_timeout_ms", self.connect_timeout_ms, false),
            ("write_timeout_ms", self.write_timeout_ms, false),
            ("ack_margin_ms", self.ack_margin_ms, true),
            ("enumeration_margin_ms", self.enumeration_margin_ms, true),
            ("idle_timeout_ms", self.idle_timeout_ms, false),
            ("min_enumeration_interval_ms", self.min_enumeration_interval_ms, true),
            ("enumeration_period_ms", self.enumeration_period_ms, false),
        ];
        for (name, value, zero_ok) in timing {
            if value == 0 && !zero_ok {
                return Err(BusError::config(format!("{name} must not be 0")));
            }
            if value > MAX_TIMING_MS {
                return Err(BusError::config(format!(
                    "{name} must not exceed {MAX_TIMING_MS}"
                )));
            }
        }

        Ok(())
    }

    /// `host:port`
    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Deadline for acknowledged requests
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.saturating_add(self.ack_margin_ms))
    }

    /// Deadline for an enumeration
    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_millis(
            self.write_timeout_ms
                .saturating_add(self.enumeration_margin_ms),
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn min_enumeration_interval(&self) -> Duration {
        Duration::from_millis(self.min_enumeration_interval_ms)
    }

    pub fn enumeration_period(&self) -> Duration {
        Duration::from_millis(self.enumeration_period_ms)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_timing() {
        let config = BusConfig::default();

        assert_eq!(config.port, 12347);
        assert_eq!(config.write_timeout(), Duration::from_millis(500));
        assert_eq!(config.ack_timeout(), Duration::from_millis(1_500));
        assert_eq!(config.enumeration_timeout(), Duration::from_millis(2_500));
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.min_enumeration_interval(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_enumeration_interval_independent_of_idle_timeout() {
        let config = BusConfig {
            idle_timeout_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(config.min_enumeration_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_gateway_addr() {
        let config = BusConfig::new("192.168.1.35", 12347);
        assert_eq!(config.gateway_addr(), "192.168.1.35:12347");
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
host: "10.0.0.7"
write_timeout_ms: 250
devices:
  - address: 49
    zone: 0
    device_type: 49
    name: "Living room"
  - address: 49
    zone: 1
    device_type: 49
    name: "Bedroom"
"#
        )
        .unwrap();

        let config = BusConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.host, "10.0.0.7");
        assert_eq!(config.write_timeout_ms, 250);
        assert_eq!(config.ack_timeout(), Duration::from_millis(1_250));
        // untouched keys keep defaults
        assert_eq!(config.port, 12347);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[1].name, "Bedroom");
    }

    #[test]
    fn test_load_missing_file() {
        let err = BusConfig::load(Some(Path::new("/nonexistent/eth3bus.yaml"))).unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = BusConfig {
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BusConfig {
            write_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BusConfig {
            host: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_values() {
        let config = BusConfig {
            ack_margin_ms: u64::MAX,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ack_margin_ms"));

        let config = BusConfig {
            idle_timeout_ms: MAX_TIMING_MS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BusConfig {
            queue_capacity: MAX_QUEUE_CAPACITY + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BusConfig {
            enumeration_margin_ms: MAX_TIMING_MS,
            min_enumeration_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_timeouts_saturate() {
        let config = BusConfig {
            write_timeout_ms: u64::MAX,
            ack_margin_ms: u64::MAX,
            enumeration_margin_ms: 1,
            ..Default::default()
        };
        assert_eq!(config.ack_timeout(), Duration::from_millis(u64::MAX));
        assert_eq!(config.enumeration_timeout(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_from_figment_validates() {
        let figment = Figment::from(Serialized::defaults(BusConfig::default()))
            .merge(Serialized::default("queue_capacity", 0));
        assert!(BusConfig::from_figment(figment).is_err());
    }
}
