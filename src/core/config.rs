//! Peripheral Configuration
//!
//! Tunables for the filter, the radio timeouts and the advertising payload.
//! All fields have defaults, so an empty JSON object is a valid configuration.

use crate::core::constants::{
    DEFAULT_ADVERTISE_BACKOFF_MAX, DEFAULT_GRACE_PERIOD, DEFAULT_HOST_TIMEOUT,
    MIN_ADVERTISE_BACKOFF,
};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Advertising interval class requested from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    #[default]
    LowLatency,
}

/// Transmit power level requested from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxPower {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

/// Settings passed to the host along with the service descriptor when advertising.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub tx_power: TxPower,
    pub connectable: bool,
    pub include_device_name: bool,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::default(),
            tx_power: TxPower::default(),
            connectable: true,
            include_device_name: true,
        }
    }
}

/// Runtime configuration of the heart-rate peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Name announced in the advertisement when `include_device_name` is set.
    pub local_name: String,
    /// Whether the sensor can tell if it touches skin.
    pub contact_supported: bool,
    /// How long a reliable sample suppresses unreliable ones.
    pub grace_period_ms: u64,
    /// Upper bound for any single call into the radio host.
    pub host_timeout_ms: u64,
    /// First delay of the advertising retry loop.
    pub advertise_backoff_ms: u64,
    pub advertise_backoff_max_ms: u64,
    /// Notifications allowed on air at the same time across all peers.
    pub max_concurrent_notifications: usize,
    pub advertising: AdvertiseSettings,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            local_name: "Wear HR".to_owned(),
            contact_supported: true,
            grace_period_ms: DEFAULT_GRACE_PERIOD.as_millis() as u64,
            host_timeout_ms: DEFAULT_HOST_TIMEOUT.as_millis() as u64,
            advertise_backoff_ms: MIN_ADVERTISE_BACKOFF.as_millis() as u64,
            advertise_backoff_max_ms: DEFAULT_ADVERTISE_BACKOFF_MAX.as_millis() as u64,
            max_concurrent_notifications: 4,
            advertising: AdvertiseSettings::default(),
        }
    }
}

impl PeripheralConfig {
    /// Parses and validates a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid peripheral config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("could not read {}", path.display()))?;
        Self::from_json_str(&json)
    }

    /// Checks the invariants the peripheral relies on.
    pub fn validate(&self) -> Result<()> {
        if self.advertise_backoff() < MIN_ADVERTISE_BACKOFF {
            return Err(anyhow!(
                "advertise_backoff_ms must be at least {} ms",
                MIN_ADVERTISE_BACKOFF.as_millis()
            ));
        }
        if self.advertise_backoff_max_ms < self.advertise_backoff_ms {
            return Err(anyhow!(
                "advertise_backoff_max_ms must not be below advertise_backoff_ms"
            ));
        }
        if self.host_timeout_ms == 0 {
            return Err(anyhow!("host_timeout_ms must be positive"));
        }
        if self.max_concurrent_notifications == 0 {
            return Err(anyhow!("max_concurrent_notifications must be positive"));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn host_timeout(&self) -> Duration {
        Duration::from_millis(self.host_timeout_ms)
    }

    pub fn advertise_backoff(&self) -> Duration {
        Duration::from_millis(self.advertise_backoff_ms)
    }

    pub fn advertise_backoff_max(&self) -> Duration {
        Duration::from_millis(self.advertise_backoff_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempdir::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = PeripheralConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grace_period(), Duration::from_secs(10));
        assert_eq!(config.host_timeout(), Duration::from_secs(2));
        assert_eq!(config.advertising.mode, AdvertiseMode::LowLatency);
        assert_eq!(config.advertising.tx_power, TxPower::Medium);
    }

    #[test]
    fn test_empty_object_yields_defaults() {
        let config = PeripheralConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PeripheralConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = PeripheralConfig::from_json_str(
            r#"{"local_name":"Strap","grace_period_ms":5000,"advertising":{"tx_power":"high"}}"#,
        )
        .unwrap();
        assert_eq!(config.local_name, "Strap");
        assert_eq!(config.grace_period(), Duration::from_secs(5));
        assert_eq!(config.advertising.tx_power, TxPower::High);
        assert!(config.advertising.connectable);
    }

    #[test]
    fn test_rejects_busy_loop_backoff() {
        let result = PeripheralConfig::from_json_str(r#"{"advertise_backoff_ms":100}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let result = PeripheralConfig::from_json_str(r#"{"max_concurrent_notifications":0}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = TempDir::new("hrs_config").unwrap();
        let path = dir.path().join("config.json");
        let mut file = File::create(&path).unwrap();
        write!(file, r#"{{"host_timeout_ms":500}}"#).unwrap();

        let config = PeripheralConfig::load(&path).await.unwrap();
        assert_eq!(config.host_timeout(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = TempDir::new("hrs_config").unwrap();
        assert!(PeripheralConfig::load(dir.path().join("nope.json"))
            .await
            .is_err());
    }
}
