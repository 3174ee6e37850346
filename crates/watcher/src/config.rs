//! Watch service configuration

use crate::error::{Result, WatchError};
use serde::{Deserialize, Serialize};

/// Event port backing a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortBackend {
    /// Kernel notification where available (inotify on Linux), stat scans elsewhere
    #[default]
    Native,
    /// Periodic stat(2) scans on every platform
    Stat,
}

/// Configuration for a [`WatchService`](crate::WatchService)
///
/// Every field has a default, so a TOML document only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Event port to open
    pub backend: PortBackend,

    /// Maximum port events drained per wait
    pub max_events_per_wait: usize,

    /// Scan interval of the stat-based port, in milliseconds
    pub poll_interval_ms: u64,

    /// Maximum files associated with the port at once
    pub max_associations: usize,

    /// Pending events per handle before they collapse into an overflow
    pub max_pending_events: usize,

    /// Re-check that an entry is really gone before reporting its deletion
    ///
    /// Some kernels report removal for operations that failed. Disabling the
    /// re-check trusts the port's delete events as-is.
    pub verify_deletes: bool,

    /// Name of the poller thread
    pub thread_name: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backend: PortBackend::Native,
            max_events_per_wait: 128,
            poll_interval_ms: 50,
            max_associations: 65_536,
            max_pending_events: 512,
            verify_deletes: true,
            thread_name: "watch-poller".to_string(),
        }
    }
}

impl WatchConfig {
    /// Parse a configuration from TOML
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| WatchError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the poller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_events_per_wait == 0 {
            return Err(WatchError::InvalidConfig("max_events_per_wait must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(WatchError::InvalidConfig("poll_interval_ms must be at least 1".into()));
        }
        if self.max_associations == 0 {
            return Err(WatchError::InvalidConfig("max_associations must be at least 1".into()));
        }
        if self.max_pending_events == 0 {
            return Err(WatchError::InvalidConfig("max_pending_events must be at least 1".into()));
        }
        if self.thread_name.is_empty() {
            return Err(WatchError::InvalidConfig("thread_name must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WatchConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.verify_deletes);
        assert_eq!(config.max_pending_events, 512);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WatchConfig::from_toml_str("poll_interval_ms = 10\nverify_deletes = false\n").unwrap();
        assert_eq!(config.poll_interval_ms, 10);
        assert!(!config.verify_deletes);
        assert_eq!(config.max_events_per_wait, WatchConfig::default().max_events_per_wait);
        assert_eq!(config.backend, PortBackend::Native);
    }

    #[test]
    fn test_backend_from_toml() {
        let config = WatchConfig::from_toml_str("backend = \"stat\"").unwrap();
        assert_eq!(config.backend, PortBackend::Stat);
        assert!(matches!(
            WatchConfig::from_toml_str("backend = \"kqueue\""),
            Err(WatchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(matches!(
            WatchConfig::from_toml_str("max_events_per_wait = 0"),
            Err(WatchError::InvalidConfig(_))
        ));

        let config = WatchConfig {
            thread_name: String::new(),
            ..WatchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_toml() {
        assert!(matches!(
            WatchConfig::from_toml_str("poll_interval_ms = \"fast\""),
            Err(WatchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = WatchConfig {
            max_associations: 8,
            ..WatchConfig::default()
        };
        let encoded = toml::to_string(&config).unwrap();
        assert_eq!(WatchConfig::from_toml_str(&encoded).unwrap(), config);
    }
}
