//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/trackrelay/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/trackrelay/` (~/.config/trackrelay/)
//! - Data: `$XDG_DATA_HOME/trackrelay/` (~/.local/share/trackrelay/)
//! - State/Logs: `$XDG_STATE_HOME/trackrelay/` (~/.local/state/trackrelay/)

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted retention window (about a century)
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Delivery pipeline settings
    #[serde(default)]
    pub relay: RelayConfig,

    /// Durable queue settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Delivery pipeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Collector base URL; requests go to `{base_endpoint}/{tag}`
    #[serde(default = "default_base_endpoint")]
    pub base_endpoint: String,

    /// Endpoint tag used when an inbound message names none
    #[serde(default = "default_endpoint_tag")]
    pub default_endpoint: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Queued events older than this are dropped by the aging sweep
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Name of the connectivity-restored signal that triggers a drain
    #[serde(default = "default_sync_tag")]
    pub sync_tag: String,

    /// How often the relay checks for a pending sync registration
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_endpoint: default_base_endpoint(),
            default_endpoint: default_endpoint_tag(),
            timeout_secs: default_timeout(),
            retention_days: default_retention_days(),
            sync_tag: default_sync_tag(),
            sync_interval_secs: default_sync_interval(),
        }
    }
}

impl RelayConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let endpoint = self.base_endpoint.trim();
        if endpoint.is_empty() {
            return Err(Error::Config("relay.base_endpoint is required".to_string()));
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(Error::Config(format!(
                "relay.base_endpoint must be an http(s) URL, got {:?}",
                endpoint
            )));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "relay.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.retention_days == 0 {
            return Err(Error::Config(
                "relay.retention_days must be greater than 0".to_string(),
            ));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(Error::Config(format!(
                "relay.retention_days must be at most {}, got {}",
                MAX_RETENTION_DAYS, self.retention_days
            )));
        }
        if self.sync_tag.trim().is_empty() {
            return Err(Error::Config("relay.sync_tag must not be empty".to_string()));
        }
        Ok(())
    }

    /// Retention window for the aging sweep
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Creation time before which the aging sweep drops records.
    ///
    /// A window reaching past the earliest representable time sweeps nothing.
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.retention())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Interval between sync registration checks (never below one second)
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}

fn default_base_endpoint() -> String {
    "https://collector.example.com/functions/v1/track-event".to_string()
}

fn default_endpoint_tag() -> String {
    "event".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_retention_days() -> u32 {
    7
}

fn default_sync_tag() -> String {
    "tracking-sync".to_string()
}

fn default_sync_interval() -> u64 {
    30
}

/// Durable queue configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StoreConfig {
    /// Override for the queue database path
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.relay.validate()?;
        Ok(config)
    }

    /// Queue database path, honoring `store.path`
    pub fn queue_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(Self::default_queue_path)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/trackrelay/config.toml` (~/.config/trackrelay/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("trackrelay").join("config.toml")
    }

    /// Returns the data directory path (for the queue database)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("trackrelay")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("trackrelay")
    }

    /// Returns the default queue database path
    ///
    /// `$XDG_DATA_HOME/trackrelay/queue.db` (~/.local/share/trackrelay/queue.db)
    pub fn default_queue_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// Called by the binary before anything reads these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.default_endpoint, "event");
        assert_eq!(config.relay.retention_days, 7);
        assert_eq!(config.relay.sync_tag, "tracking-sync");
        assert_eq!(config.logging.level, "info");
        assert!(config.store.path.is_none());
        assert!(config.relay.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[relay]
base_endpoint = "https://collector.test/track"
timeout_secs = 3
retention_days = 14

[store]
path = "/tmp/custom-queue.db"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.relay.base_endpoint, "https://collector.test/track");
        assert_eq!(config.relay.timeout(), Duration::from_secs(3));
        assert_eq!(config.relay.retention(), chrono::Duration::days(14));
        // Unspecified fields keep their defaults
        assert_eq!(config.relay.sync_tag, "tracking-sync");
        assert_eq!(config.queue_path(), PathBuf::from("/tmp/custom-queue.db"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_relay_config_validation() {
        let config = RelayConfig {
            base_endpoint: "".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            base_endpoint: "ftp://collector.test".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            retention_days: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            sync_tag: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_window_is_capped() {
        let config = RelayConfig {
            retention_days: MAX_RETENTION_DAYS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = RelayConfig {
            retention_days: MAX_RETENTION_DAYS + 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_retention_cutoff_saturates() {
        use chrono::TimeZone;
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        let config = RelayConfig::default();
        assert_eq!(config.retention_cutoff(now), now - chrono::Duration::days(7));

        let config = RelayConfig {
            retention_days: u32::MAX,
            ..Default::default()
        };
        assert_eq!(config.retention_cutoff(now), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_sync_interval_floor() {
        let config = RelayConfig {
            sync_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.sync_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_rejects_invalid_relay() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay]\nbase_endpoint = \"not-a-url\"\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
