//! # Engine Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_DB_PATH=/var/lib/tally/tally.db                              │
//! │     TALLY_DB_MAX_CONNECTIONS=8                                         │
//! │     TALLY_RETRY_MAX_ATTEMPTS=12                                        │
//! │     TALLY_RETRY_INITIAL_BACKOFF_MS=10                                  │
//! │     TALLY_ALERT_QUEUE=512                                              │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally/engine.toml (Linux)                                │
//! │     ~/Library/Application Support/com.tally.ledger/engine.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/var/lib/tally/tally.db"
//! max_connections = 5
//! busy_timeout_ms = 5000
//!
//! [retry]
//! max_attempts = 10
//! initial_backoff_ms = 5
//! max_backoff_ms = 250
//!
//! [alerts]
//! enabled = true
//! queue_capacity = 256
//! low_stock_threshold = "2.5"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tally_core::Quantity;
use tally_db::{DbConfig, RetryPolicy};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult};

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to the platform data dir when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long SQLite waits on a writer lock before reporting BUSY.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout() -> u64 {
    5_000
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: None,
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Bounded retry for contended units of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts including the first. Exhaustion surfaces as
    /// `ConcurrencyExhausted`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_initial_backoff() -> u64 {
    5
}
fn default_max_backoff() -> u64 {
    250
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

// =============================================================================
// Alert Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Alerts buffered before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Balances at or below this after a committed deduction raise a
    /// low-stock alert. Accepts `5` or `"2.5"`.
    #[serde(default = "default_low_stock_threshold")]
    pub low_stock_threshold: Quantity,
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    256
}

fn default_low_stock_threshold() -> Quantity {
    Quantity::from(5)
}

impl Default for AlertSettings {
    fn default() -> Self {
        AlertSettings {
            enabled: true,
            queue_capacity: default_queue_capacity(),
            low_stock_threshold: default_low_stock_threshold(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub alerts: AlertSettings,
}

impl EngineConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (engine.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> ConfigResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| ConfigError::SaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be greater than 0".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }

        if self.alerts.enabled && self.alerts.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "alerts.queue_capacity must be greater than 0".into(),
            ));
        }

        if self.alerts.low_stock_threshold.is_negative() {
            return Err(ConfigError::Invalid(
                "alerts.low_stock_threshold cannot be negative".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TALLY_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = Some(PathBuf::from(path));
        }

        if let Ok(max) = std::env::var("TALLY_DB_MAX_CONNECTIONS") {
            match max.parse::<u32>() {
                Ok(m) => self.database.max_connections = m,
                Err(_) => warn!(value = %max, "Ignoring invalid TALLY_DB_MAX_CONNECTIONS"),
            }
        }

        if let Ok(attempts) = std::env::var("TALLY_RETRY_MAX_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(a) => self.retry.max_attempts = a,
                Err(_) => warn!(value = %attempts, "Ignoring invalid TALLY_RETRY_MAX_ATTEMPTS"),
            }
        }

        if let Ok(ms) = std::env::var("TALLY_RETRY_INITIAL_BACKOFF_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.retry.initial_backoff_ms = ms;
            }
        }

        if let Ok(capacity) = std::env::var("TALLY_ALERT_QUEUE") {
            if let Ok(c) = capacity.parse::<usize>() {
                debug!(capacity = c, "Overriding alert queue capacity from environment");
                self.alerts.queue_capacity = c;
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "ledger")
            .map(|dirs| dirs.config_dir().join("engine.toml"))
    }

    fn default_database_path() -> PathBuf {
        directories::ProjectDirs::from("com", "tally", "ledger")
            .map(|dirs| dirs.data_dir().join("tally.db"))
            .unwrap_or_else(|| PathBuf::from("./tally.db"))
    }

    // =========================================================================
    // Conversions
    // =========================================================================

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .max_attempts(self.retry.max_attempts)
            .initial_backoff(Duration::from_millis(self.retry.initial_backoff_ms))
            .max_backoff(Duration::from_millis(self.retry.max_backoff_ms))
    }

    /// Database configuration for [`tally_db::Database::new`].
    pub fn db_config(&self) -> DbConfig {
        let path = self
            .database
            .path
            .clone()
            .unwrap_or_else(Self::default_database_path);

        DbConfig::new(path)
            .max_connections(self.database.max_connections)
            .busy_timeout(Duration::from_millis(self.database.busy_timeout_ms))
            .retry(self.retry_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 10);
        assert!(config.alerts.enabled);
        assert_eq!(config.alerts.queue_capacity, 256);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [database]
            path = "/tmp/tally-test.db"

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.database.path, Some(PathBuf::from("/tmp/tally-test.db")));
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.max_backoff_ms, 250);
        assert_eq!(config.alerts.low_stock_threshold, Quantity::from(5));
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();

        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        config.retry.max_attempts = 4;
        config.retry.initial_backoff_ms = 1_000;
        assert!(config.validate().is_err());

        config.retry.initial_backoff_ms = 5;
        config.alerts.queue_capacity = 0;
        assert!(config.validate().is_err());

        config.alerts.enabled = false;
        assert!(config.validate().is_ok());

        config.alerts.low_stock_threshold = "-0.5".parse().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fractional_threshold_survives_save_and_load() {
        let mut config = EngineConfig::default();
        config.alerts.low_stock_threshold = "2.5".parse().unwrap();

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let loaded: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(loaded.alerts.low_stock_threshold.to_string(), "2.5");
    }

    #[test]
    fn test_db_config_carries_retry_policy() {
        let mut config = EngineConfig::default();
        config.database.path = Some(PathBuf::from("/tmp/x.db"));
        config.retry.max_attempts = 7;

        let db = config.db_config();
        assert_eq!(db.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(db.retry.max_attempts, 7);
        assert_eq!(db.retry.initial_backoff, Duration::from_millis(5));
    }

    #[test]
    fn test_toml_serialization() {
        let toml_str = toml::to_string_pretty(&EngineConfig::default()).unwrap();
        assert!(toml_str.contains("[retry]"));
        assert!(toml_str.contains("[alerts]"));
    }
}
