//! Service Configuration - anomaly, forecast and storage tuning as TOML values
//!
//! Each struct implements `Default` with the values in [`super::defaults`],
//! so a missing file or a partial file behaves exactly like the built-ins.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults::{
    CONFIG_ENV_VAR, DEFAULT_DB_PATH, FALLBACK_SCHEDULE_DELAY, LIMITS_HISTORY_MULTIPLIER,
    LOCAL_CONFIG_FILE, SAFE_CANCEL_WINDOW, SHUTDOWN_POLL_INTERVAL, STOP_TIMEOUT,
};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one service instance.
///
/// Load with `InsightConfig::load()` which searches:
/// 1. `$ASSET_INSIGHT_CONFIG` env var
/// 2. `./asset_insight.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsightConfig {
    #[serde(default)]
    pub anomaly: AnomalyServiceConfig,

    #[serde(default)]
    pub forecast: ForecastServiceConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl InsightConfig {
    /// Load configuration using the standard search order.
    ///
    /// A file that fails to load or validate is logged and skipped.
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded service config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        // 2. Check working directory
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded service config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        // 3. Defaults
        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        for w in super::validation::validate_unknown_keys(&contents) {
            warn!("{}", w);
        }

        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate all values for internal consistency.
    ///
    /// Rules:
    /// - All delays and timeouts must be > 0
    /// - The shutdown poll interval must be shorter than the stop timeout
    /// - The limits history multiplier must be > 0
    /// - The storage path must not be empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.anomaly.limits_history_multiplier == 0 {
            errors.push("anomaly.limits_history_multiplier must be > 0".to_string());
        }

        let f = &self.forecast;
        for (name, value) in [
            ("forecast.stop_timeout_ms", f.stop_timeout_ms),
            ("forecast.safe_cancel_window_ms", f.safe_cancel_window_ms),
            ("forecast.fallback_delay_ms", f.fallback_delay_ms),
            ("forecast.shutdown_poll_ms", f.shutdown_poll_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be > 0"));
            }
        }
        if f.shutdown_poll_ms >= f.stop_timeout_ms {
            errors.push(format!(
                "forecast.shutdown_poll_ms ({}) must be less than stop_timeout_ms ({})",
                f.shutdown_poll_ms, f.stop_timeout_ms
            ));
        }

        if self.storage.path.trim().is_empty() {
            errors.push("storage.path must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),

    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),

    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Anomaly Detection
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyServiceConfig {
    /// Run the anomaly detection coordinator
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Diagnostic limit bands look back this many configured timespans
    #[serde(default = "default_limits_history_multiplier")]
    pub limits_history_multiplier: u32,
}

impl Default for AnomalyServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limits_history_multiplier: LIMITS_HISTORY_MULTIPLIER,
        }
    }
}

// ============================================================================
// Forecast Scheduler
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastServiceConfig {
    /// Run the forecast coordinator and scheduler
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long shutdown waits for an in-flight tick before interrupting it
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Minimum remaining delay for a pending task to be cancelled cleanly
    #[serde(default = "default_safe_cancel_window_ms")]
    pub safe_cancel_window_ms: u64,

    /// Reschedule delay after a failed tick or when nothing is due
    #[serde(default = "default_fallback_delay_ms")]
    pub fallback_delay_ms: u64,

    /// Poll interval while shutdown waits for an in-flight tick
    #[serde(default = "default_shutdown_poll_ms")]
    pub shutdown_poll_ms: u64,
}

impl ForecastServiceConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for ForecastServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stop_timeout_ms: default_stop_timeout_ms(),
            safe_cancel_window_ms: default_safe_cancel_window_ms(),
            fallback_delay_ms: default_fallback_delay_ms(),
            shutdown_poll_ms: default_shutdown_poll_ms(),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sled database directory
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

// ============================================================================
// Serde Defaults
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_limits_history_multiplier() -> u32 {
    LIMITS_HISTORY_MULTIPLIER
}

#[allow(clippy::cast_possible_truncation)]
fn default_stop_timeout_ms() -> u64 {
    STOP_TIMEOUT.as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
fn default_safe_cancel_window_ms() -> u64 {
    SAFE_CANCEL_WINDOW.as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
fn default_fallback_delay_ms() -> u64 {
    FALLBACK_SCHEDULE_DELAY.as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
fn default_shutdown_poll_ms() -> u64 {
    SHUTDOWN_POLL_INTERVAL.as_millis() as u64
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}
