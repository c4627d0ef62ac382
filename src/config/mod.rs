//! Service Configuration Module
//!
//! Runtime tuning for the anomaly and forecast subsystems, loaded from TOML.
//!
//! ## Loading Order
//!
//! 1. `ASSET_INSIGHT_CONFIG` environment variable (path to TOML file)
//! 2. `asset_insight.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! ## Usage
//!
//! ```ignore
//! // In main():
//! config::init(InsightConfig::load());
//!
//! // Anywhere in the codebase:
//! let delay = config::get().map(|c| c.forecast.fallback_delay_ms);
//! ```

mod service_config;
pub mod defaults;
pub mod validation;

pub use service_config::*;

use std::sync::OnceLock;

/// Global service configuration, initialized once at startup.
static INSIGHT_CONFIG: OnceLock<InsightConfig> = OnceLock::new();

/// Initialize the global service configuration.
///
/// Later calls are ignored with a warning.
pub fn init(config: InsightConfig) {
    if INSIGHT_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get the global service configuration, or `None` before `init()`.
pub fn get() -> Option<&'static InsightConfig> {
    INSIGHT_CONFIG.get()
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    INSIGHT_CONFIG.get().is_some()
}
