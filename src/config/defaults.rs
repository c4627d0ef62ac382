//! System-wide default constants.
//!
//! Every tunable in `asset_insight.toml` falls back to one of these values.
//! Grouped by subsystem for easy discovery.

use std::time::Duration;

// ============================================================================
// Anomaly Detection
// ============================================================================

/// Added to the Global method's min/max range so a flat history (min == max)
/// still produces a non-zero tolerance band.
pub const GLOBAL_RANGE_EPSILON: f64 = 0.001;

/// Diagnostic limit bands replay this many configured timespans of history.
pub const LIMITS_HISTORY_MULTIPLIER: u32 = 5;

/// Minimum number of samples a history load must return before a
/// classifier considers itself ready.
pub const MIN_HISTORY_SAMPLES: usize = 2;

// ============================================================================
// Forecast Scheduler
// ============================================================================

/// A pending forecast task is only cancelled cleanly when its remaining delay
/// exceeds this window; closer than that the tick may already be running.
pub const SAFE_CANCEL_WINDOW: Duration = Duration::from_secs(2);

/// Delay before the next attempt after a failed tick, or when attributes are
/// registered but none has a pending due timestamp.
pub const FALLBACK_SCHEDULE_DELAY: Duration = Duration::from_secs(15 * 60);

/// Maximum time `shutdown` waits for an in-flight tick before interrupting it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while `shutdown` waits for an in-flight tick.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(300);

// ============================================================================
// Storage
// ============================================================================

/// Default sled database location.
pub const DEFAULT_DB_PATH: &str = "./data/asset_insight.db";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "ASSET_INSIGHT_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "asset_insight.toml";
