//! Anomaly Detection Methods
//!
//! Three statistical rules classify incoming values without buffering full
//! history; each keeps a handful of rolling extrema instead:
//!
//! - **Global**: value must stay within the observed min/max range ± tolerance
//! - **Change**: the increase from the previous value must stay within the
//!   observed increase range ± tolerance
//! - **Timespan**: the interval since the previous datapoint must stay within
//!   the observed interval range ± tolerance
//!
//! Extrema only ever come from datapoints classified `Unchecked` or `Valid`.
//! When an extremum falls out of the configured timespan, the owning
//! [`AnomalyClassifier`] reloads history and refreshes the rule.

mod change;
mod classifier;
mod global;
mod timespan;

pub use change::ChangeRule;
pub use classifier::{AnomalyClassifier, HistoryRequirement};
pub use global::GlobalRule;
pub use timespan::TimespanRule;

use serde::{Deserialize, Serialize};

use crate::storage::StoreError;
use crate::types::{AnomalyType, AttributeRef, Sample, ValueType};

// ============================================================================
// Configuration
// ============================================================================

/// Which rule a [`DetectionConfig`] configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionKind {
    Global,
    Change,
    Timespan,
}

impl DetectionKind {
    /// Classification reported when this rule alone rejects a value.
    pub fn anomaly_type(self) -> AnomalyType {
        match self {
            DetectionKind::Global => AnomalyType::GlobalOutlier,
            DetectionKind::Change => AnomalyType::ContextualOutlier,
            DetectionKind::Timespan => AnomalyType::IrregularInterval,
        }
    }
}

impl std::fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionKind::Global => write!(f, "global"),
            DetectionKind::Change => write!(f, "change"),
            DetectionKind::Timespan => write!(f, "timespan"),
        }
    }
}

/// Per-method configuration carried in attribute metadata.
///
/// Never changes in place; a new configuration replaces the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(rename = "type")]
    pub kind: DetectionKind,

    /// Name used to select this config for diagnostic limit bands
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Tolerance as a percentage of the observed bound range
    pub deviation_percent: f64,

    /// Extrema older than this (relative to the latest datapoint) are stale
    pub timespan_ms: i64,

    /// Datapoints required within the timespan before detection starts
    pub minimum_datapoints: u32,
}

fn default_enabled() -> bool {
    true
}

impl DetectionConfig {
    pub fn new(
        kind: DetectionKind,
        deviation_percent: f64,
        timespan_ms: i64,
        minimum_datapoints: u32,
    ) -> Self {
        Self {
            kind,
            name: kind.to_string(),
            enabled: true,
            deviation_percent,
            timespan_ms,
            minimum_datapoints,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Reject configurations no rule can work with.
    pub fn validate(&self) -> Result<(), DetectionError> {
        let mut errors: Vec<String> = Vec::new();

        if self.timespan_ms <= 0 {
            errors.push(format!("timespan_ms must be > 0 (got {})", self.timespan_ms));
        }
        if self.minimum_datapoints == 0 {
            errors.push("minimum_datapoints must be > 0".to_string());
        }
        if !self.deviation_percent.is_finite() || self.deviation_percent < 0.0 {
            errors.push(format!(
                "deviation_percent must be a finite value >= 0 (got {})",
                self.deviation_percent
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DetectionError::Configuration(format!(
                "{} '{}': {}",
                self.kind,
                self.name,
                errors.join("; ")
            )))
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid detection configuration: {0}")]
    Configuration(String),

    #[error("anomaly detection is not supported for {value_type:?} attribute {attribute}")]
    UnsupportedType {
        attribute: AttributeRef,
        value_type: ValueType,
    },

    #[error("anomaly detection store failure: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// Rule Contract
// ============================================================================

/// Operations shared by every detection rule.
pub trait DetectionRule {
    /// Test a value against the current bounds ± tolerance.
    ///
    /// Accepted values may widen the bounds; rejected values never do.
    fn validate(&mut self, value: f64, timestamp: i64) -> bool;

    /// False once any tracked extremum is older than
    /// `latest_timestamp - timespan`, or when nothing is tracked yet.
    fn is_recent_data_fresh(&self, latest_timestamp: i64) -> bool;

    /// Recompute every bound from scratch using the usable samples
    /// (oldest first). Returns whether bounds are available afterwards;
    /// an empty usable set leaves the rule untouched.
    fn refresh(&mut self, samples: &[Sample]) -> bool;

    /// The current acceptance interval, without touching any state.
    fn current_limits(&self) -> Option<(f64, f64)>;

    /// Absorb a sample into the bounds unconditionally.
    fn observe(&mut self, sample: &Sample);

    /// Trailing band: the interval before `sample`, which is then absorbed.
    fn limits(&mut self, sample: &Sample) -> Option<(f64, f64)> {
        let band = self.current_limits();
        self.observe(sample);
        band
    }
}

/// Tolerance added on both sides of a bound range.
pub(crate) fn tolerance(range: f64, deviation_percent: f64) -> f64 {
    range * deviation_percent / 100.0
}

/// Samples whose classification may shape bounds.
pub(crate) fn usable(samples: &[Sample]) -> impl Iterator<Item = &Sample> + '_ {
    samples.iter().filter(|s| s.classification.is_usable_for_bounds())
}

// ============================================================================
// Method Dispatch
// ============================================================================

/// One configured rule instance.
#[derive(Debug, Clone)]
pub enum DetectionMethod {
    Global(GlobalRule),
    Change(ChangeRule),
    Timespan(TimespanRule),
}

impl DetectionMethod {
    /// Build a fresh (boundless) rule from a validated config.
    pub fn from_config(config: &DetectionConfig) -> Result<Self, DetectionError> {
        config.validate()?;
        Ok(match config.kind {
            DetectionKind::Global => {
                DetectionMethod::Global(GlobalRule::new(config.deviation_percent, config.timespan_ms))
            }
            DetectionKind::Change => {
                DetectionMethod::Change(ChangeRule::new(config.deviation_percent, config.timespan_ms))
            }
            DetectionKind::Timespan => DetectionMethod::Timespan(TimespanRule::new(
                config.deviation_percent,
                config.timespan_ms,
            )),
        })
    }

    pub fn kind(&self) -> DetectionKind {
        match self {
            DetectionMethod::Global(_) => DetectionKind::Global,
            DetectionMethod::Change(_) => DetectionKind::Change,
            DetectionMethod::Timespan(_) => DetectionKind::Timespan,
        }
    }

    pub fn anomaly_type(&self) -> AnomalyType {
        self.kind().anomaly_type()
    }

    fn rule(&self) -> &dyn DetectionRule {
        match self {
            DetectionMethod::Global(rule) => rule,
            DetectionMethod::Change(rule) => rule,
            DetectionMethod::Timespan(rule) => rule,
        }
    }

    fn rule_mut(&mut self) -> &mut dyn DetectionRule {
        match self {
            DetectionMethod::Global(rule) => rule,
            DetectionMethod::Change(rule) => rule,
            DetectionMethod::Timespan(rule) => rule,
        }
    }
}

impl DetectionRule for DetectionMethod {
    fn validate(&mut self, value: f64, timestamp: i64) -> bool {
        self.rule_mut().validate(value, timestamp)
    }

    fn is_recent_data_fresh(&self, latest_timestamp: i64) -> bool {
        self.rule().is_recent_data_fresh(latest_timestamp)
    }

    fn refresh(&mut self, samples: &[Sample]) -> bool {
        self.rule_mut().refresh(samples)
    }

    fn current_limits(&self) -> Option<(f64, f64)> {
        self.rule().current_limits()
    }

    fn observe(&mut self, sample: &Sample) {
        self.rule_mut().observe(sample);
    }
}
