//! Forecasting
//!
//! Weighted-exponential-average forecasts recomputed on a schedule:
//!
//! ```text
//! lifecycle events ──► ForecastCoordinator ──► ForecastScheduler
//!                                                 │ single task, next-due timestamps
//!                                                 ▼
//!                          history buckets ──► model (WEA) ──► predicted store
//! ```

mod coordinator;
pub mod model;
mod scheduler;

pub use coordinator::ForecastCoordinator;
pub use scheduler::{ForecastScheduler, SchedulerSettings};

use serde::{Deserialize, Serialize};

use crate::storage::StoreError;
use crate::types::{Attribute, AttributeRef, ValueType};

// ============================================================================
// Configuration
// ============================================================================

/// Weighted-exponential-average forecast configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Spacing between the historical samples of one horizon
    pub past_period_ms: i64,
    /// Historical samples per horizon (R)
    pub past_count: u32,
    /// Spacing between forecast horizons
    pub forecast_period_ms: i64,
    /// Horizons computed per run
    pub forecast_count: u32,
}

impl ForecastConfig {
    pub fn new(
        past_period_ms: i64,
        past_count: u32,
        forecast_period_ms: i64,
        forecast_count: u32,
    ) -> Self {
        Self {
            past_period_ms,
            past_count,
            forecast_period_ms,
            forecast_count,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&self) -> Result<(), ForecastError> {
        let mut errors: Vec<String> = Vec::new();

        if self.past_period_ms <= 0 {
            errors.push(format!("past_period_ms must be > 0 (got {})", self.past_period_ms));
        }
        if self.past_count == 0 {
            errors.push("past_count must be >= 1".to_string());
        }
        if self.forecast_period_ms <= 0 {
            errors.push(format!(
                "forecast_period_ms must be > 0 (got {})",
                self.forecast_period_ms
            ));
        }
        if self.forecast_count == 0 {
            errors.push("forecast_count must be >= 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ForecastError::Configuration(errors.join("; ")))
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    #[error("invalid forecast configuration: {0}")]
    Configuration(String),

    #[error("forecasting is not supported for {value_type:?} attribute {attribute}")]
    UnsupportedType {
        attribute: AttributeRef,
        value_type: ValueType,
    },

    #[error("forecast store failure: {0}")]
    Store(#[from] StoreError),

    #[error("forecast scheduler needs a tokio runtime: {0}")]
    Runtime(String),
}

// ============================================================================
// Forecast Attribute
// ============================================================================

/// A forecast-enabled attribute with its pending due timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastAttribute {
    attribute: AttributeRef,
    value_type: ValueType,
    config: ForecastConfig,
    /// Sorted ascending
    timestamps: Vec<i64>,
}

impl ForecastAttribute {
    pub fn new(attribute: AttributeRef, value_type: ValueType, config: ForecastConfig) -> Self {
        Self {
            attribute,
            value_type,
            config,
            timestamps: Vec::new(),
        }
    }

    /// Build from an attribute snapshot.
    ///
    /// Fails on a missing or invalid config and on non-numeric types.
    pub fn from_attribute(entity_id: &str, attribute: &Attribute) -> Result<Self, ForecastError> {
        let attribute_ref = AttributeRef::new(entity_id, attribute.name.as_str());
        let config = attribute.meta.forecast.ok_or_else(|| {
            ForecastError::Configuration(format!("{attribute_ref} has no forecast configuration"))
        })?;
        config.validate()?;
        if !attribute.value_type.is_numeric() {
            return Err(ForecastError::UnsupportedType {
                attribute: attribute_ref,
                value_type: attribute.value_type,
            });
        }
        Ok(Self::new(attribute_ref, attribute.value_type, config))
    }

    pub fn attribute(&self) -> &AttributeRef {
        &self.attribute
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    /// Pending due timestamps, soonest first.
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub(crate) fn set_timestamps(&mut self, timestamps: Vec<i64>) {
        self.timestamps = timestamps;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeMeta;

    #[test]
    fn test_config_validation() {
        assert!(ForecastConfig::new(3_600_000, 3, 600_000, 6).is_valid());
        assert!(!ForecastConfig::new(0, 3, 600_000, 6).is_valid());
        assert!(!ForecastConfig::new(3_600_000, 0, 600_000, 6).is_valid());
        assert!(!ForecastConfig::new(3_600_000, 3, -1, 6).is_valid());
        assert!(!ForecastConfig::new(3_600_000, 3, 600_000, 0).is_valid());
    }

    #[test]
    fn test_attribute_requires_numeric_type() {
        let attribute = Attribute::new("label", ValueType::Text).with_meta(AttributeMeta {
            forecast: Some(ForecastConfig::new(1_000, 1, 1_000, 1)),
            ..AttributeMeta::default()
        });
        assert!(matches!(
            ForecastAttribute::from_attribute("e1", &attribute),
            Err(ForecastError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_attribute_without_config_is_rejected() {
        let attribute = Attribute::new("power", ValueType::Float64);
        assert!(matches!(
            ForecastAttribute::from_attribute("e1", &attribute),
            Err(ForecastError::Configuration(_))
        ));
    }
}
