//! Per-attribute classifier bundling the configured detection methods.
//!
//! Runs inline on the attribute-event path: every call may block on the
//! datapoint stores when history has to be (re)loaded.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{DetectionConfig, DetectionError, DetectionMethod, DetectionRule};
use crate::config::defaults::MIN_HISTORY_SAMPLES;
use crate::storage::{AnomalyDatapointStore, DatapointStore, StoreError};
use crate::types::{AnomalyType, Attribute, AttributeRef, Sample};

/// History needed before the strictest enabled method can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryRequirement {
    pub timespan_ms: i64,
    pub minimum_datapoints: usize,
}

impl HistoryRequirement {
    fn from_configs<'a>(configs: impl Iterator<Item = &'a DetectionConfig>) -> Self {
        configs.fold(Self::default(), |acc, config| Self {
            timespan_ms: acc.timespan_ms.max(config.timespan_ms),
            minimum_datapoints: acc.minimum_datapoints.max(config.minimum_datapoints as usize),
        })
    }
}

/// A configured method together with its source config.
#[derive(Debug, Clone)]
struct ConfiguredMethod {
    config: DetectionConfig,
    method: DetectionMethod,
}

pub struct AnomalyClassifier {
    attribute: AttributeRef,
    methods: Vec<ConfiguredMethod>,
    requirement: HistoryRequirement,
    has_sufficient_history: bool,
    datapoints: Arc<dyn DatapointStore>,
    anomalies: Arc<dyn AnomalyDatapointStore>,
}

impl std::fmt::Debug for AnomalyClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyClassifier")
            .field("attribute", &self.attribute)
            .field("methods", &self.methods)
            .field("has_sufficient_history", &self.has_sufficient_history)
            .finish_non_exhaustive()
    }
}

impl AnomalyClassifier {
    /// Build a classifier with boundless methods; history is loaded lazily
    /// on the first event.
    pub fn new(
        attribute: AttributeRef,
        configs: &[DetectionConfig],
        datapoints: Arc<dyn DatapointStore>,
        anomalies: Arc<dyn AnomalyDatapointStore>,
    ) -> Result<Self, DetectionError> {
        if attribute.entity_id.trim().is_empty() {
            return Err(DetectionError::InvalidArgument(
                "entity id must not be empty".to_string(),
            ));
        }
        if attribute.attribute_name.trim().is_empty() {
            return Err(DetectionError::InvalidArgument(format!(
                "attribute name of entity {} must not be empty",
                attribute.entity_id
            )));
        }

        let methods = configs
            .iter()
            .map(|config| {
                Ok(ConfiguredMethod {
                    method: DetectionMethod::from_config(config)?,
                    config: config.clone(),
                })
            })
            .collect::<Result<Vec<_>, DetectionError>>()?;

        let requirement = HistoryRequirement::from_configs(
            methods.iter().filter(|m| m.config.enabled).map(|m| &m.config),
        );

        Ok(Self {
            attribute,
            methods,
            requirement,
            has_sufficient_history: false,
            datapoints,
            anomalies,
        })
    }

    /// Build from an attribute snapshot carrying anomaly-detection meta.
    pub fn for_attribute(
        entity_id: &str,
        attribute: &Attribute,
        datapoints: Arc<dyn DatapointStore>,
        anomalies: Arc<dyn AnomalyDatapointStore>,
    ) -> Result<Self, DetectionError> {
        let attribute_ref = AttributeRef::new(entity_id, attribute.name.as_str());
        if !attribute.value_type.is_numeric() {
            return Err(DetectionError::UnsupportedType {
                attribute: attribute_ref,
                value_type: attribute.value_type,
            });
        }
        let configs = attribute
            .meta
            .anomaly_detection
            .as_ref()
            .map(|meta| meta.methods.as_slice())
            .unwrap_or_default();
        Self::new(attribute_ref, configs, datapoints, anomalies)
    }

    pub fn attribute(&self) -> &AttributeRef {
        &self.attribute
    }

    pub fn has_sufficient_history(&self) -> bool {
        self.has_sufficient_history
    }

    pub fn requirement(&self) -> HistoryRequirement {
        self.requirement
    }

    /// The detection config named `name`.
    pub fn config(&self, name: &str) -> Option<&DetectionConfig> {
        self.methods
            .iter()
            .map(|m| &m.config)
            .find(|config| config.name == name)
    }

    /// Current acceptance interval of every enabled method, by config name.
    pub fn current_limits(&self) -> Vec<(String, Option<(f64, f64)>)> {
        self.methods
            .iter()
            .filter(|m| m.config.enabled)
            .map(|m| (m.config.name.clone(), m.method.current_limits()))
            .collect()
    }

    /// Classify one value of this attribute.
    ///
    /// Returns `Unchecked` while history is insufficient (including the
    /// event that completes the initial load). Store failures propagate.
    pub fn validate(&mut self, value: f64, timestamp: i64) -> Result<AnomalyType, DetectionError> {
        if !self.methods.iter().any(|m| m.config.enabled) {
            return Ok(AnomalyType::Unchecked);
        }

        if !self.has_sufficient_history {
            let samples = self.load_history()?;
            if samples.len() >= MIN_HISTORY_SAMPLES {
                for configured in self.methods.iter_mut().filter(|m| m.config.enabled) {
                    configured.method.refresh(&samples);
                }
                self.has_sufficient_history = true;
                debug!(
                    attribute = %self.attribute,
                    samples = samples.len(),
                    "Anomaly detection history loaded"
                );
            }
            return Ok(AnomalyType::Unchecked);
        }

        let failures: Vec<AnomalyType> = self
            .methods
            .iter_mut()
            .filter(|m| m.config.enabled)
            .filter_map(|m| {
                (!m.method.validate(value, timestamp)).then(|| m.method.anomaly_type())
            })
            .collect();
        let classification = AnomalyType::from_failures(&failures);

        self.refresh_stale_methods(timestamp, classification)?;

        Ok(classification)
    }

    /// Reload history once for every method whose extrema went stale.
    ///
    /// The datapoint at `latest_timestamp` is already stored but its
    /// classification is not persisted yet, so the reloaded sample carries
    /// the classification just computed.
    fn refresh_stale_methods(
        &mut self,
        latest_timestamp: i64,
        classification: AnomalyType,
    ) -> Result<(), DetectionError> {
        let mut reloaded: Option<Vec<Sample>> = None;

        for index in 0..self.methods.len() {
            let configured = &self.methods[index];
            if !configured.config.enabled || configured.method.is_recent_data_fresh(latest_timestamp)
            {
                continue;
            }

            let samples = match reloaded.take() {
                Some(samples) => samples,
                None => {
                    let mut samples = self.load_history()?;
                    samples
                        .iter_mut()
                        .filter(|s| s.timestamp == latest_timestamp)
                        .for_each(|s| s.classification = classification);
                    samples
                }
            };
            if samples.len() >= MIN_HISTORY_SAMPLES {
                self.methods[index].method.refresh(&samples);
            } else {
                debug!(
                    attribute = %self.attribute,
                    samples = samples.len(),
                    "Not enough recent history, waiting for more datapoints"
                );
                self.has_sufficient_history = false;
            }
            reloaded = Some(samples);
        }
        Ok(())
    }

    /// Samples covering the strictest enabled method, oldest first.
    ///
    /// All-or-nothing: empty when the stored period is shorter than the
    /// largest timespan or holds fewer than the largest minimum count.
    pub fn load_history(&self) -> Result<Vec<Sample>, StoreError> {
        let period = self.datapoints.period(&self.attribute)?;
        let (Some(oldest), Some(latest)) = (period.oldest, period.latest) else {
            return Ok(Vec::new());
        };
        if latest - oldest < self.requirement.timespan_ms {
            return Ok(Vec::new());
        }

        let from = latest - self.requirement.timespan_ms;
        let points = self.datapoints.query_range(&self.attribute, from, latest)?;
        if points.len() < self.requirement.minimum_datapoints {
            return Ok(Vec::new());
        }

        let classifications: HashMap<i64, AnomalyType> = self
            .anomalies
            .query_anomalies(&self.attribute, from, latest)?
            .into_iter()
            .map(|a| (a.timestamp, a.classification))
            .collect();

        Ok(points
            .into_iter()
            .map(|p| {
                let classification = classifications
                    .get(&p.timestamp)
                    .copied()
                    .unwrap_or_default();
                Sample::new(p.value, p.timestamp, classification)
            })
            .collect())
    }
}
