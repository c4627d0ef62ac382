//! Anomaly Detection Coordinator
//!
//! Keeps one [`AnomalyClassifier`] per monitored attribute, driven by two
//! feeds:
//!
//! ```text
//! entity lifecycle (CREATE/UPDATE/DELETE) ──► registry diff
//! attribute values ──► classifier.validate() ──► anomaly store
//! ```
//!
//! The registry sits behind a single mutex; lookups, mutations and the
//! synchronous classification of one value all run under it.

mod limits;

pub use limits::{compute_limit_bands, LimitBands};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config;
use crate::config::defaults::LIMITS_HISTORY_MULTIPLIER;
use crate::detection::{AnomalyClassifier, DetectionConfig, DetectionError};
use crate::storage::{AnomalyDatapointStore, DatapointStore};
use crate::types::{AnomalyType, Attribute, AttributeEvent, AttributeRef, Entity, EntityEvent};

/// Tuning for the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalySettings {
    /// Diagnostic limit bands look back this many timespans
    pub limits_history_multiplier: u32,
}

impl Default for AnomalySettings {
    fn default() -> Self {
        Self {
            limits_history_multiplier: LIMITS_HISTORY_MULTIPLIER,
        }
    }
}

impl AnomalySettings {
    /// Settings from the global service config, or defaults when it has
    /// not been initialised.
    pub fn from_config() -> Self {
        config::get().map_or_else(Self::default, |c| Self {
            limits_history_multiplier: c.anomaly.limits_history_multiplier,
        })
    }
}

pub struct AnomalyDetectionCoordinator {
    classifiers: Mutex<HashMap<AttributeRef, AnomalyClassifier>>,
    datapoints: Arc<dyn DatapointStore>,
    anomalies: Arc<dyn AnomalyDatapointStore>,
    settings: AnomalySettings,
}

impl AnomalyDetectionCoordinator {
    pub fn new(
        datapoints: Arc<dyn DatapointStore>,
        anomalies: Arc<dyn AnomalyDatapointStore>,
    ) -> Self {
        Self::with_settings(datapoints, anomalies, AnomalySettings::from_config())
    }

    pub fn with_settings(
        datapoints: Arc<dyn DatapointStore>,
        anomalies: Arc<dyn AnomalyDatapointStore>,
        settings: AnomalySettings,
    ) -> Self {
        Self {
            classifiers: Mutex::new(HashMap::new()),
            datapoints,
            anomalies,
            settings,
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<AttributeRef, AnomalyClassifier>> {
        // Every mutation is a single map operation, so a poisoned map is
        // still consistent.
        self.classifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register every qualifying attribute of already-persisted entities.
    ///
    /// Returns the number of classifiers registered.
    pub fn bootstrap(&self, entities: &[Entity]) -> usize {
        let mut registry = self.registry();
        let before = registry.len();
        for entity in entities.iter().filter(|e| !e.is_gateway_owned()) {
            for attribute in entity
                .attributes
                .iter()
                .filter(|a| a.qualifies_for_anomaly_detection())
            {
                self.register(&mut registry, entity, attribute);
            }
        }
        let registered = registry.len() - before;
        info!(count = registered, "Anomaly detection attributes loaded");
        registered
    }

    /// Apply one entity lifecycle event to the registry.
    pub fn handle_entity_event(&self, event: &EntityEvent) {
        let entity = event.entity();
        if entity.is_gateway_owned() {
            debug!(entity = %entity.id, "Ignoring gateway entity event");
            return;
        }

        let mut registry = self.registry();
        match event {
            EntityEvent::Create { entity } => {
                for attribute in entity
                    .attributes
                    .iter()
                    .filter(|a| a.qualifies_for_anomaly_detection())
                {
                    self.register(&mut registry, entity, attribute);
                }
            }
            EntityEvent::Update {
                entity,
                previous_attributes,
            } => {
                for previous in previous_attributes.iter().filter(|a| a.has_anomaly_detection()) {
                    let still_current = entity.attribute(&previous.name).is_some_and(|current| {
                        current.qualifies_for_anomaly_detection() && current == previous
                    });
                    if !still_current {
                        let key = entity.attribute_ref(previous);
                        if registry.remove(&key).is_some() {
                            debug!(attribute = %key, "Anomaly classifier removed");
                        }
                    }
                }
                for attribute in entity
                    .attributes
                    .iter()
                    .filter(|a| a.qualifies_for_anomaly_detection())
                {
                    if !registry.contains_key(&entity.attribute_ref(attribute)) {
                        self.register(&mut registry, entity, attribute);
                    }
                }
            }
            EntityEvent::Delete { entity } => {
                for attribute in entity.attributes.iter().filter(|a| a.has_anomaly_detection()) {
                    let key = entity.attribute_ref(attribute);
                    if registry.remove(&key).is_some() {
                        debug!(attribute = %key, "Anomaly classifier removed");
                    }
                }
            }
        }
    }

    fn register(
        &self,
        registry: &mut HashMap<AttributeRef, AnomalyClassifier>,
        entity: &Entity,
        attribute: &Attribute,
    ) {
        match AnomalyClassifier::for_attribute(
            &entity.id,
            attribute,
            self.datapoints.clone(),
            self.anomalies.clone(),
        ) {
            Ok(classifier) => {
                debug!(attribute = %classifier.attribute(), "Anomaly classifier registered");
                registry.insert(classifier.attribute().clone(), classifier);
            }
            Err(e) => {
                warn!(
                    entity = %entity.id,
                    attribute = %attribute.name,
                    error = %e,
                    "Skipping anomaly detection for attribute"
                );
            }
        }
    }

    pub fn is_registered(&self, attribute: &AttributeRef) -> bool {
        self.registry().contains_key(attribute)
    }

    pub fn registered_count(&self) -> usize {
        self.registry().len()
    }

    /// Registered attributes, sorted for stable output.
    pub fn attributes(&self) -> Vec<AttributeRef> {
        let mut attributes: Vec<AttributeRef> = self.registry().keys().cloned().collect();
        attributes.sort_by(|a, b| {
            (&a.entity_id, &a.attribute_name).cmp(&(&b.entity_id, &b.attribute_name))
        });
        attributes
    }

    // ========================================================================
    // Live Values
    // ========================================================================

    /// Classify a live attribute value and persist the classification.
    ///
    /// `Ok(None)` when the attribute is not monitored. Values that are not
    /// numeric are recorded as `Unchecked`.
    pub fn on_attribute_event(
        &self,
        event: &AttributeEvent,
    ) -> Result<Option<AnomalyType>, DetectionError> {
        let started = Instant::now();
        let key = event.attribute_ref();

        let mut registry = self.registry();
        let Some(classifier) = registry.get_mut(&key) else {
            return Ok(None);
        };

        let classification = match event.numeric_value() {
            Some(value) => classifier.validate(value, event.timestamp)?,
            None => AnomalyType::Unchecked,
        };
        self.anomalies
            .write_classification(&key, classification, event.timestamp)?;
        drop(registry);

        debug!(
            attribute = %key,
            classification = %classification,
            elapsed_ms = started.elapsed().as_millis(),
            "Attribute anomaly detection finished"
        );
        Ok(Some(classification))
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Live acceptance interval of each enabled method, by config name.
    pub fn current_limits(
        &self,
        attribute: &AttributeRef,
    ) -> Option<Vec<(String, Option<(f64, f64)>)>> {
        self.registry().get(attribute).map(AnomalyClassifier::current_limits)
    }

    /// Limit bands for an explicit detection config.
    pub fn limit_bands_for(
        &self,
        attribute: &AttributeRef,
        config: &DetectionConfig,
    ) -> Result<LimitBands, DetectionError> {
        compute_limit_bands(
            self.datapoints.as_ref(),
            attribute,
            config,
            self.settings.limits_history_multiplier,
        )
    }

    /// Limit bands for the detection config named `config_name` of a
    /// registered attribute.
    pub fn limit_bands(
        &self,
        attribute: &AttributeRef,
        config_name: &str,
    ) -> Result<LimitBands, DetectionError> {
        let config = {
            let registry = self.registry();
            let classifier = registry.get(attribute).ok_or_else(|| {
                DetectionError::InvalidArgument(format!(
                    "attribute {attribute} has no anomaly detection"
                ))
            })?;
            classifier.config(config_name).cloned().ok_or_else(|| {
                DetectionError::InvalidArgument(format!(
                    "attribute {attribute} has no detection config named '{config_name}'"
                ))
            })?
        };
        self.limit_bands_for(attribute, &config)
    }
}
