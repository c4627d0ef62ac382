//! Forecast Coordinator
//!
//! Turns entity lifecycle events into scheduler registrations.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::{ForecastAttribute, ForecastError, ForecastScheduler};
use crate::types::{Attribute, Entity, EntityEvent};

#[derive(Debug, Clone)]
pub struct ForecastCoordinator {
    scheduler: ForecastScheduler,
}

impl ForecastCoordinator {
    pub fn new(scheduler: ForecastScheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &ForecastScheduler {
        &self.scheduler
    }

    /// Restore forecasting for already-persisted entities.
    ///
    /// Returns the number of attributes handed to the scheduler.
    pub fn bootstrap(&self, entities: &[Entity]) -> Result<usize, ForecastError> {
        let attributes: Vec<ForecastAttribute> = entities
            .iter()
            .filter(|e| !e.is_gateway_owned())
            .flat_map(|e| forecast_attributes(e, e.attributes.iter()))
            .collect();
        let count = attributes.len();
        self.scheduler.init(attributes)?;
        info!("[ForecastCoordinator] {} forecast attributes loaded", count);
        Ok(count)
    }

    pub fn handle_entity_event(&self, event: &EntityEvent) -> Result<(), ForecastError> {
        let entity = event.entity();
        if entity.is_gateway_owned() {
            debug!("[ForecastCoordinator] Ignoring gateway entity {}", entity.id);
            return Ok(());
        }

        match event {
            EntityEvent::Create { entity } => {
                self.scheduler
                    .add(forecast_attributes(entity, entity.attributes.iter()));
            }
            EntityEvent::Update {
                entity,
                previous_attributes,
            } => {
                let old: Vec<&Attribute> =
                    previous_attributes.iter().filter(|a| a.has_forecast()).collect();
                let new: Vec<&Attribute> =
                    entity.attributes.iter().filter(|a| a.has_forecast()).collect();

                let added_or_modified: Vec<&Attribute> = new
                    .iter()
                    .copied()
                    .filter(|a| !old.contains(a))
                    .collect();

                for attribute in &added_or_modified {
                    let key = entity.attribute_ref(attribute);
                    if self.scheduler.contains(&key) {
                        self.scheduler.delete(&key)?;
                    }
                }
                for attribute in old
                    .iter()
                    .filter(|o| !new.iter().any(|a| a.name == o.name))
                {
                    self.scheduler.delete(&entity.attribute_ref(attribute))?;
                }

                self.scheduler
                    .add(forecast_attributes(entity, added_or_modified.into_iter()));
            }
            EntityEvent::Delete { entity } => {
                for attribute in entity.attributes.iter().filter(|a| a.has_forecast()) {
                    self.scheduler.delete(&entity.attribute_ref(attribute))?;
                }
            }
        }
        Ok(())
    }

    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.scheduler.shutdown(timeout).await
    }
}

/// Valid forecast attributes of an entity; the rest are logged and skipped.
fn forecast_attributes<'a>(
    entity: &Entity,
    attributes: impl Iterator<Item = &'a Attribute>,
) -> Vec<ForecastAttribute> {
    attributes
        .filter(|a| a.has_forecast())
        .filter_map(|a| match ForecastAttribute::from_attribute(&entity.id, a) {
            Ok(attribute) => Some(attribute),
            Err(e @ ForecastError::UnsupportedType { .. }) => {
                debug!("[ForecastCoordinator] Skipping {}: {}", a.name, e);
                None
            }
            Err(e) => {
                warn!(
                    "[ForecastCoordinator] Skipping {}:{}: {}",
                    entity.id, a.name, e
                );
                None
            }
        })
        .collect()
}
