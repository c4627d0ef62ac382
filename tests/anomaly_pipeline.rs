//! Anomaly Pipeline Tests
//!
//! Drives the anomaly detection coordinator the way the event pipeline does:
//! the raw datapoint is stored first, then the attribute event is classified
//! and the classification persisted.

use std::sync::Arc;

use asset_insight::storage::AnomalyDatapointStore;
use asset_insight::types::AnomalyDetectionMeta;
use asset_insight::{
    AnomalyDetectionCoordinator, AnomalySettings, AnomalyType, Attribute, AttributeEvent,
    AttributeMeta, AttributeRef, DetectionConfig, DetectionKind, Entity, EntityEvent,
    InMemoryStore, ValueDatapoint, ValueType,
};

const HOUR: i64 = 3_600_000;
const T0: i64 = 1_700_000_000_000;

fn monitored(name: &str, methods: Vec<DetectionConfig>) -> Attribute {
    Attribute::new(name, ValueType::Float64).with_meta(AttributeMeta {
        store_datapoints: true,
        anomaly_detection: Some(AnomalyDetectionMeta { methods }),
        forecast: None,
    })
}

fn global(deviation: f64) -> DetectionConfig {
    DetectionConfig::new(DetectionKind::Global, deviation, HOUR, 2)
}

struct Pipeline {
    store: Arc<InMemoryStore>,
    coordinator: AnomalyDetectionCoordinator,
}

impl Pipeline {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = AnomalyDetectionCoordinator::with_settings(
            store.clone(),
            store.clone(),
            AnomalySettings::default(),
        );
        Self { store, coordinator }
    }

    fn feed(&self, entity: &str, attribute: &str, timestamp: i64, value: f64) -> Option<AnomalyType> {
        self.store
            .append_datapoint(
                &AttributeRef::new(entity, attribute),
                ValueDatapoint::new(timestamp, value),
            )
            .unwrap();
        self.coordinator
            .on_attribute_event(&AttributeEvent {
                entity_id: entity.to_string(),
                attribute_name: attribute.to_string(),
                value: Some(serde_json::json!(value)),
                timestamp,
            })
            .unwrap()
    }
}

// ============================================================================
// End-to-end Classification
// ============================================================================

fn feed_hourly(pipeline: &Pipeline, values: &[f64]) -> Vec<AnomalyType> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            pipeline
                .feed("pump-1", "pressure", T0 + i as i64 * HOUR, *v)
                .expect("attribute is monitored")
        })
        .collect()
}

#[test]
fn hourly_feed_flags_spike_then_recovers() {
    let pipeline = Pipeline::new();
    pipeline.coordinator.handle_entity_event(&EntityEvent::Create {
        entity: Entity::new("pump-1", vec![monitored("pressure", vec![global(10.0)])]),
    });

    let results = feed_hourly(&pipeline, &[10.0, 12.0, 11.0, 50.0, 13.0, 11.0]);

    // t0: period too short, t1: initial history load
    assert_eq!(results[0], AnomalyType::Unchecked);
    assert_eq!(results[1], AnomalyType::Unchecked);
    assert_eq!(results[2], AnomalyType::Valid);
    assert_eq!(results[3], AnomalyType::GlobalOutlier);
    // The spike never joins the bounds, so 13 is still outside them
    assert_eq!(results[4], AnomalyType::GlobalOutlier);
    assert_eq!(results[5], AnomalyType::Valid);

    let persisted = pipeline
        .store
        .query_anomalies(&AttributeRef::new("pump-1", "pressure"), T0, T0 + 5 * HOUR)
        .unwrap();
    let classifications: Vec<AnomalyType> = persisted.iter().map(|a| a.classification).collect();
    assert_eq!(classifications, results);
}

#[test]
fn stale_reload_excludes_the_outlier_being_classified() {
    let pipeline = Pipeline::new();
    pipeline.coordinator.handle_entity_event(&EntityEvent::Create {
        entity: Entity::new(
            "pump-1",
            vec![monitored(
                "pressure",
                vec![DetectionConfig::new(DetectionKind::Global, 10.0, 2 * HOUR, 2)],
            )],
        ),
    });

    let results = feed_hourly(&pipeline, &[10.0, 12.0, 11.0, 50.0, 45.0]);

    assert_eq!(results[3], AnomalyType::GlobalOutlier);
    assert_eq!(results[4], AnomalyType::GlobalOutlier);

    let limits = pipeline
        .coordinator
        .current_limits(&AttributeRef::new("pump-1", "pressure"))
        .expect("attribute is monitored");
    let (_, high) = limits[0].1.expect("bounds are loaded");
    assert!(high < 13.0, "outliers widened the bounds to {high}");
}

#[test]
fn non_numeric_value_is_recorded_unchecked() {
    let pipeline = Pipeline::new();
    pipeline.coordinator.handle_entity_event(&EntityEvent::Create {
        entity: Entity::new("pump-1", vec![monitored("pressure", vec![global(10.0)])]),
    });

    let result = pipeline
        .coordinator
        .on_attribute_event(&AttributeEvent {
            entity_id: "pump-1".to_string(),
            attribute_name: "pressure".to_string(),
            value: Some(serde_json::json!("offline")),
            timestamp: T0,
        })
        .unwrap();
    assert_eq!(result, Some(AnomalyType::Unchecked));
}

// ============================================================================
// Lifecycle Diffing
// ============================================================================

#[test]
fn update_with_changed_config_restarts_classifier() {
    let pipeline = Pipeline::new();
    let before = vec![monitored("pressure", vec![global(10.0)]), monitored("flow", vec![global(5.0)])];
    pipeline.coordinator.handle_entity_event(&EntityEvent::Create {
        entity: Entity::new("pump-1", before.clone()),
    });

    for i in 0..3 {
        pipeline.feed("pump-1", "pressure", T0 + i * HOUR, 10.0 + i as f64);
    }
    let key = AttributeRef::new("pump-1", "pressure");
    assert!(pipeline.coordinator.current_limits(&key).is_some());

    // pressure tightened, flow dropped
    pipeline.coordinator.handle_entity_event(&EntityEvent::Update {
        entity: Entity::new("pump-1", vec![monitored("pressure", vec![global(1.0)])]),
        previous_attributes: before,
    });

    assert!(pipeline.coordinator.is_registered(&key));
    assert!(!pipeline
        .coordinator
        .is_registered(&AttributeRef::new("pump-1", "flow")));

    // Fresh classifier reloads history before classifying again
    assert_eq!(
        pipeline.feed("pump-1", "pressure", T0 + 3 * HOUR, 12.0),
        Some(AnomalyType::Unchecked)
    );
}

#[test]
fn unchanged_update_keeps_loaded_history() {
    let pipeline = Pipeline::new();
    let attributes = vec![monitored("pressure", vec![global(10.0)])];
    pipeline.coordinator.handle_entity_event(&EntityEvent::Create {
        entity: Entity::new("pump-1", attributes.clone()),
    });
    pipeline.feed("pump-1", "pressure", T0, 10.0);
    pipeline.feed("pump-1", "pressure", T0 + HOUR, 12.0);

    pipeline.coordinator.handle_entity_event(&EntityEvent::Update {
        entity: Entity::new("pump-1", attributes.clone()),
        previous_attributes: attributes,
    });

    assert_eq!(
        pipeline.feed("pump-1", "pressure", T0 + 2 * HOUR, 11.0),
        Some(AnomalyType::Valid)
    );
}

#[test]
fn delete_and_bootstrap() {
    let pipeline = Pipeline::new();
    let entity = Entity::new(
        "pump-1",
        vec![monitored("pressure", vec![global(10.0)]), monitored("flow", vec![global(5.0)])],
    );
    assert_eq!(pipeline.coordinator.bootstrap(std::slice::from_ref(&entity)), 2);
    assert_eq!(
        pipeline.coordinator.attributes(),
        vec![
            AttributeRef::new("pump-1", "flow"),
            AttributeRef::new("pump-1", "pressure"),
        ]
    );

    pipeline
        .coordinator
        .handle_entity_event(&EntityEvent::Delete { entity });
    assert_eq!(pipeline.coordinator.registered_count(), 0);
    assert_eq!(pipeline.feed("pump-1", "pressure", T0, 1.0), None);
}

// ============================================================================
// Diagnostic Limit Bands
// ============================================================================

#[test]
fn limit_bands_do_not_disturb_live_classifier() {
    let pipeline = Pipeline::new();
    pipeline.coordinator.handle_entity_event(&EntityEvent::Create {
        entity: Entity::new("pump-1", vec![monitored("pressure", vec![global(10.0)])]),
    });
    for (i, v) in [10.0, 12.0, 11.0].into_iter().enumerate() {
        pipeline.feed("pump-1", "pressure", T0 + i as i64 * HOUR, v);
    }
    let key = AttributeRef::new("pump-1", "pressure");
    let before = pipeline.coordinator.current_limits(&key);

    let bands = pipeline.coordinator.limit_bands(&key, "global").unwrap();
    assert_eq!(bands.datapoints.len(), 3);

    assert_eq!(pipeline.coordinator.current_limits(&key), before);
}
