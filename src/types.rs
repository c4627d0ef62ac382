//! Core data types shared by the anomaly and forecast subsystems
//!
//! The platform around this crate owns entities (assets) and their attributes.
//! Only the slice of that model the detection and forecasting core needs is
//! mirrored here: attribute identity, capability metadata, datapoints and the
//! lifecycle/value events delivered by the event bus.

use serde::{Deserialize, Serialize};

use crate::detection::DetectionConfig;
use crate::forecast::ForecastConfig;

// ============================================================================
// Attribute Identity
// ============================================================================

/// Stable identity of an attribute within an entity.
///
/// Used as the key in every registry (classifiers, forecast state) and in
/// every collaborator store call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeRef {
    /// Owning entity (asset) id
    pub entity_id: String,
    /// Attribute name, unique within the entity
    pub attribute_name: String,
}

impl AttributeRef {
    pub fn new(entity_id: impl Into<String>, attribute_name: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute_name: attribute_name.into(),
        }
    }
}

impl std::fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_id, self.attribute_name)
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Outcome of evaluating one datapoint against the detection methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AnomalyType {
    /// Never evaluated (or not evaluable yet)
    #[default]
    Unchecked,
    /// Passed every enabled detection method
    Valid,
    /// Failed more than one detection method
    Multiple,
    /// Outside the global min/max range (Global method)
    GlobalOutlier,
    /// Unexpected change relative to the previous value (Change method)
    ContextualOutlier,
    /// Unexpected gap between datapoints (Timespan method)
    IrregularInterval,
}

impl AnomalyType {
    /// Whether a sample with this classification may shape detection bounds.
    pub fn is_usable_for_bounds(self) -> bool {
        matches!(self, AnomalyType::Unchecked | AnomalyType::Valid)
    }

    /// Combine the outcome of the evaluated methods.
    ///
    /// `failures` holds the associated anomaly type of every method that
    /// rejected the value: none → `Valid`, one → that type, more → `Multiple`.
    pub fn from_failures(failures: &[AnomalyType]) -> Self {
        match failures {
            [] => AnomalyType::Valid,
            [single] => *single,
            _ => AnomalyType::Multiple,
        }
    }
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyType::Unchecked => write!(f, "UNCHECKED"),
            AnomalyType::Valid => write!(f, "VALID"),
            AnomalyType::Multiple => write!(f, "MULTIPLE"),
            AnomalyType::GlobalOutlier => write!(f, "GLOBAL_OUTLIER"),
            AnomalyType::ContextualOutlier => write!(f, "CONTEXTUAL_OUTLIER"),
            AnomalyType::IrregularInterval => write!(f, "IRREGULAR_INTERVAL"),
        }
    }
}

// ============================================================================
// Datapoints
// ============================================================================

/// Observed datapoint as stored by the datapoint store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueDatapoint {
    /// Epoch milliseconds
    pub timestamp: i64,
    pub value: f64,
}

impl ValueDatapoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Persisted classification of one observed datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyDatapoint {
    pub timestamp: i64,
    pub classification: AnomalyType,
}

/// Historical datapoint joined with its classification.
///
/// Immutable once read from the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: f64,
    pub timestamp: i64,
    pub classification: AnomalyType,
}

impl Sample {
    pub fn new(value: f64, timestamp: i64, classification: AnomalyType) -> Self {
        Self {
            value,
            timestamp,
            classification,
        }
    }

    /// A sample that has never been evaluated.
    pub fn unchecked(value: f64, timestamp: i64) -> Self {
        Self::new(value, timestamp, AnomalyType::Unchecked)
    }
}

/// Oldest and latest timestamp held for one attribute.
///
/// Both are `None` when nothing has been stored yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatapointPeriod {
    pub oldest: Option<i64>,
    pub latest: Option<i64>,
}

/// Forecast value typed to the attribute's declared numeric type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumericValue {
    Integer(i64),
    Float(f64),
}

impl NumericValue {
    pub fn as_f64(self) -> f64 {
        match self {
            #[allow(clippy::cast_precision_loss)]
            NumericValue::Integer(v) => v as f64,
            NumericValue::Float(v) => v,
        }
    }
}

/// Predicted (forecast) datapoint, stored apart from observed history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictedDatapoint {
    pub timestamp: i64,
    pub value: NumericValue,
}

// ============================================================================
// Attribute Model
// ============================================================================

/// Declared value type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    #[default]
    Float64,
    Boolean,
    Text,
    Json,
}

impl ValueType {
    pub fn is_numeric(self) -> bool {
        !matches!(self, ValueType::Boolean | ValueType::Text | ValueType::Json)
    }

    /// Narrow an `f64` to this type the way a primitive numeric cast does:
    /// integers truncate toward zero (saturating at 32/64 bits, wrapping
    /// below that), floats keep the fraction.
    ///
    /// Returns `None` for non-numeric types.
    #[allow(clippy::cast_possible_truncation)]
    pub fn narrow(self, value: f64) -> Option<NumericValue> {
        match self {
            ValueType::Int64 => Some(NumericValue::Integer(value as i64)),
            ValueType::Int32 => Some(NumericValue::Integer(i64::from(value as i32))),
            ValueType::Int16 => Some(NumericValue::Integer(i64::from(value as i32 as i16))),
            ValueType::Int8 => Some(NumericValue::Integer(i64::from(value as i32 as i8))),
            ValueType::Float64 => Some(NumericValue::Float(value)),
            ValueType::Float32 => Some(NumericValue::Float(f64::from(value as f32))),
            ValueType::Boolean | ValueType::Text | ValueType::Json => None,
        }
    }
}

/// Anomaly-detection capability meta: the methods configured for an attribute.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnomalyDetectionMeta {
    #[serde(default)]
    pub methods: Vec<DetectionConfig>,
}

/// Capability flags and configuration carried in attribute metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttributeMeta {
    /// Datapoints of this attribute are persisted (required for detection)
    #[serde(default)]
    pub store_datapoints: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_detection: Option<AnomalyDetectionMeta>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast: Option<ForecastConfig>,
}

/// Attribute snapshot as carried by entity lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub meta: AttributeMeta,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            meta: AttributeMeta::default(),
        }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: AttributeMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn has_anomaly_detection(&self) -> bool {
        self.meta.anomaly_detection.is_some()
    }

    /// Carries both the anomaly-detection and store-datapoints capabilities.
    pub fn qualifies_for_anomaly_detection(&self) -> bool {
        self.has_anomaly_detection() && self.meta.store_datapoints
    }

    pub fn has_forecast(&self) -> bool {
        self.meta.forecast.is_some()
    }
}

/// Entity (asset) snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// Set when the entity is federated from a gateway; such entities are
    /// handled by the gateway, not by this instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl Entity {
    pub fn new(id: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        Self {
            id: id.into(),
            gateway_id: None,
            attributes,
        }
    }

    pub fn is_gateway_owned(&self) -> bool {
        self.gateway_id.is_some()
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attribute_ref(&self, attribute: &Attribute) -> AttributeRef {
        AttributeRef::new(self.id.clone(), attribute.name.clone())
    }
}

// ============================================================================
// Events
// ============================================================================

/// Entity lifecycle event from the persistence feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum EntityEvent {
    Create {
        entity: Entity,
    },
    Update {
        entity: Entity,
        /// Attribute set before the update
        previous_attributes: Vec<Attribute>,
    },
    Delete {
        entity: Entity,
    },
}

impl EntityEvent {
    pub fn entity(&self) -> &Entity {
        match self {
            EntityEvent::Create { entity }
            | EntityEvent::Update { entity, .. }
            | EntityEvent::Delete { entity } => entity,
        }
    }
}

/// Accepted attribute write from the live value feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeEvent {
    pub entity_id: String,
    pub attribute_name: String,
    /// Raw value; `None` when the attribute was cleared
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl AttributeEvent {
    pub fn attribute_ref(&self) -> AttributeRef {
        AttributeRef::new(self.entity_id.clone(), self.attribute_name.clone())
    }

    /// Numeric view of the value, if it has one.
    pub fn numeric_value(&self) -> Option<f64> {
        self.value.as_ref().and_then(serde_json::Value::as_f64)
    }
}
