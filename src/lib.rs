//! Asset Insight: anomaly detection and forecasting for IoT attributes
//!
//! Consumes entity lifecycle events and live attribute values, classifies
//! each value against per-attribute detection methods, and keeps
//! weighted-exponential-average forecasts up to date on a schedule.
//!
//! ## Architecture
//!
//! - **Detection**: Global, Change and Timespan rules behind one classifier
//!   per attribute
//! - **Anomaly**: classifier registry driven by lifecycle and value events,
//!   plus diagnostic limit bands
//! - **Forecast**: WEA model and a single-task scheduler writing predicted
//!   datapoints
//! - **Storage**: collaborator traits with in-memory and sled backends

pub mod anomaly;
pub mod clock;
pub mod config;
pub mod detection;
pub mod forecast;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use types::{
    AnomalyType, Attribute, AttributeEvent, AttributeMeta, AttributeRef, Entity, EntityEvent,
    PredictedDatapoint, Sample, ValueDatapoint, ValueType,
};

pub use anomaly::{AnomalyDetectionCoordinator, AnomalySettings, LimitBands};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::InsightConfig;
pub use detection::{AnomalyClassifier, DetectionConfig, DetectionError, DetectionKind};
pub use forecast::{
    ForecastAttribute, ForecastConfig, ForecastCoordinator, ForecastError, ForecastScheduler,
    SchedulerSettings,
};
pub use storage::{InMemoryStore, SledStore, StoreError};
