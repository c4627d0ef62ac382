//! Collaborator store traits and the in-memory backend
//!
//! The detection and forecast core only ever talks to storage through these
//! traits, so backends can be swapped without touching coordinator code:
//! - `InMemoryStore`: in-memory store for tests, replays and minimal deployments
//! - `SledStore`: embedded on-disk backend
//!
//! All calls are synchronous; callers on the event path block on them.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::types::{
    AnomalyDatapoint, AnomalyType, AttributeRef, DatapointPeriod, NumericValue,
    PredictedDatapoint, ValueDatapoint,
};

// ============================================================================
// Traits
// ============================================================================

/// Observed datapoint history.
///
/// Implementations must be thread-safe (Send + Sync) for shared access from
/// the event pipeline and the forecast task.
pub trait DatapointStore: Send + Sync {
    /// Datapoints with `from <= timestamp <= to`, oldest first.
    fn query_range(
        &self,
        attribute: &AttributeRef,
        from: i64,
        to: i64,
    ) -> Result<Vec<ValueDatapoint>, StoreError>;

    /// Oldest and latest stored timestamp.
    fn period(&self, attribute: &AttributeRef) -> Result<DatapointPeriod, StoreError>;
}

/// Persisted classifications of observed datapoints.
pub trait AnomalyDatapointStore: Send + Sync {
    /// Classifications with `from <= timestamp <= to`, oldest first.
    fn query_anomalies(
        &self,
        attribute: &AttributeRef,
        from: i64,
        to: i64,
    ) -> Result<Vec<AnomalyDatapoint>, StoreError>;

    /// Insert or replace the classification at `timestamp`.
    fn write_classification(
        &self,
        attribute: &AttributeRef,
        classification: AnomalyType,
        timestamp: i64,
    ) -> Result<(), StoreError>;
}

/// Forecast output, stored apart from observed history.
pub trait PredictedDatapointStore: Send + Sync {
    /// Remove every predicted datapoint of the attribute.
    fn purge(&self, attribute: &AttributeRef) -> Result<(), StoreError>;

    /// Insert or replace the given predicted datapoints.
    fn write_batch(
        &self,
        attribute: &AttributeRef,
        datapoints: &[PredictedDatapoint],
    ) -> Result<(), StoreError>;

    /// Every predicted datapoint of the attribute, oldest first.
    fn read_all(&self, attribute: &AttributeRef) -> Result<Vec<PredictedDatapoint>, StoreError>;
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store lock poisoned: {0}")]
    Poisoned(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

type Series<V> = RwLock<HashMap<AttributeRef, BTreeMap<i64, V>>>;

/// In-memory store implementing all three collaborator traits.
///
/// Thread-safe via `RwLock`. Not durable; data is lost on restart.
#[derive(Default)]
pub struct InMemoryStore {
    datapoints: Series<f64>,
    anomalies: Series<AnomalyType>,
    predicted: Series<NumericValue>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append (or overwrite) one observed datapoint.
    pub fn append_datapoint(
        &self,
        attribute: &AttributeRef,
        datapoint: ValueDatapoint,
    ) -> Result<(), StoreError> {
        let mut store = self
            .datapoints
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        store
            .entry(attribute.clone())
            .or_default()
            .insert(datapoint.timestamp, datapoint.value);
        Ok(())
    }

    /// Number of observed datapoints held for the attribute.
    pub fn datapoint_count(&self, attribute: &AttributeRef) -> usize {
        self.datapoints
            .read()
            .map(|store| store.get(attribute).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }
}

impl DatapointStore for InMemoryStore {
    fn query_range(
        &self,
        attribute: &AttributeRef,
        from: i64,
        to: i64,
    ) -> Result<Vec<ValueDatapoint>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let store = self
            .datapoints
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;

        Ok(store
            .get(attribute)
            .map(|series| {
                series
                    .range(from..=to)
                    .map(|(ts, value)| ValueDatapoint::new(*ts, *value))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn period(&self, attribute: &AttributeRef) -> Result<DatapointPeriod, StoreError> {
        let store = self
            .datapoints
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;

        Ok(store
            .get(attribute)
            .map(|series| DatapointPeriod {
                oldest: series.keys().next().copied(),
                latest: series.keys().next_back().copied(),
            })
            .unwrap_or_default())
    }
}

impl AnomalyDatapointStore for InMemoryStore {
    fn query_anomalies(
        &self,
        attribute: &AttributeRef,
        from: i64,
        to: i64,
    ) -> Result<Vec<AnomalyDatapoint>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let store = self
            .anomalies
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;

        Ok(store
            .get(attribute)
            .map(|series| {
                series
                    .range(from..=to)
                    .map(|(ts, classification)| AnomalyDatapoint {
                        timestamp: *ts,
                        classification: *classification,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn write_classification(
        &self,
        attribute: &AttributeRef,
        classification: AnomalyType,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        let mut store = self
            .anomalies
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        store
            .entry(attribute.clone())
            .or_default()
            .insert(timestamp, classification);
        Ok(())
    }
}

impl PredictedDatapointStore for InMemoryStore {
    fn purge(&self, attribute: &AttributeRef) -> Result<(), StoreError> {
        let mut store = self
            .predicted
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        store.remove(attribute);
        Ok(())
    }

    fn write_batch(
        &self,
        attribute: &AttributeRef,
        datapoints: &[PredictedDatapoint],
    ) -> Result<(), StoreError> {
        let mut store = self
            .predicted
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        let series = store.entry(attribute.clone()).or_default();
        for dp in datapoints {
            series.insert(dp.timestamp, dp.value);
        }
        Ok(())
    }

    fn read_all(&self, attribute: &AttributeRef) -> Result<Vec<PredictedDatapoint>, StoreError> {
        let store = self
            .predicted
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;

        Ok(store
            .get(attribute)
            .map(|series| {
                series
                    .iter()
                    .map(|(ts, value)| PredictedDatapoint {
                        timestamp: *ts,
                        value: *value,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
