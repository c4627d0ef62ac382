//! Datapoint History Storage
//!
//! Persists observed datapoints, classifications and predicted datapoints to
//! Sled DB. Each kind lives in its own tree so predictions never mix with
//! observed history.
//!
//! Key layout: `entity_id \0 attribute_name \0 timestamp`, where the
//! timestamp is 8 big-endian bytes with the sign bit flipped so keys sort
//! chronologically (negative timestamps included).

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::persistence::{
    AnomalyDatapointStore, DatapointStore, PredictedDatapointStore, StoreError,
};
use crate::types::{
    AnomalyDatapoint, AnomalyType, AttributeRef, DatapointPeriod, PredictedDatapoint,
    ValueDatapoint,
};

const DATAPOINTS_TREE: &str = "datapoints";
const ANOMALIES_TREE: &str = "anomalies";
const PREDICTED_TREE: &str = "predicted";

const SIGN_BIT: u64 = 1 << 63;

// ============================================================================
// Key Encoding
// ============================================================================

fn attribute_prefix(attribute: &AttributeRef) -> Vec<u8> {
    let mut prefix =
        Vec::with_capacity(attribute.entity_id.len() + attribute.attribute_name.len() + 2);
    prefix.extend_from_slice(attribute.entity_id.as_bytes());
    prefix.push(0);
    prefix.extend_from_slice(attribute.attribute_name.as_bytes());
    prefix.push(0);
    prefix
}

#[allow(clippy::cast_sign_loss)]
fn timestamp_key(prefix: &[u8], timestamp: i64) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(&((timestamp as u64) ^ SIGN_BIT).to_be_bytes());
    key
}

#[allow(clippy::cast_possible_wrap)]
fn decode_timestamp(key: &[u8]) -> Result<i64, StoreError> {
    let tail = key
        .len()
        .checked_sub(8)
        .and_then(|start| key.get(start..))
        .ok_or_else(|| StoreError::Serialization("datapoint key too short".to_string()))?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(tail);
    Ok((u64::from_be_bytes(bytes) ^ SIGN_BIT) as i64)
}

// ============================================================================
// Sled Store
// ============================================================================

/// Sled-backed store implementing all three collaborator traits.
#[derive(Clone)]
pub struct SledStore {
    db: Arc<sled::Db>,
    datapoints: sled::Tree,
    anomalies: sled::Tree,
    predicted: sled::Tree,
}

impl SledStore {
    /// Open or create the store at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let db = sled::open(path_ref)?;
        tracing::info!(path = %path_ref.display(), "Datapoint store opened");
        Self::from_db(db)
    }

    /// Temporary store removed on drop
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            datapoints: db.open_tree(DATAPOINTS_TREE)?,
            anomalies: db.open_tree(ANOMALIES_TREE)?,
            predicted: db.open_tree(PREDICTED_TREE)?,
            db: Arc::new(db),
        })
    }

    /// Append (or overwrite) one observed datapoint.
    ///
    /// Does not flush on each write; sled flushes in the background.
    pub fn append_datapoint(
        &self,
        attribute: &AttributeRef,
        datapoint: ValueDatapoint,
    ) -> Result<(), StoreError> {
        Self::insert(&self.datapoints, attribute, datapoint.timestamp, &datapoint.value)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get database size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    fn range<V: DeserializeOwned>(
        tree: &sled::Tree,
        attribute: &AttributeRef,
        from: i64,
        to: i64,
    ) -> Result<Vec<(i64, V)>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let prefix = attribute_prefix(attribute);
        let start = timestamp_key(&prefix, from);
        let end = timestamp_key(&prefix, to);

        tree.range(start..=end)
            .map(|item| {
                let (key, value) = item?;
                Ok((decode_timestamp(&key)?, serde_json::from_slice(&value)?))
            })
            .collect()
    }

    fn insert<V: Serialize>(
        tree: &sled::Tree,
        attribute: &AttributeRef,
        timestamp: i64,
        value: &V,
    ) -> Result<(), StoreError> {
        let key = timestamp_key(&attribute_prefix(attribute), timestamp);
        tree.insert(key, serde_json::to_vec(value)?)?;
        Ok(())
    }
}

impl DatapointStore for SledStore {
    fn query_range(
        &self,
        attribute: &AttributeRef,
        from: i64,
        to: i64,
    ) -> Result<Vec<ValueDatapoint>, StoreError> {
        Ok(Self::range::<f64>(&self.datapoints, attribute, from, to)?
            .into_iter()
            .map(|(ts, value)| ValueDatapoint::new(ts, value))
            .collect())
    }

    fn period(&self, attribute: &AttributeRef) -> Result<DatapointPeriod, StoreError> {
        let prefix = attribute_prefix(attribute);
        let mut iter = self.datapoints.scan_prefix(&prefix);

        let oldest = match iter.next() {
            Some(item) => Some(decode_timestamp(&item?.0)?),
            None => None,
        };
        let latest = match iter.next_back() {
            Some(item) => Some(decode_timestamp(&item?.0)?),
            // Single datapoint: oldest is also latest
            None => oldest,
        };

        Ok(DatapointPeriod { oldest, latest })
    }
}

impl AnomalyDatapointStore for SledStore {
    fn query_anomalies(
        &self,
        attribute: &AttributeRef,
        from: i64,
        to: i64,
    ) -> Result<Vec<AnomalyDatapoint>, StoreError> {
        Ok(
            Self::range::<AnomalyType>(&self.anomalies, attribute, from, to)?
                .into_iter()
                .map(|(timestamp, classification)| AnomalyDatapoint {
                    timestamp,
                    classification,
                })
                .collect(),
        )
    }

    fn write_classification(
        &self,
        attribute: &AttributeRef,
        classification: AnomalyType,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        Self::insert(&self.anomalies, attribute, timestamp, &classification)
    }
}

impl PredictedDatapointStore for SledStore {
    fn purge(&self, attribute: &AttributeRef) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for item in self.predicted.scan_prefix(attribute_prefix(attribute)) {
            let (key, _) = item?;
            batch.remove(key);
        }
        self.predicted.apply_batch(batch)?;
        Ok(())
    }

    fn write_batch(
        &self,
        attribute: &AttributeRef,
        datapoints: &[PredictedDatapoint],
    ) -> Result<(), StoreError> {
        let prefix = attribute_prefix(attribute);
        let mut batch = sled::Batch::default();
        for dp in datapoints {
            batch.insert(
                timestamp_key(&prefix, dp.timestamp),
                serde_json::to_vec(&dp.value)?,
            );
        }
        self.predicted.apply_batch(batch)?;
        Ok(())
    }

    fn read_all(&self, attribute: &AttributeRef) -> Result<Vec<PredictedDatapoint>, StoreError> {
        self.predicted
            .scan_prefix(attribute_prefix(attribute))
            .map(|item| {
                let (key, value) = item?;
                Ok(PredictedDatapoint {
                    timestamp: decode_timestamp(&key)?,
                    value: serde_json::from_slice(&value)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_keys_sort_chronologically() {
        let prefix = attribute_prefix(&AttributeRef::new("a", "b"));
        let negative = timestamp_key(&prefix, -5);
        let zero = timestamp_key(&prefix, 0);
        let positive = timestamp_key(&prefix, 1_700_000_000_000);
        assert!(negative < zero);
        assert!(zero < positive);
        assert_eq!(decode_timestamp(&negative).unwrap(), -5);
        assert_eq!(decode_timestamp(&positive).unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn test_prefixes_do_not_collide() {
        // "ab"/"c" must not share a prefix with "a"/"bc"
        let left = attribute_prefix(&AttributeRef::new("ab", "c"));
        let right = attribute_prefix(&AttributeRef::new("a", "bc"));
        assert_ne!(left, right);
        assert!(!left.starts_with(&right));
    }

    #[test]
    fn test_single_datapoint_period() {
        let store = SledStore::temporary().unwrap();
        let attr = AttributeRef::new("asset", "temp");
        store
            .append_datapoint(&attr, ValueDatapoint::new(42, 1.0))
            .unwrap();

        let period = store.period(&attr).unwrap();
        assert_eq!(period.oldest, Some(42));
        assert_eq!(period.latest, Some(42));
    }
}
