//! Weighted Exponential Average model
//!
//! For one horizon, `R = past_count` samples are taken one past period
//! apart, oldest first, and folded:
//!
//! ```text
//! a = 2 / (R + 1)
//! f = v1;  f = v(i+1)·a + f·(1 - a)
//! ```
//!
//! Samples come from `past_count` history buckets, each
//! `min(forecast_period × forecast_count, past_period)` wide and starting
//! `i × past_period` before now (shifted by the schedule offset). A horizon
//! with any bucket lacking a sample produces no forecast.

use crate::storage::{DatapointStore, StoreError};
use crate::types::{PredictedDatapoint, ValueDatapoint};

use super::{ForecastAttribute, ForecastConfig};

// ============================================================================
// WEA
// ============================================================================

/// Fold oldest-first values into one forecast value.
///
/// A single value is folded against a zero baseline, which with `a = 1`
/// yields the value itself.
#[allow(clippy::cast_precision_loss)]
pub fn weighted_exponential_average(values: &[f64]) -> Option<f64> {
    let (first, rest) = values.split_first()?;
    let a = 2.0 / (values.len() as f64 + 1.0);
    if rest.is_empty() {
        return Some(*first * a);
    }
    Some(
        rest.iter()
            .fold(*first, |older, newer| newer * a + older * (1.0 - a)),
    )
}

// ============================================================================
// Timestamps
// ============================================================================

/// Due timestamps for the next run: `now + forecast_period × k`.
pub fn forecast_timestamps(now: i64, config: &ForecastConfig) -> Vec<i64> {
    (1..=i64::from(config.forecast_count))
        .map(|k| now + config.forecast_period_ms * k)
        .collect()
}

/// Sample timestamps per horizon, each list oldest first.
pub fn sample_timestamps(now: i64, config: &ForecastConfig, offset: i64) -> Vec<Vec<i64>> {
    (1..=i64::from(config.forecast_count))
        .map(|k| {
            (1..=i64::from(config.past_count))
                .rev()
                .map(|i| now - config.past_period_ms * i + config.forecast_period_ms * k + offset)
                .collect()
        })
        .collect()
}

// ============================================================================
// History Buckets
// ============================================================================

/// Inclusive time range of historical datapoints, ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct DatapointBucket {
    pub begin: i64,
    pub end: i64,
    pub datapoints: Vec<ValueDatapoint>,
}

impl DatapointBucket {
    pub fn new(begin: i64, end: i64) -> Self {
        Self {
            begin,
            end,
            datapoints: Vec::new(),
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.begin && timestamp <= self.end
    }
}

/// Empty buckets, oldest first.
pub fn history_buckets(now: i64, config: &ForecastConfig, offset: i64) -> Vec<DatapointBucket> {
    let width = (config.forecast_period_ms * i64::from(config.forecast_count)).min(config.past_period_ms);
    (1..=i64::from(config.past_count))
        .rev()
        .map(|i| {
            let begin = now - config.past_period_ms * i + offset;
            DatapointBucket::new(begin, begin + width)
        })
        .collect()
}

/// Put each datapoint (ascending) into the first bucket containing it.
pub fn fill_buckets(buckets: &mut [DatapointBucket], datapoints: Vec<ValueDatapoint>) {
    for dp in datapoints {
        if let Some(bucket) = buckets.iter_mut().find(|b| b.contains(dp.timestamp)) {
            bucket.datapoints.push(dp);
        }
    }
}

/// For each sample timestamp, the latest datapoint at or before it inside
/// the bucket covering it. Timestamps without one are left out.
pub fn find_samples(buckets: &[DatapointBucket], sample_timestamps: &[i64]) -> Vec<ValueDatapoint> {
    sample_timestamps
        .iter()
        .filter_map(|&ts| {
            let bucket = buckets.iter().find(|b| b.contains(ts))?;
            bucket
                .datapoints
                .iter()
                .take_while(|dp| dp.timestamp <= ts)
                .last()
                .copied()
        })
        .collect()
}

// ============================================================================
// Forecast Run
// ============================================================================

/// Forecast one attribute against its pending due timestamps.
///
/// Returns `None` when nothing should be written (no pending timestamps, or
/// fewer timestamps than horizons); otherwise the predicted datapoints,
/// possibly empty when every horizon lacked history.
pub fn compute_forecasts(
    store: &dyn DatapointStore,
    attribute: &ForecastAttribute,
    now: i64,
) -> Result<Option<Vec<PredictedDatapoint>>, StoreError> {
    let timestamps = attribute.timestamps();
    let Some(&next) = timestamps.first() else {
        return Ok(None);
    };
    let config = attribute.config();
    let offset = next - (now + config.forecast_period_ms);

    let mut buckets = history_buckets(now, config, offset);
    if let (Some(first), Some(last)) = (buckets.first(), buckets.last()) {
        let datapoints = store.query_range(attribute.attribute(), first.begin, last.end)?;
        fill_buckets(&mut buckets, datapoints);
    }

    let past_count = config.past_count as usize;
    let values: Vec<Option<f64>> = sample_timestamps(now, config, offset)
        .iter()
        .map(|samples| {
            let found = find_samples(&buckets, samples);
            if found.len() == past_count {
                let values: Vec<f64> = found.iter().map(|dp| dp.value).collect();
                weighted_exponential_average(&values)
            } else {
                None
            }
        })
        .collect();

    if timestamps.len() < values.len() {
        return Ok(None);
    }

    Ok(Some(
        values
            .into_iter()
            .zip(timestamps)
            .filter_map(|(value, &timestamp)| {
                let value = attribute.value_type().narrow(value?)?;
                Some(PredictedDatapoint { timestamp, value })
            })
            .collect(),
    ))
}
