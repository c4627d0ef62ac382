//! Diagnostic limit bands
//!
//! Replays one detection config over recent history and reports the band
//! each datapoint was judged against. A fresh rule instance is used, so live
//! classifiers are never touched by diagnostic queries.

use serde::Serialize;

use crate::detection::{
    DetectionConfig, DetectionError, DetectionKind, DetectionMethod, DetectionRule,
};
use crate::storage::DatapointStore;
use crate::types::{AttributeRef, Sample, ValueDatapoint};

/// Lower/upper series aligned to historical timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LimitBands {
    /// Every datapoint in the replayed window, oldest first
    pub datapoints: Vec<ValueDatapoint>,
    pub lower: Vec<ValueDatapoint>,
    pub upper: Vec<ValueDatapoint>,
    /// Datapoints outside the band computed for them
    pub anomalies: Vec<ValueDatapoint>,
}

impl LimitBands {
    pub fn has_bands(&self) -> bool {
        !self.lower.is_empty()
    }
}

/// Compute limit bands over `history_multiplier × timespan` of history.
///
/// - No stored datapoints, or a stored period shorter than one timespan:
///   empty result
/// - Fewer than `minimum_datapoints + 2` datapoints in the window: only
///   `datapoints` is filled
pub fn compute_limit_bands(
    store: &dyn DatapointStore,
    attribute: &AttributeRef,
    config: &DetectionConfig,
    history_multiplier: u32,
) -> Result<LimitBands, DetectionError> {
    if config.kind == DetectionKind::Timespan {
        return Err(DetectionError::InvalidArgument(format!(
            "limit bands are not defined for timespan detection ('{}')",
            config.name
        )));
    }
    let mut method = DetectionMethod::from_config(config)?;

    let period = store.period(attribute)?;
    let (Some(oldest), Some(latest)) = (period.oldest, period.latest) else {
        return Ok(LimitBands::default());
    };
    if latest - oldest < config.timespan_ms {
        return Ok(LimitBands::default());
    }

    let lookback = config
        .timespan_ms
        .saturating_mul(i64::from(history_multiplier));
    let from = latest.saturating_sub(lookback);
    let datapoints = store.query_range(attribute, from, latest)?;

    let minimum = config.minimum_datapoints as usize;
    if datapoints.len() < minimum + 2 {
        return Ok(LimitBands {
            datapoints,
            ..LimitBands::default()
        });
    }

    let mut bands = LimitBands::default();
    for (index, dp) in datapoints.iter().enumerate().skip(minimum.saturating_sub(1)) {
        let sample = Sample::unchecked(dp.value, dp.timestamp);

        if !method.is_recent_data_fresh(dp.timestamp) {
            let window: Vec<Sample> = datapoints[..index]
                .iter()
                .filter(|p| p.timestamp > dp.timestamp - config.timespan_ms)
                .map(|p| Sample::unchecked(p.value, p.timestamp))
                .collect();
            if window.is_empty() || !method.refresh(&window) {
                continue;
            }
        }

        let Some((low, high)) = method.limits(&sample) else {
            continue;
        };
        bands.lower.push(ValueDatapoint::new(dp.timestamp, low));
        bands.upper.push(ValueDatapoint::new(dp.timestamp, high));
        if dp.value < low || dp.value > high {
            bands.anomalies.push(*dp);
        }
    }

    bands.datapoints = datapoints;
    Ok(bands)
}
