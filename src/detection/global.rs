//! Global range rule: flags values outside the observed min/max ± tolerance.

use super::{tolerance, usable, DetectionRule};
use crate::config::defaults::GLOBAL_RANGE_EPSILON;
use crate::types::Sample;

/// Observed extrema with the timestamps they were seen at.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Extrema {
    min: f64,
    min_timestamp: i64,
    max: f64,
    max_timestamp: i64,
}

impl Extrema {
    fn seed(value: f64, timestamp: i64) -> Self {
        Self {
            min: value,
            min_timestamp: timestamp,
            max: value,
            max_timestamp: timestamp,
        }
    }

    /// Ties move the timestamp forward so a repeated extremum stays fresh.
    fn absorb(&mut self, value: f64, timestamp: i64) {
        if value >= self.max {
            self.max = value;
            self.max_timestamp = timestamp;
        }
        if value <= self.min {
            self.min = value;
            self.min_timestamp = timestamp;
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlobalRule {
    deviation_percent: f64,
    timespan_ms: i64,
    extrema: Option<Extrema>,
}

impl GlobalRule {
    pub fn new(deviation_percent: f64, timespan_ms: i64) -> Self {
        Self {
            deviation_percent,
            timespan_ms,
            extrema: None,
        }
    }

    /// `(min, max)` currently tracked.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        self.extrema.map(|e| (e.min, e.max))
    }
}

impl DetectionRule for GlobalRule {
    fn validate(&mut self, value: f64, timestamp: i64) -> bool {
        let Some((low, high)) = self.current_limits() else {
            self.extrema = Some(Extrema::seed(value, timestamp));
            return true;
        };
        if value < low || value > high {
            return false;
        }
        if let Some(extrema) = self.extrema.as_mut() {
            extrema.absorb(value, timestamp);
        }
        true
    }

    fn is_recent_data_fresh(&self, latest_timestamp: i64) -> bool {
        let cutoff = latest_timestamp - self.timespan_ms;
        self.extrema
            .is_some_and(|e| e.min_timestamp >= cutoff && e.max_timestamp >= cutoff)
    }

    fn refresh(&mut self, samples: &[Sample]) -> bool {
        let mut points = usable(samples);
        let Some(first) = points.next() else {
            return self.extrema.is_some();
        };

        let mut extrema = Extrema::seed(first.value, first.timestamp);
        for sample in points {
            extrema.absorb(sample.value, sample.timestamp);
        }
        self.extrema = Some(extrema);
        true
    }

    fn current_limits(&self) -> Option<(f64, f64)> {
        self.extrema.map(|e| {
            let deviation = tolerance(e.max - e.min + GLOBAL_RANGE_EPSILON, self.deviation_percent);
            (e.min - deviation, e.max + deviation)
        })
    }

    fn observe(&mut self, sample: &Sample) {
        match self.extrema.as_mut() {
            Some(extrema) => extrema.absorb(sample.value, sample.timestamp),
            None => self.extrema = Some(Extrema::seed(sample.value, sample.timestamp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnomalyType;

    const HOUR: i64 = 3_600_000;

    fn rule_with(samples: &[(f64, i64)]) -> GlobalRule {
        let mut rule = GlobalRule::new(10.0, HOUR);
        let samples: Vec<Sample> = samples
            .iter()
            .map(|(v, ts)| Sample::unchecked(*v, *ts))
            .collect();
        assert!(rule.refresh(&samples));
        rule
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let mut rule = rule_with(&[(10.0, 0), (12.0, HOUR)]);
        assert!(rule.validate(10.0, HOUR + 1));
        assert!(rule.validate(12.0, HOUR + 2));

        let (low, high) = rule.current_limits().unwrap();
        assert!(rule.validate(low, HOUR + 3));
        let mut rule = rule_with(&[(10.0, 0), (12.0, HOUR)]);
        assert!(rule.validate(high, HOUR + 3));
    }

    #[test]
    fn test_outlier_rejected_without_widening() {
        let mut rule = rule_with(&[(10.0, 0), (12.0, HOUR)]);
        assert!(!rule.validate(50.0, 2 * HOUR));
        assert_eq!(rule.bounds(), Some((10.0, 12.0)));
    }

    #[test]
    fn test_valid_value_within_tolerance_widens() {
        let mut rule = rule_with(&[(10.0, 0), (12.0, HOUR)]);
        // range 2.001 → deviation 0.2001
        assert!(rule.validate(12.2, 2 * HOUR));
        assert_eq!(rule.bounds(), Some((10.0, 12.2)));
    }

    #[test]
    fn test_equal_extrema_still_have_a_band() {
        let rule = rule_with(&[(5.0, 0)]);
        let (low, high) = rule.current_limits().unwrap();
        assert!(low < 5.0 && high > 5.0);
    }

    #[test]
    fn test_refresh_is_idempotent_and_skips_anomalies() {
        let samples = vec![
            Sample::new(10.0, 0, AnomalyType::Valid),
            Sample::new(99.0, 1, AnomalyType::GlobalOutlier),
            Sample::new(12.0, 2, AnomalyType::Unchecked),
        ];
        let mut once = GlobalRule::new(10.0, HOUR);
        once.refresh(&samples);
        let mut twice = once.clone();
        twice.refresh(&samples);

        assert_eq!(once.bounds(), Some((10.0, 12.0)));
        assert_eq!(once.extrema, twice.extrema);
    }

    #[test]
    fn test_refresh_without_usable_samples_is_noop() {
        let mut rule = GlobalRule::new(10.0, HOUR);
        assert!(!rule.refresh(&[]));
        assert!(!rule.refresh(&[Sample::new(1.0, 0, AnomalyType::Multiple)]));
        assert_eq!(rule.bounds(), None);
    }

    #[test]
    fn test_staleness_boundary() {
        let rule = rule_with(&[(10.0, 0), (12.0, 0)]);
        // Extremum exactly at latest - timespan is still fresh
        assert!(rule.is_recent_data_fresh(HOUR));
        // One millisecond older is stale
        assert!(!rule.is_recent_data_fresh(HOUR + 1));
    }

    #[test]
    fn test_trailing_limits_then_absorb() {
        let mut rule = rule_with(&[(10.0, 0), (12.0, 1)]);
        let before = rule.current_limits();
        let band = rule.limits(&Sample::unchecked(20.0, 2));
        assert_eq!(band, before);
        assert_eq!(rule.bounds(), Some((10.0, 20.0)));
    }
}
