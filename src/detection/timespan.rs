//! Timespan rule: flags datapoints arriving after an unusual interval.
//!
//! Works on timestamps only; the value is ignored. Only intervals longer
//! than the tracked longest plus tolerance are irregular; shorter ones are
//! absorbed into the range.

use super::{tolerance, usable, DetectionRule};
use crate::types::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IntervalRange {
    longest: i64,
    longest_timestamp: i64,
    shortest: i64,
    shortest_timestamp: i64,
}

impl IntervalRange {
    fn seed(interval: i64, timestamp: i64) -> Self {
        Self {
            longest: interval,
            longest_timestamp: timestamp,
            shortest: interval,
            shortest_timestamp: timestamp,
        }
    }

    fn absorb(&mut self, interval: i64, timestamp: i64) {
        if interval >= self.longest {
            self.longest = interval;
            self.longest_timestamp = timestamp;
        }
        if interval <= self.shortest {
            self.shortest = interval;
            self.shortest_timestamp = timestamp;
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimespanRule {
    deviation_percent: f64,
    timespan_ms: i64,
    range: Option<IntervalRange>,
    previous_timestamp: Option<i64>,
}

impl TimespanRule {
    pub fn new(deviation_percent: f64, timespan_ms: i64) -> Self {
        Self {
            deviation_percent,
            timespan_ms,
            range: None,
            previous_timestamp: None,
        }
    }

    /// `(shortest, longest)` interval currently tracked, in milliseconds.
    pub fn interval_bounds(&self) -> Option<(i64, i64)> {
        self.range.map(|r| (r.shortest, r.longest))
    }
}

impl DetectionRule for TimespanRule {
    #[allow(clippy::cast_precision_loss)]
    fn validate(&mut self, _value: f64, timestamp: i64) -> bool {
        let Some(previous) = self.previous_timestamp.replace(timestamp) else {
            return true;
        };
        let interval = timestamp - previous;

        let Some((_, high)) = self.current_limits() else {
            self.range = Some(IntervalRange::seed(interval, timestamp));
            return true;
        };
        if interval as f64 > high {
            return false;
        }
        if let Some(range) = self.range.as_mut() {
            range.absorb(interval, timestamp);
        }
        true
    }

    fn is_recent_data_fresh(&self, latest_timestamp: i64) -> bool {
        let cutoff = latest_timestamp - self.timespan_ms;
        self.range
            .is_some_and(|r| r.longest_timestamp >= cutoff && r.shortest_timestamp >= cutoff)
    }

    fn refresh(&mut self, samples: &[Sample]) -> bool {
        let timestamps: Vec<i64> = usable(samples).map(|s| s.timestamp).collect();
        let Some(&first) = timestamps.first() else {
            return self.range.is_some();
        };

        let mut intervals = timestamps.windows(2).map(|pair| (pair[1] - pair[0], pair[1]));
        let mut range = match intervals.next() {
            Some((interval, ts)) => IntervalRange::seed(interval, ts),
            // No second point: zero-interval baseline
            None => IntervalRange::seed(0, first),
        };
        for (interval, ts) in intervals {
            range.absorb(interval, ts);
        }
        self.range = Some(range);
        self.previous_timestamp = samples.last().map(|s| s.timestamp);
        true
    }

    /// Interval band in milliseconds (not a value band).
    #[allow(clippy::cast_precision_loss)]
    fn current_limits(&self) -> Option<(f64, f64)> {
        self.range.map(|r| {
            // +1 keeps the band open when every interval so far is equal
            let spread = ((r.longest - r.shortest + 1) as f64).abs();
            let deviation = tolerance(spread, self.deviation_percent);
            (r.shortest as f64 - deviation, r.longest as f64 + deviation)
        })
    }

    /// Interval bands are not replayed, so `limits` leaves the rule as is.
    fn observe(&mut self, _sample: &Sample) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: i64 = 1_000;

    fn at(timestamps: &[i64]) -> Vec<Sample> {
        timestamps.iter().map(|ts| Sample::unchecked(0.0, *ts)).collect()
    }

    #[test]
    fn test_regular_intervals_pass_and_gaps_fail() {
        let mut rule = TimespanRule::new(50.0, 3_600 * SECOND);
        rule.refresh(&at(&[0, 10 * SECOND, 20 * SECOND, 31 * SECOND]));
        assert_eq!(rule.interval_bounds(), Some((10 * SECOND, 11 * SECOND)));

        // spread 1001 ms → tolerance ~500 ms
        assert!(rule.validate(0.0, 41 * SECOND));
        assert!(!rule.validate(0.0, 101 * SECOND));
    }

    #[test]
    fn test_shorter_interval_is_accepted_and_absorbed() {
        let mut rule = TimespanRule::new(10.0, 3_600 * SECOND);
        rule.refresh(&at(&[0, 10 * SECOND, 20 * SECOND, 30 * SECOND]));

        assert!(rule.validate(0.0, 39_900));
        assert_eq!(rule.interval_bounds(), Some((9_900, 10 * SECOND)));
        assert!(rule.validate(0.0, 39_900 + 100));
        assert_eq!(rule.interval_bounds(), Some((100, 10 * SECOND)));
    }

    #[test]
    fn test_limits_do_not_mutate() {
        let mut rule = TimespanRule::new(10.0, 3_600 * SECOND);
        rule.refresh(&at(&[0, 10 * SECOND, 20 * SECOND]));
        let before = rule.current_limits();

        assert_eq!(rule.limits(&Sample::unchecked(0.0, 500 * SECOND)), before);
        assert_eq!(rule.current_limits(), before);
        assert_eq!(rule.interval_bounds(), Some((10 * SECOND, 10 * SECOND)));
    }

    #[test]
    fn test_equal_intervals_keep_nonzero_band() {
        let rule = {
            let mut r = TimespanRule::new(10.0, 3_600 * SECOND);
            r.refresh(&at(&[0, 1_000, 2_000]));
            r
        };
        let (low, high) = rule.current_limits().unwrap();
        assert!(low < 1_000.0 && high > 1_000.0);
    }

    #[test]
    fn test_single_sample_zero_baseline() {
        let mut rule = TimespanRule::new(10.0, 3_600 * SECOND);
        assert!(rule.refresh(&at(&[5_000])));
        assert_eq!(rule.interval_bounds(), Some((0, 0)));
    }

    #[test]
    fn test_staleness_boundary() {
        let mut rule = TimespanRule::new(10.0, 100);
        rule.refresh(&at(&[0, 10]));
        assert!(rule.is_recent_data_fresh(110));
        assert!(!rule.is_recent_data_fresh(111));
    }
}
