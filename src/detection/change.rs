//! Change rule: flags values whose increase over the previous value falls
//! outside the observed increase range ± tolerance.

use super::{tolerance, usable, DetectionRule};
use crate::types::Sample;

#[derive(Debug, Clone, Copy, PartialEq)]
struct IncreaseRange {
    biggest: f64,
    biggest_timestamp: i64,
    smallest: f64,
    smallest_timestamp: i64,
}

impl IncreaseRange {
    fn seed(increase: f64, timestamp: i64) -> Self {
        Self {
            biggest: increase,
            biggest_timestamp: timestamp,
            smallest: increase,
            smallest_timestamp: timestamp,
        }
    }

    fn absorb(&mut self, increase: f64, timestamp: i64) {
        if increase >= self.biggest {
            self.biggest = increase;
            self.biggest_timestamp = timestamp;
        }
        if increase <= self.smallest {
            self.smallest = increase;
            self.smallest_timestamp = timestamp;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Previous {
    value: f64,
    timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct ChangeRule {
    deviation_percent: f64,
    timespan_ms: i64,
    range: Option<IncreaseRange>,
    previous: Option<Previous>,
}

impl ChangeRule {
    pub fn new(deviation_percent: f64, timespan_ms: i64) -> Self {
        Self {
            deviation_percent,
            timespan_ms,
            range: None,
            previous: None,
        }
    }

    /// `(smallest, biggest)` increase currently tracked.
    pub fn increase_bounds(&self) -> Option<(f64, f64)> {
        self.range.map(|r| (r.smallest, r.biggest))
    }

    /// Band the increase itself must fall in.
    fn increase_limits(&self) -> Option<(f64, f64)> {
        self.range.map(|r| {
            let deviation = tolerance(r.biggest - r.smallest, self.deviation_percent);
            (r.smallest - deviation, r.biggest + deviation)
        })
    }
}

impl DetectionRule for ChangeRule {
    fn validate(&mut self, value: f64, timestamp: i64) -> bool {
        let Some(previous) = self.previous.replace(Previous { value, timestamp }) else {
            return true;
        };
        let increase = value - previous.value;

        let Some((low, high)) = self.increase_limits() else {
            self.range = Some(IncreaseRange::seed(increase, timestamp));
            return true;
        };
        if increase < low || increase > high {
            return false;
        }
        if let Some(range) = self.range.as_mut() {
            range.absorb(increase, timestamp);
        }
        true
    }

    fn is_recent_data_fresh(&self, latest_timestamp: i64) -> bool {
        let cutoff = latest_timestamp - self.timespan_ms;
        self.range
            .is_some_and(|r| r.biggest_timestamp >= cutoff && r.smallest_timestamp >= cutoff)
    }

    fn refresh(&mut self, samples: &[Sample]) -> bool {
        let points: Vec<&Sample> = usable(samples).collect();
        let Some(first) = points.first() else {
            return self.range.is_some();
        };

        let range = if points.len() == 1 {
            // No second point: zero-increase baseline
            IncreaseRange::seed(0.0, first.timestamp)
        } else {
            let mut increases = points
                .windows(2)
                .map(|pair| (pair[1].value - pair[0].value, pair[1].timestamp));
            let mut range = match increases.next() {
                Some((increase, ts)) => IncreaseRange::seed(increase, ts),
                None => IncreaseRange::seed(0.0, first.timestamp),
            };
            for (increase, ts) in increases {
                range.absorb(increase, ts);
            }
            range
        };
        self.range = Some(range);

        // The next increase is measured from the newest stored value,
        // whatever its classification.
        if let Some(last) = samples.last() {
            self.previous = Some(Previous {
                value: last.value,
                timestamp: last.timestamp,
            });
        }
        true
    }

    fn current_limits(&self) -> Option<(f64, f64)> {
        let previous = self.previous?;
        self.increase_limits()
            .map(|(low, high)| (previous.value + low, previous.value + high))
    }

    fn observe(&mut self, sample: &Sample) {
        let current = Previous {
            value: sample.value,
            timestamp: sample.timestamp,
        };
        let Some(previous) = self.previous.replace(current) else {
            return;
        };

        let increase = sample.value - previous.value;
        match self.range.as_mut() {
            Some(range) => range.absorb(increase, sample.timestamp),
            None => self.range = Some(IncreaseRange::seed(increase, sample.timestamp)),
        }
    }
}
