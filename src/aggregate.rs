//! Streaming statistical aggregation over telemetry samples.
//!
//! The aggregator keeps running count/sum/max/min per channel in exact
//! fixed-point arithmetic; the mean is computed at read time. A summary
//! is absent until at least one sample exists, so callers can never
//! mistake "no data" for zero-valued telemetry.

use crate::protocol::Centi;
use crate::session::Sample;
use serde::Serialize;

/// Running accumulator for one telemetry channel.
#[derive(Debug, Clone, Copy, Default)]
struct Channel {
    count: u64,
    sum: i64,
    max: i64,
    min: i64,
}

impl Channel {
    fn update(&mut self, value: Centi) {
        let raw = value.raw();
        if self.count == 0 {
            self.max = raw;
            self.min = raw;
        } else {
            self.max = self.max.max(raw);
            self.min = self.min.min(raw);
        }
        self.count += 1;
        self.sum += raw;
    }

    fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            mean: (self.sum as f64 / self.count as f64) / 100.0,
            max: Centi::from_raw(self.max).as_f64(),
            min: Centi::from_raw(self.min).as_f64(),
        }
    }
}

/// Mean/max/min for one channel, in milli-units (mA or mV).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelSummary {
    pub mean: f64,
    pub max: f64,
    pub min: f64,
}

/// Derived statistics over a session's samples.
///
/// Always recomputable from the sample sequence; never stored as ground
/// truth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregateSummary {
    /// Current statistics in mA
    pub current: ChannelSummary,
    /// Voltage statistics in mV
    pub voltage: ChannelSummary,
}

/// Incremental aggregator fed one [`Sample`] at a time.
///
/// # Examples
///
/// ```
/// use dutnet::aggregate::Aggregator;
/// use dutnet::protocol::Centi;
/// use dutnet::session::Sample;
///
/// let mut agg = Aggregator::new();
/// assert!(agg.summary().is_none());
///
/// agg.update(&Sample {
///     elapsed_ms: 100,
///     current_ma: Centi::from_raw(5060),
///     voltage_mv: Centi::from_raw(447730),
/// });
/// agg.update(&Sample {
///     elapsed_ms: 200,
///     current_ma: Centi::from_raw(1360),
///     voltage_mv: Centi::from_raw(446030),
/// });
///
/// let summary = agg.summary().unwrap();
/// assert_eq!(summary.current.mean, 32.1);
/// assert_eq!(summary.current.max, 50.6);
/// assert_eq!(summary.current.min, 13.6);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator {
    current: Channel,
    voltage: Channel,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one sample into the running statistics.
    pub fn update(&mut self, sample: &Sample) {
        self.current.update(sample.current_ma);
        self.voltage.update(sample.voltage_mv);
    }

    /// Returns the summary, or `None` before any sample has arrived.
    pub fn summary(&self) -> Option<AggregateSummary> {
        if self.current.count == 0 {
            return None;
        }
        Some(AggregateSummary {
            current: self.current.summary(),
            voltage: self.voltage.summary(),
        })
    }

    /// Number of samples aggregated so far.
    pub fn count(&self) -> u64 {
        self.current.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(elapsed_ms: u64, ma: i64, mv: i64) -> Sample {
        Sample {
            elapsed_ms,
            current_ma: Centi::from_raw(ma),
            voltage_mv: Centi::from_raw(mv),
        }
    }

    #[test]
    fn test_empty_summary_is_absent() {
        assert!(Aggregator::new().summary().is_none());
    }

    #[test]
    fn test_reference_aggregate_values() {
        // Samples [(100, 50.6, 4477.3), (200, 13.6, 4460.3)]
        let mut agg = Aggregator::new();
        agg.update(&sample(100, 5060, 447730));
        agg.update(&sample(200, 1360, 446030));

        let s = agg.summary().unwrap();
        assert_eq!(s.current.mean, 32.1);
        assert_eq!(s.current.max, 50.6);
        assert_eq!(s.current.min, 13.6);
        assert_eq!(s.voltage.max, 4477.3);
        assert_eq!(s.voltage.min, 4460.3);
        assert_eq!(s.voltage.mean, 4468.8);
    }

    #[test]
    fn test_single_sample_mean_equals_value() {
        let mut agg = Aggregator::new();
        agg.update(&sample(0, 700, 1200));
        let s = agg.summary().unwrap();
        assert_eq!(s.current.mean, 7.0);
        assert_eq!(s.current.max, 7.0);
        assert_eq!(s.current.min, 7.0);
    }

    #[test]
    fn test_negative_values() {
        let mut agg = Aggregator::new();
        agg.update(&sample(0, -500, -100));
        agg.update(&sample(100, 500, 300));
        let s = agg.summary().unwrap();
        assert_eq!(s.current.mean, 0.0);
        assert_eq!(s.current.min, -5.0);
        assert_eq!(s.current.max, 5.0);
        assert_eq!(s.voltage.mean, 1.0);
    }

    #[test]
    fn test_summary_serializes_for_export() {
        let mut agg = Aggregator::new();
        agg.update(&sample(100, 5060, 447730));
        agg.update(&sample(200, 1360, 446030));

        let json = serde_json::to_value(agg.summary().unwrap()).unwrap();
        assert_eq!(json["current"]["mean"], 32.1);
        assert_eq!(json["current"]["max"], 50.6);
        assert_eq!(json["voltage"]["min"], 4460.3);
    }

    #[test]
    fn test_channels_are_independent() {
        let mut agg = Aggregator::new();
        agg.update(&sample(0, 100, 900));
        agg.update(&sample(100, 900, 100));
        let s = agg.summary().unwrap();
        assert_eq!(s.current.max, 9.0);
        assert_eq!(s.voltage.max, 9.0);
        assert_eq!(s.current.min, 1.0);
        assert_eq!(s.voltage.min, 1.0);
        assert_eq!(agg.count(), 2);
    }
}
