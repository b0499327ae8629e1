//! Windowed change detection
//!
//! Compares the current window of samples against the same-sized window
//! `time_shift` earlier and reduces the slot-by-slot differences to a single
//! value.

use serde::{Deserialize, Serialize};

use super::{Aggregator, AggregatorError, AggregatorType};
use crate::storage::ChunkedAssociativeArray;

/// Sample slots per window when no sample interval is configured
pub const DEFAULT_SLOTS_PER_WINDOW: i64 = 60;
/// Updates between two trims of the sample store
pub const DEFAULT_TRIM_EVERY: usize = 50;

/// Reducer applied to the diff array
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAggregation {
    #[default]
    Avg,
    Min,
    Max,
    Sum,
    /// Nearest-rank percentile, `p` in [0, 1]
    Percentile(f64),
}

impl ChangeAggregation {
    pub fn reduce(&self, diffs: &[f64]) -> f64 {
        if diffs.is_empty() {
            return 0.0;
        }
        match self {
            ChangeAggregation::Avg => diffs.iter().sum::<f64>() / diffs.len() as f64,
            ChangeAggregation::Min => diffs.iter().cloned().fold(f64::INFINITY, f64::min),
            ChangeAggregation::Max => diffs.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            ChangeAggregation::Sum => diffs.iter().sum(),
            ChangeAggregation::Percentile(p) => {
                let mut sorted = diffs.to_vec();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let idx = (p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
                sorted[idx.min(sorted.len() - 1)]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangeOptions {
    /// Compared window duration (ms)
    pub window_size: i64,
    /// Distance between the current and the previous window (ms)
    pub time_shift: i64,
    /// Slot width samples are aligned to (ms), defaults to `window_size / 60`
    #[serde(default)]
    pub sample_interval: Option<i64>,
    #[serde(default)]
    pub aggregation: ChangeAggregation,
    /// Report relative change `(cur - prev) / prev` instead of the difference
    #[serde(default)]
    pub use_percentage: bool,
    #[serde(default)]
    pub trim_every: Option<usize>,
}

impl ChangeOptions {
    pub fn new(window_size: i64, time_shift: i64) -> Self {
        Self {
            window_size,
            time_shift,
            sample_interval: None,
            aggregation: ChangeAggregation::Avg,
            use_percentage: false,
            trim_every: None,
        }
    }

    pub fn with_sample_interval(mut self, interval: i64) -> Self {
        self.sample_interval = Some(interval);
        self
    }

    pub fn with_aggregation(mut self, aggregation: ChangeAggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_percentage(mut self, use_percentage: bool) -> Self {
        self.use_percentage = use_percentage;
        self
    }

    pub fn validate(&self) -> Result<(), AggregatorError> {
        if self.window_size <= 0 {
            return Err(AggregatorError::InvalidWindow(format!(
                "window_size must be positive, got {}",
                self.window_size
            )));
        }
        if self.time_shift <= 0 {
            return Err(AggregatorError::InvalidOption {
                name: "time_shift",
                reason: format!("must be positive, got {}", self.time_shift),
            });
        }
        if let Some(interval) = self.sample_interval {
            if interval <= 0 || interval > self.window_size {
                return Err(AggregatorError::InvalidOption {
                    name: "sample_interval",
                    reason: format!("must be in (0, {}], got {}", self.window_size, interval),
                });
            }
        }
        if let ChangeAggregation::Percentile(p) = self.aggregation {
            if !(0.0..=1.0).contains(&p) {
                return Err(AggregatorError::InvalidOption {
                    name: "aggregation",
                    reason: format!("percentile must be in [0, 1], got {}", p),
                });
            }
        }
        if self.trim_every == Some(0) {
            return Err(AggregatorError::InvalidOption {
                name: "trim_every",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ChangeAggregator {
    options: ChangeOptions,
    sample_interval: i64,
    trim_every: usize,
    samples: ChunkedAssociativeArray<i64, f64>,
    first_ts: Option<i64>,
    updates_since_trim: usize,
    value: f64,
    count: u64,
}

impl ChangeAggregator {
    pub fn new(options: &ChangeOptions) -> Result<Self, AggregatorError> {
        options.validate()?;
        let sample_interval = options
            .sample_interval
            .unwrap_or_else(|| (options.window_size / DEFAULT_SLOTS_PER_WINDOW).max(1));

        Ok(Self {
            options: *options,
            sample_interval,
            trim_every: options.trim_every.unwrap_or(DEFAULT_TRIM_EVERY),
            samples: ChunkedAssociativeArray::new(),
            first_ts: None,
            updates_since_trim: 0,
            value: 0.0,
            count: 0,
        })
    }

    pub fn options(&self) -> &ChangeOptions {
        &self.options
    }

    /// Number of samples currently retained
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn align(&self, ts: i64) -> i64 {
        ts.saturating_sub(ts.rem_euclid(self.sample_interval))
    }

    /// Samples in `[start, end]` as `(slot, value)` with slot offsets from `start`
    fn slots(&self, start: i64, end: i64) -> Vec<(i64, f64)> {
        self.samples
            .range(start, end)
            .map(|(ts, v)| ((ts - start) / self.sample_interval, *v))
            .collect()
    }

    /// Pairwise differences between the current and the previous window at `now`
    pub fn get_diffs(&self, now: i64) -> Vec<f64> {
        let current_start = self.align(now.saturating_sub(self.options.window_size));
        let previous_start = current_start.saturating_sub(self.options.time_shift);
        let span = now.saturating_sub(current_start);

        let current = self.slots(current_start, now);
        let previous = self.slots(previous_start, previous_start.saturating_add(span));

        let mut diffs = Vec::with_capacity(current.len().min(previous.len()));
        let (mut i, mut j) = (0, 0);
        while i < current.len() && j < previous.len() {
            let (cur_slot, cur) = current[i];
            let (prev_slot, prev) = previous[j];
            if cur_slot < prev_slot {
                i += 1;
            } else if prev_slot < cur_slot {
                j += 1;
            } else {
                diffs.push(self.delta(cur, prev));
                i += 1;
                j += 1;
            }
        }
        diffs
    }

    fn delta(&self, cur: f64, prev: f64) -> f64 {
        if self.options.use_percentage {
            if prev == 0.0 {
                0.0
            } else {
                (cur - prev) / prev
            }
        } else {
            cur - prev
        }
    }

    fn compute(&self, now: i64) -> f64 {
        if !self.is_full_window(now) {
            return 0.0;
        }
        self.options.aggregation.reduce(&self.get_diffs(now))
    }

    fn maybe_trim(&mut self, now: i64) {
        self.updates_since_trim += 1;
        if self.updates_since_trim < self.trim_every {
            return;
        }
        self.updates_since_trim = 0;
        let horizon = now
            .saturating_sub(self.options.window_size.saturating_mul(2))
            .saturating_sub(self.options.time_shift);
        let removed = self.samples.trim(self.align(horizon));
        if removed > 0 {
            tracing::trace!(removed, "Trimmed change samples");
        }
    }
}

impl Aggregator for ChangeAggregator {
    fn aggregator_type(&self) -> AggregatorType {
        AggregatorType::Change
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn update(&mut self, value: f64, ts: i64) -> f64 {
        if value.is_nan() {
            return self.value;
        }
        let key = self.align(ts);
        self.samples.put(key, value);
        if self.first_ts.map_or(true, |first| ts < first) {
            self.first_ts = Some(ts);
        }
        self.count += 1;
        self.maybe_trim(ts);
        self.value = self.compute(ts);
        self.value
    }

    fn tick(&mut self, ts: i64) -> f64 {
        self.value = self.compute(ts);
        self.value
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.first_ts = None;
        self.updates_since_trim = 0;
        self.value = 0.0;
        self.count = 0;
    }

    fn period(&self) -> Option<i64> {
        Some(self.sample_interval)
    }

    fn is_full_window(&self, ts: i64) -> bool {
        self.first_ts
            .map_or(false, |first| {
                ts.saturating_sub(first) >= self.options.window_size.saturating_add(self.options.time_shift)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(opts: &ChangeOptions, until: i64) -> ChangeAggregator {
        let mut agg = ChangeAggregator::new(opts).unwrap();
        let step = opts.sample_interval.unwrap();
        let mut ts = 0;
        while ts <= until {
            agg.update(ts as f64 / 1000.0, ts);
            ts += step;
        }
        agg
    }

    #[test]
    fn test_zero_before_full_window() {
        let opts = ChangeOptions::new(10_000, 5_000).with_sample_interval(1000);
        let agg = ramp(&opts, 14_000);
        assert_eq!(agg.value(), 0.0);
        assert!(!agg.is_full_window(14_000));
    }

    #[test]
    fn test_diff_length_and_average() {
        let opts = ChangeOptions::new(10_000, 5_000).with_sample_interval(1000);
        let agg = ramp(&opts, 20_000);

        let now = 20_000;
        let diffs = agg.get_diffs(now);

        let current: Vec<f64> = agg.samples.get_values(10_000, 20_000);
        let previous: Vec<f64> = agg.samples.get_values(5_000, 15_000);
        assert_eq!(diffs.len(), current.len().min(previous.len()));

        let reference: f64 = current
            .iter()
            .zip(previous.iter())
            .map(|(c, p)| c - p)
            .sum::<f64>()
            / diffs.len() as f64;
        assert!((agg.value() - reference).abs() < 1e-9);
        assert!((agg.value() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentage_change() {
        let opts = ChangeOptions::new(2_000, 2_000)
            .with_sample_interval(1000)
            .with_percentage(true);
        let mut agg = ChangeAggregator::new(&opts).unwrap();

        agg.update(0.0, 0);
        agg.update(10.0, 1000);
        agg.update(10.0, 2000);
        agg.update(20.0, 3000);
        let value = agg.update(30.0, 4000);

        // current [2000, 4000] against previous [0, 2000]; a zero base reports no change
        let diffs = agg.get_diffs(4000);
        assert_eq!(diffs, vec![0.0, 1.0, 2.0]);
        assert!((value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_slots_are_skipped() {
        let opts = ChangeOptions::new(4_000, 4_000).with_sample_interval(1000);
        let mut agg = ChangeAggregator::new(&opts).unwrap();

        for (ts, v) in [(0, 1.0), (1000, 2.0), (2000, 3.0), (3000, 4.0)] {
            agg.update(v, ts);
        }
        // current window has no samples at 4000 and 6000
        for (ts, v) in [(5000, 10.0), (7000, 20.0)] {
            agg.update(v, ts);
        }
        let value = agg.update(30.0, 8000);

        // only slots present in both windows pair up: 5000/1000 and 7000/3000
        let diffs = agg.get_diffs(8000);
        assert_eq!(diffs, vec![8.0, 16.0]);
        let current = agg.samples.get_values(4000, 8000).len();
        let previous = agg.samples.get_values(0, 4000).len();
        assert!(diffs.len() < current.min(previous));
        assert_eq!(value, 12.0);
    }

    #[test]
    fn test_zero_base_slot() {
        let absolute = ChangeOptions::new(1_000, 2_000).with_sample_interval(1000);
        let relative = absolute.with_percentage(true);

        for (opts, expected) in [(absolute, vec![8.0, 8.0]), (relative, vec![0.0, 2.0])] {
            let mut agg = ChangeAggregator::new(&opts).unwrap();
            for (ts, v) in [(0, 0.0), (1000, 4.0), (2000, 8.0), (3000, 12.0)] {
                agg.update(v, ts);
            }
            assert_eq!(agg.get_diffs(3000), expected);
        }
    }

    #[test]
    fn test_huge_windows_do_not_overflow() {
        let mut opts = ChangeOptions::new(i64::MAX / 2, i64::MAX / 2);
        opts.trim_every = Some(1);
        let mut agg = ChangeAggregator::new(&opts).unwrap();

        assert_eq!(agg.update(1.0, 1_000), 0.0);
        assert_eq!(agg.update(2.0, -1_000), 0.0);
        assert_eq!(agg.sample_count(), 2);
        assert!(agg.get_diffs(1_000).is_empty());
    }

    #[test]
    fn test_reducers() {
        let diffs = [3.0, -1.0, 4.0, 1.0, 5.0];
        assert_eq!(ChangeAggregation::Min.reduce(&diffs), -1.0);
        assert_eq!(ChangeAggregation::Max.reduce(&diffs), 5.0);
        assert_eq!(ChangeAggregation::Sum.reduce(&diffs), 12.0);
        assert_eq!(ChangeAggregation::Avg.reduce(&diffs), 2.4);
        assert_eq!(ChangeAggregation::Percentile(0.5).reduce(&diffs), 3.0);
        assert_eq!(ChangeAggregation::Avg.reduce(&[]), 0.0);
    }

    #[test]
    fn test_trim_bounds_memory() {
        let mut opts = ChangeOptions::new(1_000, 500).with_sample_interval(100);
        opts.trim_every = Some(10);
        let agg = ramp(&opts, 100_000);

        // horizon is 2 * window + shift = 2500ms, i.e. ~25 slots plus one trim period
        assert!(agg.sample_count() <= 36, "retained {}", agg.sample_count());
    }

    #[test]
    fn test_validation() {
        assert!(ChangeAggregator::new(&ChangeOptions::new(0, 10)).is_err());
        assert!(ChangeAggregator::new(&ChangeOptions::new(10, 0)).is_err());
        assert!(ChangeAggregator::new(&ChangeOptions::new(10, 10).with_sample_interval(20)).is_err());
        assert!(ChangeAggregator::new(
            &ChangeOptions::new(10, 10).with_aggregation(ChangeAggregation::Percentile(2.0))
        )
        .is_err());
    }
}
