use super::window::{Bucket, SlidingWindow, WindowOptions};
use super::{Aggregator, AggregatorError, AggregatorType};

/// Which extreme the aggregator tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extremum {
    Max,
    Min,
}

impl Extremum {
    fn pick(self, a: f64, b: f64) -> f64 {
        match self {
            Extremum::Max => a.max(b),
            Extremum::Min => a.min(b),
        }
    }

    fn combine(self, current: Option<f64>, value: f64) -> f64 {
        current.map_or(value, |c| self.pick(c, value))
    }
}

#[derive(Debug, Clone, Default)]
struct ExtremumBucket {
    value: Option<f64>,
    count: u64,
}

impl Bucket for ExtremumBucket {
    fn clear(&mut self) {
        self.value = None;
        self.count = 0;
    }
}

/// Windowed MAX / MIN.
///
/// The global extreme is combined incrementally and only rescanned across
/// buckets when the evicted bucket held it.
#[derive(Debug, Clone)]
pub struct ExtremumAggregator {
    kind: Extremum,
    window: SlidingWindow<ExtremumBucket>,
    current: Option<f64>,
    count: u64,
}

impl ExtremumAggregator {
    pub fn new(kind: Extremum, options: &WindowOptions) -> Result<Self, AggregatorError> {
        Ok(Self {
            kind,
            window: SlidingWindow::from_options(options, ExtremumBucket::default)?,
            current: None,
            count: 0,
        })
    }

    pub fn max(options: &WindowOptions) -> Result<Self, AggregatorError> {
        Self::new(Extremum::Max, options)
    }

    pub fn min(options: &WindowOptions) -> Result<Self, AggregatorError> {
        Self::new(Extremum::Min, options)
    }

    fn rotate(&mut self, ts: i64) {
        let current = self.current;
        let mut stale = false;
        let mut evicted = 0;

        self.window.rotate(ts, |bucket| {
            if bucket.value.is_some() && bucket.value == current {
                stale = true;
            }
            evicted += bucket.count;
        });

        self.count -= evicted;
        if stale {
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        let kind = self.kind;
        self.current = self
            .window
            .buckets()
            .filter_map(|b| b.value)
            .fold(None, |acc, v| Some(kind.combine(acc, v)));
    }
}

impl Aggregator for ExtremumAggregator {
    fn aggregator_type(&self) -> AggregatorType {
        match self.kind {
            Extremum::Max => AggregatorType::Max,
            Extremum::Min => AggregatorType::Min,
        }
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn value(&self) -> f64 {
        self.current.unwrap_or(0.0)
    }

    fn update(&mut self, value: f64, ts: i64) -> f64 {
        if value.is_nan() {
            return self.value();
        }
        self.rotate(ts);

        let kind = self.kind;
        let bucket = self.window.current_mut();
        bucket.value = Some(kind.combine(bucket.value, value));
        bucket.count += 1;

        self.current = Some(kind.combine(self.current, value));
        self.count += 1;
        self.value()
    }

    fn tick(&mut self, ts: i64) -> f64 {
        self.rotate(ts);
        self.value()
    }

    fn reset(&mut self) {
        self.window.reset();
        self.current = None;
        self.count = 0;
    }

    fn period(&self) -> Option<i64> {
        self.window.granularity()
    }

    fn is_full_window(&self, ts: i64) -> bool {
        self.window.is_full_window(ts)
    }
}
