use serde::{Deserialize, Serialize};

use super::sketch::{QuantileSketch, DEFAULT_RELATIVE_ACCURACY};
use super::window::{SlidingWindow, WindowOptions};
use super::{Aggregator, AggregatorError, AggregatorType};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantileOptions {
    /// Quantile in [0, 1], e.g. 0.95
    pub quantile: f64,
    #[serde(default)]
    pub window: Option<i64>,
    #[serde(default)]
    pub granularity: Option<i64>,
    /// Sketch relative accuracy
    #[serde(default)]
    pub alpha: Option<f64>,
}

impl QuantileOptions {
    pub fn new(quantile: f64) -> Self {
        Self {
            quantile,
            window: None,
            granularity: None,
            alpha: None,
        }
    }

    pub fn with_window(mut self, window: WindowOptions) -> Self {
        self.window = window.window;
        self.granularity = window.granularity;
        self
    }

    pub fn window_options(&self) -> WindowOptions {
        WindowOptions {
            window: self.window,
            granularity: self.granularity,
        }
    }
}

/// Windowed quantile.
///
/// Every bucket owns a sketch of its raw samples and `accumulator` is the
/// union of all live buckets. Eviction subtracts the evicted bucket's bins
/// from the accumulator, so raw samples are never rescanned.
#[derive(Debug, Clone)]
pub struct QuantileAggregator {
    quantile: f64,
    window: SlidingWindow<QuantileSketch>,
    accumulator: QuantileSketch,
}

impl QuantileAggregator {
    pub fn new(options: &QuantileOptions) -> Result<Self, AggregatorError> {
        if !(0.0..=1.0).contains(&options.quantile) {
            return Err(AggregatorError::InvalidOption {
                name: "quantile",
                reason: format!("must be in [0, 1], got {}", options.quantile),
            });
        }

        let prototype = QuantileSketch::new(options.alpha.unwrap_or(DEFAULT_RELATIVE_ACCURACY))?;
        let window = SlidingWindow::from_options(&options.window_options(), || prototype.clone())?;

        Ok(Self {
            quantile: options.quantile,
            window,
            accumulator: prototype,
        })
    }

    pub fn quantile(&self) -> f64 {
        self.quantile
    }

    /// Sketch of everything currently inside the window
    pub fn sketch(&self) -> &QuantileSketch {
        &self.accumulator
    }

    /// Value at an arbitrary quantile of the current window
    pub fn value_at(&self, q: f64) -> f64 {
        self.accumulator.quantile(q).unwrap_or(0.0)
    }

    fn rotate(&mut self, ts: i64) {
        let accumulator = &mut self.accumulator;
        self.window.rotate(ts, |bucket| accumulator.subtract(bucket));
    }
}

impl Aggregator for QuantileAggregator {
    fn aggregator_type(&self) -> AggregatorType {
        AggregatorType::Quantile
    }

    fn count(&self) -> u64 {
        self.accumulator.count()
    }

    fn value(&self) -> f64 {
        self.value_at(self.quantile)
    }

    fn update(&mut self, value: f64, ts: i64) -> f64 {
        if value.is_nan() {
            return self.value();
        }
        self.rotate(ts);
        self.window.current_mut().add(value);
        self.accumulator.add(value);
        self.value()
    }

    fn tick(&mut self, ts: i64) -> f64 {
        self.rotate(ts);
        self.value()
    }

    fn reset(&mut self) {
        self.window.reset();
        self.accumulator.clear();
    }

    fn period(&self) -> Option<i64> {
        self.window.granularity()
    }

    fn is_full_window(&self, ts: i64) -> bool {
        self.window.is_full_window(ts)
    }
}
