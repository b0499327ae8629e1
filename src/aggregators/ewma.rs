use serde::{Deserialize, Serialize};

use super::{Aggregator, AggregatorError, AggregatorType};

/// Default interval at which rate mode folds pending samples
pub const DEFAULT_RATE_TICK_MS: i64 = 5_000;

/// Load-average style presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EwmaPreset {
    #[default]
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
}

impl EwmaPreset {
    /// Time constant of the preset in milliseconds
    pub fn window_ms(&self) -> i64 {
        match self {
            EwmaPreset::OneMinute => 60_000,
            EwmaPreset::FiveMinutes => 5 * 60_000,
            EwmaPreset::FifteenMinutes => 15 * 60_000,
        }
    }

    /// Half-life giving `exp(-t / window)` decay
    pub fn half_life_ms(&self) -> f64 {
        self.window_ms() as f64 * std::f64::consts::LN_2
    }
}

/// What the average is taken over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EwmaMode {
    /// Average of sample values
    #[default]
    Value,
    /// Average of per-second rate of summed samples
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EwmaOptions {
    pub preset: EwmaPreset,
    /// Overrides the preset when set (milliseconds)
    pub half_life: Option<i64>,
    pub mode: EwmaMode,
    /// Fold interval for rate mode (milliseconds)
    pub tick_interval: Option<i64>,
}

impl EwmaOptions {
    pub fn rate(preset: EwmaPreset) -> Self {
        Self {
            preset,
            mode: EwmaMode::Rate,
            ..Default::default()
        }
    }

    pub fn with_half_life(mut self, half_life: i64) -> Self {
        self.half_life = Some(half_life);
        self
    }
}

/// Exponentially weighted moving average for irregular arrival times.
///
/// Each blend uses `w = 2^(-elapsed / half_life)`, so the decay depends on
/// real elapsed time rather than on how many samples arrived.
#[derive(Debug, Clone)]
pub struct EwmaAggregator {
    mode: EwmaMode,
    half_life: f64,
    tick_interval: i64,
    value: f64,
    initialized: bool,
    last_ts: Option<i64>,
    pending: f64,
    count: u64,
}

impl EwmaAggregator {
    pub fn new(options: &EwmaOptions) -> Result<Self, AggregatorError> {
        let half_life = match options.half_life {
            Some(h) if h <= 0 => {
                return Err(AggregatorError::InvalidOption {
                    name: "half_life",
                    reason: format!("must be positive, got {}", h),
                })
            }
            Some(h) => h as f64,
            None => options.preset.half_life_ms(),
        };

        let tick_interval = options.tick_interval.unwrap_or(DEFAULT_RATE_TICK_MS);
        if tick_interval <= 0 {
            return Err(AggregatorError::InvalidOption {
                name: "tick_interval",
                reason: format!("must be positive, got {}", tick_interval),
            });
        }

        Ok(Self {
            mode: options.mode,
            half_life,
            tick_interval,
            value: 0.0,
            initialized: false,
            last_ts: None,
            pending: 0.0,
            count: 0,
        })
    }

    fn weight(&self, elapsed_ms: i64) -> f64 {
        2f64.powf(-(elapsed_ms.max(0) as f64) / self.half_life)
    }

    fn blend(&mut self, sample: f64, weight: f64) {
        if self.initialized {
            self.value = weight * self.value + (1.0 - weight) * sample;
        } else {
            self.value = sample;
            self.initialized = true;
        }
    }

    fn update_value(&mut self, value: f64, ts: i64) {
        let Some(last) = self.last_ts else {
            self.blend(value, 0.0);
            self.last_ts = Some(ts);
            return;
        };

        if ts >= last {
            let w = self.weight(ts - last);
            self.blend(value, w);
            self.last_ts = Some(ts);
        } else {
            // a backfilled sample counts as if it had arrived on time one
            // tick after the average, then decayed for its lateness
            let on_time = 1.0 - self.weight(self.tick_interval);
            let alpha = on_time * self.weight(last - ts);
            self.value += alpha * (value - self.value);
        }
    }

    fn fold_rate(&mut self, ts: i64) {
        let Some(last) = self.last_ts else {
            self.last_ts = Some(ts);
            return;
        };

        let elapsed = ts - last;
        if elapsed < self.tick_interval {
            return;
        }

        let instant = self.pending / (elapsed as f64 / 1000.0);
        let w = self.weight(elapsed);
        self.blend(instant, w);
        self.pending = 0.0;
        self.last_ts = Some(ts);
    }
}

impl Aggregator for EwmaAggregator {
    fn aggregator_type(&self) -> AggregatorType {
        AggregatorType::Ewma
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
        self.count += 1;
        match self.mode {
            EwmaMode::Value => self.update_value(value, ts),
            EwmaMode::Rate => {
                self.fold_rate(ts);
                self.pending += value;
            }
        }
        self.value
    }

    fn tick(&mut self, ts: i64) -> f64 {
        if self.mode == EwmaMode::Rate {
            self.fold_rate(ts);
        }
        self.value
    }

    fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
        self.last_ts = None;
        self.pending = 0.0;
        self.count = 0;
    }

    fn period(&self) -> Option<i64> {
        match self.mode {
            EwmaMode::Rate => Some(self.tick_interval),
            EwmaMode::Value => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_life_weighting() {
        let opts = EwmaOptions::default().with_half_life(1000);
        let mut agg = EwmaAggregator::new(&opts).unwrap();

        assert_eq!(agg.update(10.0, 0), 10.0);
        // one half-life later the old value and the sample weigh equally
        assert!((agg.update(20.0, 1000) - 15.0).abs() < 1e-9);
        // no time elapsed: the sample has no weight
        assert!((agg.update(100.0, 1000) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_irregular_spacing_converges() {
        let opts = EwmaOptions::default().with_half_life(1000);
        let mut agg = EwmaAggregator::new(&opts).unwrap();
        agg.update(0.0, 0);

        let mut ts = 0;
        for gap in [10, 500, 3, 2000, 70, 900, 4000] {
            ts += gap;
            agg.update(50.0, ts);
        }
        assert!(agg.value() > 45.0 && agg.value() <= 50.0);
    }

    #[test]
    fn test_backfilled_sample_has_reduced_weight() {
        let opts = EwmaOptions::default().with_half_life(1000);
        let mut agg = EwmaAggregator::new(&opts).unwrap();
        agg.update(10.0, 10_000);

        let before = agg.value();
        agg.update(110.0, 9_000);
        let late_shift = agg.value() - before;

        let mut fresh = EwmaAggregator::new(&opts).unwrap();
        fresh.update(10.0, 10_000);
        fresh.update(110.0, 10_000 + DEFAULT_RATE_TICK_MS);
        let on_time_shift = fresh.value() - 10.0;

        assert!(late_shift > 0.0);
        assert!(late_shift < on_time_shift);
    }

    #[test]
    fn test_rate_mode() {
        let opts = EwmaOptions::rate(EwmaPreset::OneMinute);
        let mut agg = EwmaAggregator::new(&opts).unwrap();
        assert_eq!(agg.period(), Some(DEFAULT_RATE_TICK_MS));

        // 10 events per second for the first fold
        for i in 0..50 {
            agg.update(1.0, i * 100);
        }
        assert_eq!(agg.tick(5_000), 10.0);

        // silence decays the rate toward zero
        let decayed = agg.tick(10_000);
        assert!(decayed < 10.0 && decayed > 0.0);
    }

    #[test]
    fn test_invalid_half_life() {
        let opts = EwmaOptions::default().with_half_life(0);
        assert!(EwmaAggregator::new(&opts).is_err());
    }
}
