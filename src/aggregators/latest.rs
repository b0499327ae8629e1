use super::{Aggregator, AggregatorType};

/// Passes the most recent sample through unchanged
#[derive(Debug, Clone, Default)]
pub struct LatestAggregator {
    value: Option<f64>,
    last_ts: Option<i64>,
    count: u64,
}

impl LatestAggregator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Aggregator for LatestAggregator {
    fn aggregator_type(&self) -> AggregatorType {
        AggregatorType::Latest
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }

    fn update(&mut self, value: f64, ts: i64) -> f64 {
        self.count += 1;
        // late samples never replace a newer one
        if !value.is_nan() && self.last_ts.map_or(true, |last| ts >= last) {
            self.value = Some(value);
            self.last_ts = Some(ts);
        }
        self.value()
    }

    fn tick(&mut self, _ts: i64) -> f64 {
        self.value()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn period(&self) -> Option<i64> {
        None
    }
}
