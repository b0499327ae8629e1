use super::window::{Bucket, SlidingWindow, WindowOptions};
use super::{Aggregator, AggregatorError, AggregatorType};

/// Statistic exposed by a [`MomentsAggregator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Moment {
    Mean,
    StdDev,
}

/// Running `(count, sum, sum of squares)` triple
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
}

impl Moments {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn add(&mut self, other: &Moments) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
    }

    pub fn subtract(&mut self, other: &Moments) {
        self.count = self.count.saturating_sub(other.count);
        if self.count == 0 {
            *self = Moments::default();
        } else {
            self.sum -= other.sum;
            self.sum_sq -= other.sum_sq;
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Population variance
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_sq / self.count as f64 - mean * mean).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

impl Bucket for Moments {
    fn clear(&mut self) {
        *self = Moments::default();
    }
}

/// Windowed MEAN / STDDEV over per-bucket moment triples
#[derive(Debug, Clone)]
pub struct MomentsAggregator {
    output: Moment,
    window: SlidingWindow<Moments>,
    total: Moments,
}

impl MomentsAggregator {
    pub fn new(output: Moment, options: &WindowOptions) -> Result<Self, AggregatorError> {
        Ok(Self {
            output,
            window: SlidingWindow::from_options(options, Moments::default)?,
            total: Moments::default(),
        })
    }

    pub fn mean(options: &WindowOptions) -> Result<Self, AggregatorError> {
        Self::new(Moment::Mean, options)
    }

    pub fn std_dev(options: &WindowOptions) -> Result<Self, AggregatorError> {
        Self::new(Moment::StdDev, options)
    }

    /// Current window moments
    pub fn moments(&self) -> Moments {
        self.total
    }

    fn rotate(&mut self, ts: i64) {
        let mut evicted = Moments::default();
        self.window.rotate(ts, |bucket| evicted.add(bucket));
        self.total.subtract(&evicted);
    }
}

impl Aggregator for MomentsAggregator {
    fn aggregator_type(&self) -> AggregatorType {
        match self.output {
            Moment::Mean => AggregatorType::Mean,
            Moment::StdDev => AggregatorType::StdDev,
        }
    }

    fn count(&self) -> u64 {
        self.total.count
    }

    fn value(&self) -> f64 {
        match self.output {
            Moment::Mean => self.total.mean(),
            Moment::StdDev => self.total.std_dev(),
        }
    }

    fn update(&mut self, value: f64, ts: i64) -> f64 {
        if value.is_nan() {
            return self.value();
        }
        self.rotate(ts);
        self.window.current_mut().push(value);
        self.total.push(value);
        self.value()
    }

    fn tick(&mut self, ts: i64) -> f64 {
        self.rotate(ts);
        self.value()
    }

    fn reset(&mut self) {
        self.window.reset();
        self.total = Moments::default();
    }

    fn period(&self) -> Option<i64> {
        self.window.granularity()
    }

    fn is_full_window(&self, ts: i64) -> bool {
        self.window.is_full_window(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_mean_and_std_dev() {
        let opts = WindowOptions::unbounded();
        let mut mean = MomentsAggregator::mean(&opts).unwrap();
        let mut std = MomentsAggregator::std_dev(&opts).unwrap();

        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            mean.update(v, 0);
            std.update(v, 0);
        }

        assert!(close(mean.value(), 5.0));
        assert!(close(std.value(), 2.0));
    }

    #[test]
    fn test_eviction_subtracts_bucket() {
        let opts = WindowOptions::new(300).with_granularity(100);
        let mut agg = MomentsAggregator::mean(&opts).unwrap();

        agg.update(100.0, 0);
        agg.update(1.0, 100);
        agg.update(2.0, 200);
        agg.update(3.0, 300);

        assert!(close(agg.value(), 2.0));
        assert_eq!(agg.count(), 3);
    }

    #[test]
    fn test_empty_window_is_zero() {
        let opts = WindowOptions::new(300).with_granularity(100);
        let mut agg = MomentsAggregator::std_dev(&opts).unwrap();
        agg.update(4.0, 0);
        agg.update(8.0, 50);
        assert!(close(agg.value(), 2.0));

        assert_eq!(agg.tick(10_000), 0.0);
        assert_eq!(agg.moments(), Moments::default());
    }
}
