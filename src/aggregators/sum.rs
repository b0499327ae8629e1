use super::window::{Bucket, SlidingWindow, WindowOptions};
use super::{Aggregator, AggregatorError, AggregatorType};

#[derive(Debug, Clone, Default)]
struct SumBucket {
    sum: f64,
    count: u64,
}

impl Bucket for SumBucket {
    fn clear(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Windowed SUM, O(1) per update and per eviction
#[derive(Debug, Clone)]
pub struct SumAggregator {
    window: SlidingWindow<SumBucket>,
    sum: f64,
    count: u64,
}

impl SumAggregator {
    pub fn new(options: &WindowOptions) -> Result<Self, AggregatorError> {
        Ok(Self {
            window: SlidingWindow::from_options(options, SumBucket::default)?,
            sum: 0.0,
            count: 0,
        })
    }

    fn rotate(&mut self, ts: i64) {
        let mut sum = 0.0;
        let mut count = 0;
        self.window.rotate(ts, |bucket| {
            sum += bucket.sum;
            count += bucket.count;
        });

        self.count -= count;
        if self.count == 0 {
            // avoid carrying float residue into an empty window
            self.sum = 0.0;
        } else {
            self.sum -= sum;
        }
    }
}

impl Aggregator for SumAggregator {
    fn aggregator_type(&self) -> AggregatorType {
        AggregatorType::Sum
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn value(&self) -> f64 {
        self.sum
    }

    fn update(&mut self, value: f64, ts: i64) -> f64 {
        if value.is_nan() {
            return self.sum;
        }
        self.rotate(ts);

        let bucket = self.window.current_mut();
        bucket.sum += value;
        bucket.count += 1;

        self.sum += value;
        self.count += 1;
        self.sum
    }

    fn tick(&mut self, ts: i64) -> f64 {
        self.rotate(ts);
        self.sum
    }

    fn reset(&mut self) {
        self.window.reset();
        self.sum = 0.0;
        self.count = 0;
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

    #[test]
    fn test_sum_over_last_buckets() {
        let mut agg = SumAggregator::new(&WindowOptions::new(400).with_granularity(100)).unwrap();

        for i in 0..20 {
            let got = agg.update(i as f64, i * 100);
            let start = (i - 3).max(0);
            let expected: f64 = (start..=i).map(|v| v as f64).sum();
            assert_eq!(got, expected);
        }
        assert_eq!(agg.count(), 4);
    }

    #[test]
    fn test_multiple_samples_per_bucket() {
        let mut agg = SumAggregator::new(&WindowOptions::new(200).with_granularity(100)).unwrap();
        agg.update(1.0, 0);
        agg.update(2.0, 50);
        agg.update(3.0, 120);
        assert_eq!(agg.value(), 6.0);

        // first bucket drops out
        assert_eq!(agg.tick(210), 3.0);
        assert_eq!(agg.tick(1000), 0.0);
    }

    #[test]
    fn test_reset() {
        let mut agg = SumAggregator::new(&WindowOptions::new(200)).unwrap();
        agg.update(5.0, 0);
        agg.reset();
        assert_eq!(agg.value(), 0.0);
        assert_eq!(agg.count(), 0);
        assert!(!agg.is_full_window(0));
    }
}
