//! Relative-error quantile sketch
//!
//! Values are mapped to logarithmic bins `ceil(log_gamma(|v|))` with
//! `gamma = (1 + alpha) / (1 - alpha)`, so every bin's representative value
//! is within `alpha` relative error of anything stored in it. Bins are plain
//! counters, which makes two sketches with the same `alpha` mergeable and,
//! when one is a subset of the other, subtractable.

use std::collections::BTreeMap;

use super::window::Bucket;
use super::AggregatorError;

/// Default relative accuracy
pub const DEFAULT_RELATIVE_ACCURACY: f64 = 0.005;

/// Magnitudes below this are counted in the zero bin
const MIN_INDEXABLE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct QuantileSketch {
    alpha: f64,
    gamma: f64,
    ln_gamma: f64,
    positive: BTreeMap<i32, u64>,
    negative: BTreeMap<i32, u64>,
    zero_count: u64,
    count: u64,
}

impl Default for QuantileSketch {
    fn default() -> Self {
        Self::with_accuracy(DEFAULT_RELATIVE_ACCURACY)
    }
}

impl QuantileSketch {
    /// Create a sketch with relative accuracy `alpha` in (0, 1)
    pub fn new(alpha: f64) -> Result<Self, AggregatorError> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(AggregatorError::InvalidOption {
                name: "alpha",
                reason: format!("relative accuracy must be in (0, 1), got {}", alpha),
            });
        }
        Ok(Self::with_accuracy(alpha))
    }

    fn with_accuracy(alpha: f64) -> Self {
        let gamma = (1.0 + alpha) / (1.0 - alpha);
        Self {
            alpha,
            gamma,
            ln_gamma: gamma.ln(),
            positive: BTreeMap::new(),
            negative: BTreeMap::new(),
            zero_count: 0,
            count: 0,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of non-empty bins
    pub fn bin_count(&self) -> usize {
        self.positive.len() + self.negative.len() + usize::from(self.zero_count > 0)
    }

    fn index(&self, magnitude: f64) -> i32 {
        (magnitude.ln() / self.ln_gamma).ceil() as i32
    }

    fn bin_value(&self, index: i32) -> f64 {
        2.0 * self.gamma.powi(index) / (self.gamma + 1.0)
    }

    pub fn add(&mut self, value: f64) {
        self.add_n(value, 1);
    }

    pub fn add_n(&mut self, value: f64, n: u64) {
        if value.is_nan() || n == 0 {
            return;
        }
        if value.abs() < MIN_INDEXABLE {
            self.zero_count += n;
        } else if value > 0.0 {
            let idx = self.index(value);
            *self.positive.entry(idx).or_insert(0) += n;
        } else {
            let idx = self.index(-value);
            *self.negative.entry(idx).or_insert(0) += n;
        }
        self.count += n;
    }

    /// Fold every bin of `other` into this sketch
    pub fn merge(&mut self, other: &QuantileSketch) {
        debug_assert!((self.gamma - other.gamma).abs() < f64::EPSILON);
        for (idx, n) in &other.positive {
            *self.positive.entry(*idx).or_insert(0) += n;
        }
        for (idx, n) in &other.negative {
            *self.negative.entry(*idx).or_insert(0) += n;
        }
        self.zero_count += other.zero_count;
        self.count += other.count;
    }

    /// Remove `other`'s bins from this sketch. `other` must have been
    /// merged in earlier; counts saturate at zero and empty bins are dropped.
    pub fn subtract(&mut self, other: &QuantileSketch) {
        debug_assert!((self.gamma - other.gamma).abs() < f64::EPSILON);
        subtract_bins(&mut self.positive, &other.positive);
        subtract_bins(&mut self.negative, &other.negative);
        self.zero_count = self.zero_count.saturating_sub(other.zero_count);
        self.count = self.count.saturating_sub(other.count);
    }

    /// Approximate value at quantile `q` in [0, 1]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 || q.is_nan() {
            return None;
        }

        let rank = q.clamp(0.0, 1.0) * (self.count - 1) as f64;
        let mut seen = 0u64;

        for (idx, n) in self.negative.iter().rev() {
            seen += n;
            if seen as f64 > rank {
                return Some(-self.bin_value(*idx));
            }
        }

        seen += self.zero_count;
        if seen as f64 > rank {
            return Some(0.0);
        }

        for (idx, n) in &self.positive {
            seen += n;
            if seen as f64 > rank {
                return Some(self.bin_value(*idx));
            }
        }

        self.positive
            .keys()
            .next_back()
            .map(|idx| self.bin_value(*idx))
            .or(Some(0.0))
    }

    pub fn clear(&mut self) {
        self.positive.clear();
        self.negative.clear();
        self.zero_count = 0;
        self.count = 0;
    }
}

fn subtract_bins(target: &mut BTreeMap<i32, u64>, other: &BTreeMap<i32, u64>) {
    for (idx, n) in other {
        if let Some(slot) = target.get_mut(idx) {
            *slot = slot.saturating_sub(*n);
            if *slot == 0 {
                target.remove(idx);
            }
        }
    }
}

impl Bucket for QuantileSketch {
    fn clear(&mut self) {
        QuantileSketch::clear(self);
    }
}
