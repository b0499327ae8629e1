//! Bucketed sliding window shared by the windowed aggregators

use serde::{Deserialize, Serialize};

use super::AggregatorError;

/// Bucket count used when only a window size is configured
pub const DEFAULT_BUCKET_COUNT: i64 = 60;
/// Upper bound on buckets per window, bounds memory and rotation cost
pub const MAX_BUCKET_COUNT: i64 = 1000;

/// Partial aggregate held by one bucket of a sliding window
pub trait Bucket {
    /// Empty the bucket so it can be reused for a new time slice
    fn clear(&mut self);
}

/// User-facing window configuration (milliseconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowOptions {
    /// Window duration. `None` aggregates over the whole stream.
    pub window: Option<i64>,
    /// Bucket duration. Defaults to `window / 60`.
    pub granularity: Option<i64>,
}

impl WindowOptions {
    pub fn new(window: i64) -> Self {
        Self {
            window: Some(window),
            granularity: None,
        }
    }

    /// Aggregate over the whole stream without eviction
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_granularity(mut self, granularity: i64) -> Self {
        self.granularity = Some(granularity);
        self
    }

    /// Validate and resolve into a concrete bucket layout
    pub fn resolve(&self) -> Result<Option<WindowSpec>, AggregatorError> {
        let Some(window) = self.window else {
            return Ok(None);
        };

        if window <= 0 {
            return Err(AggregatorError::InvalidWindow(format!(
                "window must be positive, got {}",
                window
            )));
        }

        let granularity = self
            .granularity
            .unwrap_or_else(|| (window / DEFAULT_BUCKET_COUNT).max(1));

        if granularity <= 0 || granularity > window {
            return Err(AggregatorError::InvalidWindow(format!(
                "granularity {} must be in (0, {}]",
                granularity, window
            )));
        }

        let buckets = (window + granularity - 1) / granularity;
        if buckets > MAX_BUCKET_COUNT {
            return Err(AggregatorError::InvalidWindow(format!(
                "window {} / granularity {} gives {} buckets (max {})",
                window, granularity, buckets, MAX_BUCKET_COUNT
            )));
        }

        Ok(Some(WindowSpec {
            window,
            granularity,
            buckets: buckets as usize,
        }))
    }
}

/// Resolved bucket layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub window: i64,
    pub granularity: i64,
    pub buckets: usize,
}

/// Ring of time-sliced buckets.
///
/// The current bucket sits at `head`. Rotation walks `head` forward one slot
/// per elapsed granularity step; the slot it lands on is the oldest bucket,
/// which is handed to the eviction callback and then cleared for reuse.
#[derive(Debug, Clone)]
pub struct SlidingWindow<B> {
    buckets: Vec<B>,
    spec: Option<WindowSpec>,
    head: usize,
    /// Start of the current bucket's time slice
    bucket_start: Option<i64>,
    first_ts: Option<i64>,
}

impl<B: Bucket> SlidingWindow<B> {
    /// Build a window whose buckets come from `make_bucket`
    pub fn with_factory(spec: Option<WindowSpec>, make_bucket: impl Fn() -> B) -> Self {
        let count = spec.map(|s| s.buckets).unwrap_or(1);
        Self {
            buckets: (0..count).map(|_| make_bucket()).collect(),
            spec,
            head: 0,
            bucket_start: None,
            first_ts: None,
        }
    }

    pub fn from_options(
        options: &WindowOptions,
        make_bucket: impl Fn() -> B,
    ) -> Result<Self, AggregatorError> {
        Ok(Self::with_factory(options.resolve()?, make_bucket))
    }

    /// Window duration, `None` when unbounded
    pub fn window(&self) -> Option<i64> {
        self.spec.map(|s| s.window)
    }

    /// Bucket duration, `None` when unbounded
    pub fn granularity(&self) -> Option<i64> {
        self.spec.map(|s| s.granularity)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn current_mut(&mut self) -> &mut B {
        &mut self.buckets[self.head]
    }

    /// All live buckets (order is not chronological)
    pub fn buckets(&self) -> impl Iterator<Item = &B> {
        self.buckets.iter()
    }

    /// Advance to the bucket covering `now`, evicting buckets that fell out
    /// of the window. Returns the number of buckets evicted.
    pub fn rotate(&mut self, now: i64, mut evict: impl FnMut(&mut B)) -> usize {
        if self.first_ts.map_or(true, |f| now < f) {
            self.first_ts = Some(now);
        }

        let Some(spec) = self.spec else {
            return 0;
        };

        let Some(start) = self.bucket_start else {
            self.bucket_start = Some(now - now.rem_euclid(spec.granularity));
            return 0;
        };

        if now - start < spec.granularity {
            return 0;
        }

        let steps = (now - start) / spec.granularity;
        let evictions = steps.min(self.buckets.len() as i64) as usize;
        let len = self.buckets.len();

        for _ in 0..evictions {
            self.head = (self.head + 1) % len;
            let bucket = &mut self.buckets[self.head];
            evict(bucket);
            bucket.clear();
        }

        self.bucket_start = Some(start + steps * spec.granularity);
        evictions
    }

    /// Whether at least one full window has elapsed since the first sample
    pub fn is_full_window(&self, now: i64) -> bool {
        match (self.spec, self.first_ts) {
            (None, _) => true,
            (Some(spec), Some(first)) => now - first >= spec.window,
            (Some(_), None) => false,
        }
    }

    pub fn reset(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.head = 0;
        self.bucket_start = None;
        self.first_ts = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Tally(u32);

    impl Bucket for Tally {
        fn clear(&mut self) {
            self.0 = 0;
        }
    }

    #[test]
    fn test_resolve_defaults() {
        let spec = WindowOptions::new(60_000).resolve().unwrap().unwrap();
        assert_eq!(spec.granularity, 1000);
        assert_eq!(spec.buckets, 60);

        assert!(WindowOptions::unbounded().resolve().unwrap().is_none());
    }

    #[test]
    fn test_resolve_rejects_bad_layouts() {
        assert!(WindowOptions::new(0).resolve().is_err());
        assert!(WindowOptions::new(1000).with_granularity(2000).resolve().is_err());
        assert!(WindowOptions::new(1_000_000).with_granularity(1).resolve().is_err());
    }

    #[test]
    fn test_rotation_evicts_oldest() {
        let spec = WindowOptions::new(300).with_granularity(100).resolve().unwrap();
        let mut window = SlidingWindow::with_factory(spec, Tally::default);

        let mut evicted = Vec::new();
        for (i, ts) in [0, 100, 200, 300, 400].into_iter().enumerate() {
            window.rotate(ts, |b| evicted.push(b.0));
            window.current_mut().0 = i as u32 + 1;
        }

        // buckets 1 and 2 were pushed out by the 4th and 5th slices
        assert_eq!(evicted, vec![0, 0, 1, 2]);
        let mut live: Vec<u32> = window.buckets().map(|b| b.0).collect();
        live.sort();
        assert_eq!(live, vec![3, 4, 5]);
    }

    #[test]
    fn test_idle_gap_clears_everything() {
        let spec = WindowOptions::new(300).with_granularity(100).resolve().unwrap();
        let mut window = SlidingWindow::with_factory(spec, Tally::default);

        window.rotate(0, |_| {});
        window.current_mut().0 = 7;
        let evicted = window.rotate(10_000, |_| {});

        assert_eq!(evicted, 3);
        assert!(window.buckets().all(|b| b.0 == 0));
    }

    #[test]
    fn test_full_window() {
        let spec = WindowOptions::new(300).with_granularity(100).resolve().unwrap();
        let mut window = SlidingWindow::with_factory(spec, Tally::default);
        assert!(!window.is_full_window(0));

        window.rotate(1000, |_| {});
        assert!(!window.is_full_window(1200));
        assert!(window.is_full_window(1300));
    }
}
