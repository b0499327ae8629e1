//! Streaming aggregators
//!
//! Every aggregator folds `(value, ts)` samples into a single current value.
//! Windowed variants share the bucket rotation in [`window`]; concrete
//! instances are created from a serde-tagged [`AggregatorConfig`] through the
//! [`AggregatorRegistry`].

pub mod change;
pub mod ewma;
pub mod extremum;
pub mod latest;
pub mod moments;
pub mod quantile;
pub mod sketch;
pub mod sum;
pub mod window;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use change::{ChangeAggregation, ChangeAggregator, ChangeOptions};
pub use ewma::{EwmaAggregator, EwmaMode, EwmaOptions, EwmaPreset};
pub use extremum::{Extremum, ExtremumAggregator};
pub use latest::LatestAggregator;
pub use moments::{Moment, Moments, MomentsAggregator};
pub use quantile::{QuantileAggregator, QuantileOptions};
pub use sketch::QuantileSketch;
pub use sum::SumAggregator;
pub use window::{Bucket, SlidingWindow, WindowOptions, WindowSpec};

/// Stateful reducer over a stream of numeric samples
pub trait Aggregator: Send + Sync + fmt::Debug {
    fn aggregator_type(&self) -> AggregatorType;

    /// Number of samples currently contributing to the value
    fn count(&self) -> u64;

    /// Current value
    fn value(&self) -> f64;

    /// Fold a sample observed at `ts` and return the new value
    fn update(&mut self, value: f64, ts: i64) -> f64;

    /// Advance time to `ts` without a sample, evicting expired buckets
    fn tick(&mut self, ts: i64) -> f64;

    fn reset(&mut self);

    /// Interval at which the aggregator wants to be ticked, if any
    fn period(&self) -> Option<i64>;

    /// Whether a complete window of data has been observed by `ts`
    fn is_full_window(&self, _ts: i64) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorType {
    Latest,
    Max,
    Min,
    Sum,
    Mean,
    StdDev,
    Ewma,
    Quantile,
    Change,
}

impl AggregatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregatorType::Latest => "latest",
            AggregatorType::Max => "max",
            AggregatorType::Min => "min",
            AggregatorType::Sum => "sum",
            AggregatorType::Mean => "mean",
            AggregatorType::StdDev => "std_dev",
            AggregatorType::Ewma => "ewma",
            AggregatorType::Quantile => "quantile",
            AggregatorType::Change => "change",
        }
    }
}

impl fmt::Display for AggregatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregator definition as stored with a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregatorConfig {
    Latest,
    Max(WindowOptions),
    Min(WindowOptions),
    Sum(WindowOptions),
    Mean(WindowOptions),
    StdDev(WindowOptions),
    Ewma(EwmaOptions),
    Quantile(QuantileOptions),
    Change(ChangeOptions),
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig::Latest
    }
}

impl AggregatorConfig {
    pub fn aggregator_type(&self) -> AggregatorType {
        match self {
            AggregatorConfig::Latest => AggregatorType::Latest,
            AggregatorConfig::Max(_) => AggregatorType::Max,
            AggregatorConfig::Min(_) => AggregatorType::Min,
            AggregatorConfig::Sum(_) => AggregatorType::Sum,
            AggregatorConfig::Mean(_) => AggregatorType::Mean,
            AggregatorConfig::StdDev(_) => AggregatorType::StdDev,
            AggregatorConfig::Ewma(_) => AggregatorType::Ewma,
            AggregatorConfig::Quantile(_) => AggregatorType::Quantile,
            AggregatorConfig::Change(_) => AggregatorType::Change,
        }
    }

    /// Window options of windowed variants
    pub fn window_options(&self) -> Option<WindowOptions> {
        match self {
            AggregatorConfig::Max(w)
            | AggregatorConfig::Min(w)
            | AggregatorConfig::Sum(w)
            | AggregatorConfig::Mean(w)
            | AggregatorConfig::StdDev(w) => Some(*w),
            AggregatorConfig::Quantile(q) => Some(q.window_options()),
            _ => None,
        }
    }
}

/// Aggregator errors
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    #[error("Invalid option '{name}': {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("No factory registered for aggregator type '{0}'")]
    Unsupported(AggregatorType),
}

pub type AggregatorFactory = fn(&AggregatorConfig) -> Result<Box<dyn Aggregator>, AggregatorError>;

/// Maps aggregator type tags to their factories
#[derive(Clone)]
pub struct AggregatorRegistry {
    factories: HashMap<AggregatorType, AggregatorFactory>,
}

impl fmt::Debug for AggregatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AggregatorRegistry {
    /// Registry without any factories
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register or replace the factory for a type
    pub fn register(&mut self, kind: AggregatorType, factory: AggregatorFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn contains(&self, kind: AggregatorType) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn create(&self, config: &AggregatorConfig) -> Result<Box<dyn Aggregator>, AggregatorError> {
        let kind = config.aggregator_type();
        let factory = self
            .factories
            .get(&kind)
            .ok_or(AggregatorError::Unsupported(kind))?;
        factory(config)
    }
}

impl Default for AggregatorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(AggregatorType::Latest, create_aggregator);
        registry.register(AggregatorType::Max, create_aggregator);
        registry.register(AggregatorType::Min, create_aggregator);
        registry.register(AggregatorType::Sum, create_aggregator);
        registry.register(AggregatorType::Mean, create_aggregator);
        registry.register(AggregatorType::StdDev, create_aggregator);
        registry.register(AggregatorType::Ewma, create_aggregator);
        registry.register(AggregatorType::Quantile, create_aggregator);
        registry.register(AggregatorType::Change, create_aggregator);
        registry
    }
}

/// Build the built-in aggregator described by `config`
pub fn create_aggregator(config: &AggregatorConfig) -> Result<Box<dyn Aggregator>, AggregatorError> {
    let aggregator: Box<dyn Aggregator> = match config {
        AggregatorConfig::Latest => Box::new(LatestAggregator::new()),
        AggregatorConfig::Max(w) => Box::new(ExtremumAggregator::max(w)?),
        AggregatorConfig::Min(w) => Box::new(ExtremumAggregator::min(w)?),
        AggregatorConfig::Sum(w) => Box::new(SumAggregator::new(w)?),
        AggregatorConfig::Mean(w) => Box::new(MomentsAggregator::mean(w)?),
        AggregatorConfig::StdDev(w) => Box::new(MomentsAggregator::std_dev(w)?),
        AggregatorConfig::Ewma(opts) => Box::new(EwmaAggregator::new(opts)?),
        AggregatorConfig::Quantile(opts) => Box::new(QuantileAggregator::new(opts)?),
        AggregatorConfig::Change(opts) => Box::new(ChangeAggregator::new(opts)?),
    };
    Ok(aggregator)
}
