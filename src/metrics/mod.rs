//! Metrics over job lifecycle events
//!
//! A metric turns one kind of job event into samples, folds them through its
//! aggregator and hands every resulting value to its listeners.

pub mod event;
pub mod metric;
pub mod registry;

pub use event::{JobEvent, JobEventKind, JobRef};
pub use metric::{Metric, MetricConfig, MetricType, MetricUpdate};
pub use registry::{MetricHandle, MetricListener, MetricRegistry, Subscription};

use crate::aggregators::AggregatorError;

/// Metric errors
#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("Metric not found: {0}")]
    NotFound(String),

    #[error("Metric already exists: {0}")]
    Duplicate(String),

    #[error("Invalid job name filter: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error("Invalid aggregator: {0}")]
    Aggregator(#[from] AggregatorError),

    #[error("Invalid metric: {0}")]
    Validation(String),
}
