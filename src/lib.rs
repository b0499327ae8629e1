//! queuewatch: metrics and alerting for background job queues
//!
//! Streams job lifecycle events into windowed metrics, evaluates rules
//! against the metric values and drives a debounced alert lifecycle per
//! rule.
//!
//! # Features
//!
//! - **Sliding-window aggregators**: latest, max, min, sum, mean, stddev,
//!   EWMA, quantile (mergeable log-bucket sketch) and period-over-period change
//! - **Conditions**: threshold, smoothed z-score peak detection and change
//! - **Circuit-breaker alerting**: failure threshold, warmup, recovery window,
//!   re-notification throttle and a shared-store atomic transition
//! - **Ordered ingestion**: per-metric lanes with bounded global concurrency
//!
//! # Example
//!
//! ```no_run
//! use queuewatch::alerts::Rule;
//! use queuewatch::conditions::{CompareOp, Condition};
//! use queuewatch::metrics::{JobEvent, JobRef, MetricConfig, MetricType};
//! use queuewatch::{Engine, EngineConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(EngineConfig::default());
//! engine
//!     .add_metric(MetricConfig::new("latency", "Latency", MetricType::Latency))
//!     .await?;
//! engine
//!     .rules()
//!     .create(Rule::new("slow", "Slow jobs", "latency", Condition::threshold(CompareOp::Gt, 500.0)))
//!     .await?;
//!
//! engine
//!     .submit(JobEvent::completed(JobRef::new("42", "email", 0), 1_000, 750.0, 20.0))
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod aggregators;
pub mod alerts;
pub mod bus;
pub mod clock;
pub mod conditions;
pub mod config;
pub mod engine;
pub mod ingest;
pub mod metrics;
pub mod storage;

// Re-export commonly used types
pub use bus::{EngineEvent, EventBus};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{Engine, EngineError};
