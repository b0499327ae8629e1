//! Metric definition and state

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::event::{JobEvent, JobEventKind};
use super::MetricError;
use crate::aggregators::{Aggregator, AggregatorConfig, AggregatorRegistry};

/// What a metric measures from the job event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Processing time of completed jobs
    Latency,
    /// Queue wait of completed and failed jobs
    Wait,
    CompletedCount,
    FailedCount,
    FinishedCount,
    /// 1 for every failed finish, 0 for every successful one
    ErrorRate,
}

impl MetricType {
    /// Sample this metric takes from `event`, if any
    pub fn sample(&self, event: &JobEvent) -> Option<f64> {
        match (self, event.kind) {
            (MetricType::Latency, JobEventKind::Completed) => event.latency,
            (MetricType::Wait, JobEventKind::Completed | JobEventKind::Failed) => event.wait,
            (MetricType::CompletedCount, JobEventKind::Completed) => Some(1.0),
            (MetricType::FailedCount, JobEventKind::Failed) => Some(1.0),
            (MetricType::FinishedCount, JobEventKind::Finished) => Some(1.0),
            (MetricType::ErrorRate, JobEventKind::Finished) => {
                Some(if event.success { 0.0 } else { 1.0 })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
    pub id: String,
    pub name: String,
    pub metric_type: MetricType,
    /// Regex a job name must match for its events to count
    #[serde(default)]
    pub job_names: Option<String>,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: i64,
}

impl MetricConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            metric_type,
            job_names: None,
            aggregator: AggregatorConfig::Latest,
            description: String::new(),
            created_at: 0,
        }
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_job_filter(mut self, pattern: impl Into<String>) -> Self {
        self.job_names = Some(pattern.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Value produced by a metric after an event or a tick
#[derive(Debug, Clone, PartialEq)]
pub struct MetricUpdate {
    pub metric_id: String,
    pub value: f64,
    pub previous: f64,
    pub ts: i64,
}

/// Aggregated view of one job event stream
#[derive(Debug)]
pub struct Metric {
    config: MetricConfig,
    job_filter: Option<Regex>,
    aggregator: Box<dyn Aggregator>,
    value: f64,
    last_changed_at: Option<i64>,
}

impl Metric {
    pub fn new(config: MetricConfig, aggregators: &AggregatorRegistry) -> Result<Self, MetricError> {
        if config.id.trim().is_empty() {
            return Err(MetricError::Validation("id must not be empty".to_string()));
        }
        let job_filter = config.job_names.as_deref().map(Regex::new).transpose()?;
        let aggregator = aggregators.create(&config.aggregator)?;

        Ok(Self {
            config,
            job_filter,
            aggregator,
            value: 0.0,
            last_changed_at: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &MetricConfig {
        &self.config
    }

    pub fn metric_type(&self) -> MetricType {
        self.config.metric_type
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn count(&self) -> u64 {
        self.aggregator.count()
    }

    pub fn created_at(&self) -> i64 {
        self.config.created_at
    }

    pub fn last_changed_at(&self) -> Option<i64> {
        self.last_changed_at
    }

    /// Tick period requested by the aggregator
    pub fn period(&self) -> Option<i64> {
        self.aggregator.period()
    }

    pub fn accepts(&self, event: &JobEvent) -> bool {
        self.sample_for(event).is_some()
    }

    /// Sample this metric takes from `event`, if the event applies
    fn sample_for(&self, event: &JobEvent) -> Option<f64> {
        let sample = self.config.metric_type.sample(event)?;
        let matches = self
            .job_filter
            .as_ref()
            .map_or(true, |filter| filter.is_match(&event.job.name));
        matches.then_some(sample)
    }

    /// Fold an event. Returns `None` when the event does not apply.
    pub fn handle_event(&mut self, event: &JobEvent) -> Option<MetricUpdate> {
        let sample = self.sample_for(event)?;
        let value = self.aggregator.update(sample, event.ts);
        Some(self.record(value, event.ts))
    }

    /// Advance the aggregator to `ts`. Returns an update only if the value moved.
    pub fn tick(&mut self, ts: i64) -> Option<MetricUpdate> {
        let value = self.aggregator.tick(ts);
        if value == self.value {
            return None;
        }
        Some(self.record(value, ts))
    }

    pub fn reset(&mut self) {
        self.aggregator.reset();
        self.value = 0.0;
        self.last_changed_at = None;
    }

    fn record(&mut self, value: f64, ts: i64) -> MetricUpdate {
        let previous = self.value;
        if value != previous {
            self.last_changed_at = Some(ts);
        }
        self.value = value;
        MetricUpdate {
            metric_id: self.config.id.clone(),
            value,
            previous,
            ts,
        }
    }
}
