//! Engine event bus

use serde::Serialize;
use tokio::sync::broadcast;

use crate::alerts::{RuleAlert, RuleState};

/// Default number of buffered events per subscriber
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    RuleStateChanged {
        rule_id: String,
        state: RuleState,
        ts: i64,
    },
    AlertTriggered {
        alert: RuleAlert,
    },
    AlertReset {
        alert: RuleAlert,
    },
    MetricAdded {
        metric_id: String,
    },
    MetricUpdated {
        metric_id: String,
        value: f64,
        ts: i64,
    },
    MetricDeleted {
        metric_id: String,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::RuleStateChanged { .. } => "rule.state_changed",
            EngineEvent::AlertTriggered { .. } => "alert.triggered",
            EngineEvent::AlertReset { .. } => "alert.reset",
            EngineEvent::MetricAdded { .. } => "metric.added",
            EngineEvent::MetricUpdated { .. } => "metric.updated",
            EngineEvent::MetricDeleted { .. } => "metric.deleted",
        }
    }
}

/// Broadcast fan-out of [`EngineEvent`]s. Publishing never blocks; slow
/// subscribers lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers, returns how many received it
    pub fn publish(&self, event: EngineEvent) -> usize {
        tracing::trace!(event = event.name(), "Publishing engine event");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
