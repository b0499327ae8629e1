//! Live metrics and their listeners

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::event::JobEvent;
use super::metric::{Metric, MetricConfig, MetricUpdate};
use super::MetricError;
use crate::aggregators::AggregatorRegistry;
use crate::bus::{EngineEvent, EventBus};

/// Receives every update of a metric it is subscribed to
#[async_trait]
pub trait MetricListener: Send + Sync {
    async fn on_update(&self, update: &MetricUpdate);
}

/// Shared handle to one metric and its listeners
pub struct MetricHandle {
    id: String,
    metric: Mutex<Metric>,
    listeners: RwLock<Vec<(u64, Arc<dyn MetricListener>)>>,
    next_listener: AtomicU64,
    bus: EventBus,
}

impl std::fmt::Debug for MetricHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricHandle")
            .field("id", &self.id)
            .field("value", &self.value())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl MetricHandle {
    fn new(metric: Metric, bus: EventBus) -> Self {
        Self {
            id: metric.id().to_string(),
            metric: Mutex::new(metric),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            bus,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> f64 {
        self.metric.lock().value()
    }

    pub fn config(&self) -> MetricConfig {
        self.metric.lock().config().clone()
    }

    pub fn period(&self) -> Option<i64> {
        self.metric.lock().period()
    }

    pub fn last_changed_at(&self) -> Option<i64> {
        self.metric.lock().last_changed_at()
    }

    pub fn accepts(&self, event: &JobEvent) -> bool {
        self.metric.lock().accepts(event)
    }

    pub fn reset(&self) {
        self.metric.lock().reset();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Register `listener`; it stays attached until the returned guard drops
    pub fn subscribe(self: &Arc<Self>, listener: Arc<dyn MetricListener>) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        Subscription {
            handle: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.write().retain(|(listener_id, _)| *listener_id != id);
    }

    /// Fold an event and wait for every listener to handle the update
    pub async fn process_event(&self, event: &JobEvent) -> Option<f64> {
        let update = self.metric.lock().handle_event(event)?;
        let value = update.value;
        self.notify(&update).await;
        Some(value)
    }

    /// Advance the aggregator; listeners run only if the value changed
    pub async fn process_tick(&self, ts: i64) -> Option<f64> {
        let update = self.metric.lock().tick(ts)?;
        let value = update.value;
        self.notify(&update).await;
        Some(value)
    }

    async fn notify(&self, update: &MetricUpdate) {
        self.bus.publish(EngineEvent::MetricUpdated {
            metric_id: update.metric_id.clone(),
            value: update.value,
            ts: update.ts,
        });

        let listeners: Vec<Arc<dyn MetricListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        futures::future::join_all(listeners.iter().map(|l| l.on_update(update))).await;
    }
}

/// Detaches a listener from its metric when dropped
#[derive(Debug)]
pub struct Subscription {
    handle: Weak<MetricHandle>,
    id: u64,
}

impl Subscription {
    pub fn metric_id(&self) -> Option<String> {
        self.handle.upgrade().map(|h| h.id().to_string())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.upgrade() {
            handle.unsubscribe(self.id);
        }
    }
}

/// All live metrics keyed by id
pub struct MetricRegistry {
    metrics: DashMap<String, Arc<MetricHandle>>,
    aggregators: AggregatorRegistry,
    bus: EventBus,
}

impl MetricRegistry {
    pub fn new(aggregators: AggregatorRegistry, bus: EventBus) -> Self {
        Self {
            metrics: DashMap::new(),
            aggregators,
            bus,
        }
    }

    pub fn add(&self, config: MetricConfig) -> Result<Arc<MetricHandle>, MetricError> {
        if self.metrics.contains_key(&config.id) {
            return Err(MetricError::Duplicate(config.id));
        }
        let metric = Metric::new(config, &self.aggregators)?;
        let handle = Arc::new(MetricHandle::new(metric, self.bus.clone()));
        self.metrics.insert(handle.id().to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    pub fn remove(&self, id: &str) -> Result<Arc<MetricHandle>, MetricError> {
        self.metrics
            .remove(id)
            .map(|(_, handle)| handle)
            .ok_or_else(|| MetricError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<Arc<MetricHandle>, MetricError> {
        self.metrics
            .get(id)
            .map(|h| Arc::clone(&h))
            .ok_or_else(|| MetricError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.metrics.contains_key(id)
    }

    pub fn list(&self) -> Vec<Arc<MetricHandle>> {
        self.metrics.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Metrics that take a sample from `event`
    pub fn matching(&self, event: &JobEvent) -> Vec<Arc<MetricHandle>> {
        self.metrics
            .iter()
            .filter(|e| e.value().accepts(event))
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Tick periods of every metric that wants ticks
    pub fn periods(&self) -> Vec<i64> {
        self.metrics.iter().filter_map(|e| e.value().period()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::event::JobRef;
    use crate::metrics::metric::MetricType;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetricListener for Counting {
        async fn on_update(&self, _update: &MetricUpdate) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry() -> MetricRegistry {
        MetricRegistry::new(AggregatorRegistry::default(), EventBus::default())
    }

    fn completed(ts: i64) -> JobEvent {
        JobEvent::completed(JobRef::new("j", "email", 0), ts, 5.0, 1.0)
    }

    #[test]
    fn test_add_get_remove() {
        let registry = registry();
        registry
            .add(MetricConfig::new("m1", "Latency", MetricType::Latency))
            .unwrap();

        assert!(matches!(
            registry.add(MetricConfig::new("m1", "again", MetricType::Wait)),
            Err(MetricError::Duplicate(_))
        ));
        assert!(registry.get("m1").is_ok());
        assert!(registry.remove("m1").is_ok());
        assert!(matches!(registry.get("m1"), Err(MetricError::NotFound(_))));
    }

    #[test]
    fn test_matching_by_type() {
        let registry = registry();
        registry.add(MetricConfig::new("lat", "Latency", MetricType::Latency)).unwrap();
        registry.add(MetricConfig::new("fail", "Failed", MetricType::FailedCount)).unwrap();

        let matched = registry.matching(&completed(1));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id(), "lat");
    }

    #[tokio::test]
    async fn test_subscription_guard_detaches() {
        let registry = registry();
        let handle = registry
            .add(MetricConfig::new("m1", "Latency", MetricType::Latency))
            .unwrap();
        let listener = Arc::new(Counting::default());

        let subscription = handle.subscribe(listener.clone());
        assert_eq!(handle.listener_count(), 1);
        assert_eq!(handle.process_event(&completed(1)).await, Some(5.0));
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);

        drop(subscription);
        assert_eq!(handle.listener_count(), 0);
        handle.process_event(&completed(2)).await;
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }
}
