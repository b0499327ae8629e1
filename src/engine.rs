//! Engine
//!
//! Owns the clock, store, bus, metrics, rules, dispatcher and tick
//! scheduler, and wires them together.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::aggregators::AggregatorRegistry;
use crate::alerts::{AlertServices, LogNotifier, Notifier, NotifyLease, RuleError, RuleManager};
use crate::bus::{EngineEvent, EventBus};
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::ingest::{Dispatcher, TickScheduler};
use crate::metrics::{JobEvent, MetricConfig, MetricError, MetricHandle, MetricRegistry};
use crate::storage::{AlertStore, InMemoryStore, StoreError, METRICS_KEY};

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct Engine {
    config: EngineConfig,
    clock: SharedClock,
    store: Arc<dyn AlertStore>,
    bus: EventBus,
    metrics: Arc<MetricRegistry>,
    rules: Arc<RuleManager>,
    lease: Arc<NotifyLease>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<TickScheduler>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Engine on wall-clock time with an in-process store that logs
    /// notifications
    pub fn new(config: EngineConfig) -> Self {
        let clock = SystemClock::shared();
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        Self::with_components(config, clock, store, Arc::new(LogNotifier::new()))
    }

    pub fn with_components(
        config: EngineConfig,
        clock: SharedClock,
        store: Arc<dyn AlertStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let bus = EventBus::new(config.bus_capacity);
        let metrics = Arc::new(MetricRegistry::new(AggregatorRegistry::default(), bus.clone()));

        let lease = Arc::new(NotifyLease::new(
            Arc::clone(&store),
            clock.clone(),
            config.queue.clone(),
            config.lock_owner.clone(),
            config.lock_ttl_ms,
        ));
        let services = AlertServices {
            store: Arc::clone(&store),
            clock: clock.clone(),
            bus: bus.clone(),
            notifier,
            lease: Arc::clone(&lease),
            cooldown_check_interval: config.cooldown_check_interval(),
        };
        let rules = Arc::new(RuleManager::new(services, Arc::clone(&metrics)));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&metrics),
            config.concurrency,
            config.lane_capacity,
        ));
        let scheduler = Arc::new(TickScheduler::new(
            Arc::clone(&dispatcher),
            clock.clone(),
            config.min_tick_interval_ms,
        ));

        Self {
            config,
            clock,
            store,
            bus,
            metrics,
            rules,
            lease,
            dispatcher,
            scheduler,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn AlertStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricRegistry> {
        &self.metrics
    }

    pub fn rules(&self) -> &Arc<RuleManager> {
        &self.rules
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn lease(&self) -> &Arc<NotifyLease> {
        &self.lease
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Start the tick scheduler and the notification lease worker
    pub fn start(&self) {
        if self.scheduler.is_running() {
            return;
        }
        let ticker = Arc::clone(&self.scheduler).start();
        let lease = Arc::clone(&self.lease).start();
        self.workers.lock().extend([ticker, lease]);
    }

    /// Register and persist a metric
    pub async fn add_metric(&self, mut config: MetricConfig) -> Result<Arc<MetricHandle>, EngineError> {
        if config.created_at == 0 {
            config.created_at = self.clock.now();
        }
        let json = serde_json::to_string(&config)?;
        let handle = self.metrics.add(config)?;

        if let Err(e) = self.store.hset(METRICS_KEY, handle.id(), json).await {
            self.metrics.remove(handle.id())?;
            return Err(e.into());
        }

        tracing::info!(metric_id = %handle.id(), "Metric added");
        self.bus.publish(EngineEvent::MetricAdded {
            metric_id: handle.id().to_string(),
        });
        Ok(handle)
    }

    pub fn metric(&self, id: &str) -> Result<Arc<MetricHandle>, EngineError> {
        Ok(self.metrics.get(id)?)
    }

    /// Remove a metric together with every rule watching it
    pub async fn remove_metric(&self, id: &str) -> Result<(), EngineError> {
        if !self.metrics.contains(id) {
            return Err(MetricError::NotFound(id.to_string()).into());
        }

        for rule_id in self.rules.rules_for_metric(id) {
            self.rules.delete(&rule_id).await?;
        }
        // unregister first so no dispatch can open a new lane for it
        self.metrics.remove(id)?;
        self.dispatcher.close_lane(id).await;
        self.store.hdel(METRICS_KEY, id).await?;

        tracing::info!(metric_id = %id, "Metric removed");
        self.bus.publish(EngineEvent::MetricDeleted {
            metric_id: id.to_string(),
        });
        Ok(())
    }

    /// Feed one job event. Returns the number of metrics it reached.
    pub async fn submit(&self, event: JobEvent) -> usize {
        self.dispatcher.dispatch(event).await
    }

    /// Feed every event received on `rx` until the sender side closes
    pub fn attach(&self, mut rx: mpsc::Receiver<JobEvent>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = tokio::spawn(async move {
            tracing::info!("Job event source attached");
            while let Some(event) = rx.recv().await {
                dispatcher.dispatch(event).await;
            }
            tracing::info!("Job event source closed");
        });
        self.workers.lock().push(handle);
    }

    /// Restore persisted metrics, then rules. Returns how many of each were
    /// loaded.
    pub async fn load(&self) -> Result<(usize, usize), EngineError> {
        let stored = self.store.hgetall(METRICS_KEY).await?;
        let mut metrics = 0;

        for (id, json) in stored {
            if self.metrics.contains(&id) {
                continue;
            }
            let config: MetricConfig = match serde_json::from_str(&json) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(metric_id = %id, error = %e, "Skipping unreadable metric");
                    continue;
                }
            };
            match self.metrics.add(config) {
                Ok(_) => metrics += 1,
                Err(e) => tracing::warn!(metric_id = %id, error = %e, "Skipping invalid metric"),
            }
        }

        let rules = self.rules.load().await?;
        Ok((metrics, rules))
    }

    /// Wait until every submitted event has been processed
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }

    /// Stop ticking and ingestion, drain the lanes, stop the alerter timers
    /// and give up the notification lease. Durable state is left in the
    /// store.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.lease.stop();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.abort();
        }
        self.dispatcher.shutdown().await;
        self.rules.shutdown();
        self.lease.release().await;
        tracing::info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Rule, RuleState};
    use crate::clock::ManualClock;
    use crate::conditions::{CompareOp, Condition};
    use crate::metrics::{JobRef, MetricType};
    use std::time::Duration;

    fn engine() -> (Arc<ManualClock>, Arc<InMemoryStore>, Engine) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let engine = Engine::with_components(
            EngineConfig::default(),
            clock.clone(),
            store.clone(),
            Arc::new(LogNotifier::new()),
        );
        (clock, store, engine)
    }

    fn completed(ts: i64, latency: f64) -> JobEvent {
        JobEvent::completed(JobRef::new("1", "email", ts), ts, latency, 0.0)
    }

    fn slow_jobs() -> Rule {
        Rule::new("slow", "Slow jobs", "latency", Condition::threshold(CompareOp::Gt, 500.0))
    }

    #[tokio::test]
    async fn test_event_to_alert() {
        let (_clock, _store, engine) = engine();
        let mut events = engine.subscribe();
        engine
            .add_metric(MetricConfig::new("latency", "Latency", MetricType::Latency))
            .await
            .unwrap();
        engine.rules().create(slow_jobs()).await.unwrap();

        assert_eq!(engine.submit(completed(1_000, 900.0)).await, 1);
        engine.flush().await;

        assert_eq!(engine.rules().get("slow").unwrap().state, RuleState::Error);

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"metric.added"));
        assert!(names.contains(&"metric.updated"));
        assert!(names.contains(&"alert.triggered"));
    }

    #[tokio::test]
    async fn test_remove_metric_deletes_rules() {
        let (_clock, store, engine) = engine();
        engine
            .add_metric(MetricConfig::new("latency", "Latency", MetricType::Latency))
            .await
            .unwrap();
        engine.rules().create(slow_jobs()).await.unwrap();
        engine.submit(completed(1_000, 100.0)).await;

        engine.remove_metric("latency").await.unwrap();
        assert!(engine.rules().is_empty());
        assert_eq!(engine.dispatcher().lane_count(), 0);
        assert!(store.hget(METRICS_KEY, "latency").await.unwrap().is_none());
        assert!(matches!(
            engine.remove_metric("latency").await,
            Err(EngineError::Metric(MetricError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_remove_metric_stops_routing() {
        let (_clock, _store, engine) = engine();
        engine
            .add_metric(MetricConfig::new("latency", "Latency", MetricType::Latency))
            .await
            .unwrap();
        assert_eq!(engine.submit(completed(1_000, 100.0)).await, 1);

        engine.remove_metric("latency").await.unwrap();
        assert_eq!(engine.submit(completed(1_010, 100.0)).await, 0);
        assert_eq!(engine.dispatcher().lane_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_lease() {
        let (_clock, store, engine) = engine();
        engine
            .add_metric(MetricConfig::new("latency", "Latency", MetricType::Latency))
            .await
            .unwrap();
        engine.rules().create(slow_jobs()).await.unwrap();
        engine.submit(completed(1_000, 900.0)).await;
        engine.flush().await;
        assert!(engine.lease().is_held());

        engine.shutdown().await;
        assert!(!engine.lease().is_held());
        let key = crate::storage::queue_lock_key(&engine.config().queue);
        assert!(store.acquire_lock(&key, "standby", 1_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_from_shared_store() {
        let (clock, store, engine) = engine();
        engine
            .add_metric(MetricConfig::new("latency", "Latency", MetricType::Latency))
            .await
            .unwrap();
        engine.rules().create(slow_jobs()).await.unwrap();
        engine.shutdown().await;

        let restarted = Engine::with_components(
            EngineConfig::default(),
            clock.clone(),
            store.clone(),
            Arc::new(LogNotifier::new()),
        );
        assert_eq!(restarted.load().await.unwrap(), (1, 1));

        restarted.submit(completed(2_000, 900.0)).await;
        restarted.flush().await;
        assert_eq!(restarted.rules().get("slow").unwrap().state, RuleState::Error);
    }

    #[tokio::test]
    async fn test_attached_source() {
        let (_clock, _store, engine) = engine();
        let latency = engine
            .add_metric(MetricConfig::new("latency", "Latency", MetricType::Latency))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(16);
        engine.attach(rx);
        for i in 1..=5 {
            tx.send(completed(i, i as f64 * 10.0)).await.unwrap();
        }
        drop(tx);

        for _ in 0..50 {
            engine.flush().await;
            if latency.value() == 50.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(latency.value(), 50.0);
        engine.shutdown().await;
    }
}
