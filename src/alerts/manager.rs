//! Rule manager
//!
//! Owns every rule definition, validates it, persists it in the store and
//! wires an evaluator and a [`RuleAlerter`] to the rule's metric.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::alert::RuleAlert;
use super::alerter::{AlertServices, RuleAlerter};
use super::config::{Rule, RuleState};
use crate::conditions::{ConditionEvaluator, ErrorLevel, EvaluatorRegistry};
use crate::metrics::{MetricListener, MetricRegistry, MetricUpdate, Subscription};
use crate::storage::{rule_alerts_key, RuleAction, StoreError, TransitionResult, ALERTS_KEY, RULES_KEY};

/// Rule manager errors
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Rule not found: {0}")]
    NotFound(String),

    #[error("Rule already exists: {0}")]
    Duplicate(String),

    #[error("Rule references unknown metric: {0}")]
    MetricNotFound(String),

    #[error("Invalid rule: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A live rule: its evaluator fed by the metric, its alerter fed by the
/// evaluator
struct RuleBinding {
    rule: Arc<RwLock<Rule>>,
    evaluator: Mutex<Box<dyn ConditionEvaluator>>,
    alerter: Arc<RuleAlerter>,
    subscription: Mutex<Option<Subscription>>,
}

impl RuleBinding {
    fn rule(&self) -> Rule {
        self.rule.read().clone()
    }

    fn detach(&self) {
        self.subscription.lock().take();
        self.alerter.destroy();
    }
}

#[async_trait]
impl MetricListener for RuleBinding {
    async fn on_update(&self, update: &MetricUpdate) {
        if !self.rule.read().is_active {
            return;
        }
        let result = self.evaluator.lock().evaluate(update.value);
        tracing::trace!(
            metric_id = %update.metric_id,
            value = update.value,
            level = %result.error_level,
            "Rule evaluated"
        );
        self.alerter.handle_result(result).await;
    }
}

pub struct RuleManager {
    services: AlertServices,
    metrics: Arc<MetricRegistry>,
    evaluators: EvaluatorRegistry,
    rules: DashMap<String, Arc<RuleBinding>>,
}

impl RuleManager {
    pub fn new(services: AlertServices, metrics: Arc<MetricRegistry>) -> Self {
        Self::with_evaluators(services, metrics, EvaluatorRegistry::default())
    }

    pub fn with_evaluators(
        services: AlertServices,
        metrics: Arc<MetricRegistry>,
        evaluators: EvaluatorRegistry,
    ) -> Self {
        Self {
            services,
            metrics,
            evaluators,
            rules: DashMap::new(),
        }
    }

    /// Validate, persist and activate a new rule
    pub async fn create(&self, mut rule: Rule) -> Result<Rule, RuleError> {
        if self.rules.contains_key(&rule.id) {
            return Err(RuleError::Duplicate(rule.id));
        }
        let now = self.services.clock.now();
        if rule.created_at == 0 {
            rule.created_at = now;
        }
        rule.updated_at = now;

        let binding = self.bind(rule).await?;
        let rule = binding.rule();
        self.persist(&rule).await?;
        self.rules.insert(rule.id.clone(), binding);

        tracing::info!(rule_id = %rule.id, metric_id = %rule.metric_id, "Rule created");
        Ok(rule)
    }

    /// Replace a rule definition. Durable alert state carries over.
    pub async fn update(&self, mut rule: Rule) -> Result<Rule, RuleError> {
        let previous = self.binding(&rule.id)?;
        let old = previous.rule();
        rule.created_at = old.created_at;
        rule.updated_at = self.services.clock.now();
        rule.state = old.state;

        let binding = self.bind(rule).await?;
        previous.detach();
        let rule = binding.rule();
        self.persist(&rule).await?;
        self.rules.insert(rule.id.clone(), binding);

        tracing::info!(rule_id = %rule.id, "Rule updated");
        Ok(rule)
    }

    /// Remove a rule together with its alert history, closing any open
    /// alert silently
    pub async fn delete(&self, id: &str) -> Result<Rule, RuleError> {
        let (_, binding) = self
            .rules
            .remove(id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        binding.detach();

        if let Err(e) = binding.alerter.stop().await {
            tracing::warn!(rule_id = %id, error = %e, "Failed to stop rule alerter");
        }
        let store = &self.services.store;
        store.hdel(RULES_KEY, id).await?;
        store.delete_rule_state(id).await?;

        let key = rule_alerts_key(id);
        let history = store.ts_range(&key, i64::MIN, i64::MAX).await?;
        for (_, alert_id) in &history {
            store.hdel(ALERTS_KEY, alert_id).await?;
        }
        store.del(&key).await?;

        tracing::info!(rule_id = %id, alerts = history.len(), "Rule deleted");
        Ok(binding.rule())
    }

    pub fn get(&self, id: &str) -> Result<Rule, RuleError> {
        Ok(self.binding(id)?.rule())
    }

    pub fn list(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self.rules.iter().map(|e| e.value().rule()).collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Ids of rules watching `metric_id`
    pub fn rules_for_metric(&self, metric_id: &str) -> Vec<String> {
        self.rules
            .iter()
            .filter(|e| e.value().rule.read().metric_id == metric_id)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn alerter(&self, id: &str) -> Option<Arc<RuleAlerter>> {
        self.rules.get(id).map(|b| Arc::clone(&b.alerter))
    }

    /// Activate or mute a rule
    pub async fn set_active(&self, id: &str, active: bool) -> Result<Rule, RuleError> {
        let binding = self.binding(id)?;
        {
            let mut rule = binding.rule.write();
            rule.is_active = active;
            rule.updated_at = self.services.clock.now();
        }

        if active {
            binding.alerter.start().await?;
        } else {
            binding.alerter.stop().await?;
        }

        let rule = binding.rule();
        self.persist(&rule).await?;
        tracing::info!(rule_id = %id, active, "Rule activation changed");
        Ok(rule)
    }

    /// Raise an alert on a rule by hand
    pub async fn trigger(
        &self,
        id: &str,
        message: impl Into<String>,
        error_level: ErrorLevel,
    ) -> Result<TransitionResult, RuleError> {
        let binding = self.binding(id)?;
        Ok(binding.alerter.trigger_manual(message, error_level).await?)
    }

    /// Alerts raised for a rule within `[start, end]`
    pub async fn get_alerts(&self, id: &str, start: i64, end: i64) -> Result<Vec<RuleAlert>, RuleError> {
        Ok(self.services.store.get_alerts(id, start, end).await?)
    }

    /// Drop alerts raised before `before`. The open alert of a tripped rule
    /// and everything raised after it are kept.
    pub async fn prune_alerts(&self, id: &str, before: i64) -> Result<usize, RuleError> {
        let store = &self.services.store;
        let mut min_ts = before;
        let open = self.rules.get(id).and_then(|b| b.alerter.state().alert_id);
        if let Some(alert_id) = open {
            if let Some(alert) = store.get_alert(&alert_id).await? {
                min_ts = min_ts.min(alert.raised_at);
            }
        }

        let key = rule_alerts_key(id);
        let expired = store.ts_range(&key, i64::MIN, min_ts.saturating_sub(1)).await?;
        for (_, alert_id) in &expired {
            store.hdel(ALERTS_KEY, alert_id).await?;
        }
        store.ts_truncate(&key, min_ts).await?;
        let removed = expired.len();
        if removed > 0 {
            tracing::debug!(rule_id = %id, removed, "Pruned alert history");
        }
        Ok(removed)
    }

    /// Restore persisted rules. Definitions that fail to parse or bind are
    /// logged and skipped. Returns the number of rules loaded.
    pub async fn load(&self) -> Result<usize, RuleError> {
        let stored = self.services.store.hgetall(RULES_KEY).await?;
        let mut loaded = 0;

        for (id, json) in stored {
            if self.rules.contains_key(&id) {
                continue;
            }
            let rule: Rule = match serde_json::from_str(&json) {
                Ok(rule) => rule,
                Err(e) => {
                    tracing::warn!(rule_id = %id, error = %e, "Skipping unreadable rule");
                    continue;
                }
            };
            match self.bind(rule).await {
                Ok(binding) => {
                    self.rules.insert(id, binding);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(rule_id = %id, error = %e, "Skipping invalid rule");
                }
            }
        }

        tracing::info!(loaded, "Rules loaded from store");
        Ok(loaded)
    }

    /// Detach every rule and stop the cooldown timers. Durable state stays.
    pub fn shutdown(&self) {
        for entry in self.rules.iter() {
            entry.value().detach();
        }
        self.rules.clear();
    }

    fn binding(&self, id: &str) -> Result<Arc<RuleBinding>, RuleError> {
        self.rules
            .get(id)
            .map(|b| Arc::clone(&b))
            .ok_or_else(|| RuleError::NotFound(id.to_string()))
    }

    async fn persist(&self, rule: &Rule) -> Result<(), RuleError> {
        let json = serde_json::to_string(rule)?;
        self.services.store.hset(RULES_KEY, &rule.id, json).await?;
        Ok(())
    }

    /// Build the evaluator and alerter of `rule`, subscribe them to the
    /// metric and bring the durable state in line with `is_active`
    async fn bind(&self, mut rule: Rule) -> Result<Arc<RuleBinding>, RuleError> {
        rule.validate().map_err(RuleError::Validation)?;
        let metric = self
            .metrics
            .get(&rule.metric_id)
            .map_err(|_| RuleError::MetricNotFound(rule.metric_id.clone()))?;
        let evaluator = self
            .evaluators
            .create(&rule.condition, &self.services.clock)
            .map_err(|e| RuleError::Validation(e.to_string()))?;

        if !rule.is_active {
            rule.state = RuleState::Muted;
        }
        let active = rule.is_active;
        let rule = Arc::new(RwLock::new(rule));
        let alerter = RuleAlerter::new(Arc::clone(&rule), self.services.clone());

        let rule_id = rule.read().id.clone();
        let durable = self
            .services
            .store
            .transition_rule_state(&rule_id, RuleAction::State, self.services.clock.now())
            .await?;
        if active && !durable.snapshot.active {
            alerter.start().await?;
        } else if !active && durable.snapshot.active {
            alerter.stop().await?;
        } else {
            alerter.refresh().await?;
        }

        let binding = Arc::new(RuleBinding {
            rule,
            evaluator: Mutex::new(evaluator),
            alerter,
            subscription: Mutex::new(None),
        });
        let listener: Arc<dyn MetricListener> = binding.clone();
        *binding.subscription.lock() = Some(metric.subscribe(listener));
        Ok(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregators::AggregatorRegistry;
    use crate::alerts::{LogNotifier, NotifyLease, RuleAlertOptions};
    use crate::bus::EventBus;
    use crate::clock::{Clock, ManualClock};
    use crate::conditions::{CompareOp, Condition};
    use crate::metrics::{JobEvent, JobRef, MetricConfig, MetricHandle, MetricType};
    use crate::storage::{AlertStore, CircuitState, InMemoryStore};
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        metrics: Arc<MetricRegistry>,
        manager: RuleManager,
        latency: Arc<MetricHandle>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let bus = EventBus::new(64);
        let metrics = Arc::new(MetricRegistry::new(AggregatorRegistry::default(), bus.clone()));
        let latency = metrics
            .add(MetricConfig::new("latency", "Latency", MetricType::Latency))
            .unwrap();

        let services = AlertServices {
            store: store.clone(),
            clock: clock.clone(),
            bus,
            notifier: Arc::new(LogNotifier::new()),
            lease: Arc::new(NotifyLease::new(store.clone(), clock.clone(), "default", "test", 1_000)),
            cooldown_check_interval: Duration::from_millis(20),
        };
        let manager = RuleManager::new(services, metrics.clone());
        Fixture {
            clock,
            store,
            metrics,
            manager,
            latency,
        }
    }

    fn slow_jobs() -> Rule {
        Rule::new("slow", "Slow jobs", "latency", Condition::threshold(CompareOp::Gt, 500.0))
            .with_alert_options(RuleAlertOptions::default().with_recovery_window(60_000))
    }

    async fn wait_for_state(manager: &RuleManager, id: &str, state: RuleState) -> RuleState {
        for _ in 0..50 {
            let current = manager.get(id).unwrap().state;
            if current == state {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.get(id).unwrap().state
    }

    async fn job(f: &Fixture, latency: f64) {
        let ts = f.clock.advance_by(10);
        f.latency
            .process_event(&JobEvent::completed(JobRef::new("1", "email", ts), ts, latency, 0.0))
            .await;
    }

    #[tokio::test]
    async fn test_create_validates() {
        let f = fixture();

        let missing = Rule::new("r", "Missing", "nope", Condition::threshold(CompareOp::Gt, 1.0));
        assert!(matches!(f.manager.create(missing).await, Err(RuleError::MetricNotFound(_))));

        let invalid = slow_jobs().with_alert_options(RuleAlertOptions::default().with_failure_threshold(0));
        assert!(matches!(f.manager.create(invalid).await, Err(RuleError::Validation(_))));

        f.manager.create(slow_jobs()).await.unwrap();
        assert!(matches!(f.manager.create(slow_jobs()).await, Err(RuleError::Duplicate(_))));
        assert_eq!(f.latency.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_metric_updates_drive_alerts() {
        let f = fixture();
        f.manager.create(slow_jobs()).await.unwrap();

        job(&f, 100.0).await;
        assert_eq!(f.manager.get("slow").unwrap().state, RuleState::Normal);

        job(&f, 900.0).await;
        assert_eq!(f.manager.get("slow").unwrap().state, RuleState::Error);

        let alerts = f.manager.get_alerts("slow", 0, i64::MAX).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].value, 900.0);
        assert!(alerts[0].is_open());

        // persisted definition follows the visible state
        let json = f.store.hget(RULES_KEY, "slow").await.unwrap().unwrap();
        let stored: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(stored.state, RuleState::Error);
    }

    #[tokio::test]
    async fn test_set_active_mutes_rule() {
        let f = fixture();
        f.manager.create(slow_jobs()).await.unwrap();
        job(&f, 900.0).await;

        let rule = f.manager.set_active("slow", false).await.unwrap();
        assert!(!rule.is_active);
        assert_eq!(rule.state, RuleState::Muted);

        let alerts = f.manager.get_alerts("slow", 0, i64::MAX).await.unwrap();
        assert!(!alerts[0].is_open());

        job(&f, 900.0).await;
        assert_eq!(f.store.rule_state("slow").unwrap().failures, 0);

        let rule = f.manager.set_active("slow", true).await.unwrap();
        assert_eq!(rule.state, RuleState::Normal);
    }

    #[tokio::test]
    async fn test_update_keeps_durable_state() {
        let f = fixture();
        f.manager.create(slow_jobs()).await.unwrap();
        job(&f, 900.0).await;

        let stricter = Rule::new("slow", "Slow jobs", "latency", Condition::threshold(CompareOp::Gt, 100.0))
            .with_alert_options(RuleAlertOptions::default().with_recovery_window(60_000));
        let rule = f.manager.update(stricter).await.unwrap();
        assert_eq!(rule.state, RuleState::Error);
        assert_eq!(f.latency.listener_count(), 1);

        let alerter = f.manager.alerter("slow").unwrap();
        assert_eq!(alerter.state().circuit_state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_delete_detaches_and_forgets() {
        let f = fixture();
        f.manager.create(slow_jobs()).await.unwrap();
        job(&f, 900.0).await;

        assert_eq!(f.store.hgetall(ALERTS_KEY).await.unwrap().len(), 1);

        f.manager.delete("slow").await.unwrap();
        assert_eq!(f.latency.listener_count(), 0);
        assert!(f.store.hgetall(ALERTS_KEY).await.unwrap().is_empty());
        assert!(f.store.ts_range(&rule_alerts_key("slow"), 0, i64::MAX).await.unwrap().is_empty());
        assert!(f.store.hget(RULES_KEY, "slow").await.unwrap().is_none());
        assert!(f.store.rule_state("slow").is_none());
        assert!(matches!(f.manager.get("slow"), Err(RuleError::NotFound(_))));
        assert!(matches!(f.manager.delete("slow").await, Err(RuleError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_load_restores_rules() {
        let f = fixture();
        f.manager.create(slow_jobs()).await.unwrap();
        f.store.hset(RULES_KEY, "broken", "{not json".to_string()).await.unwrap();

        let fresh = RuleManager::new(f.manager.services.clone(), f.metrics.clone());
        f.manager.shutdown();
        assert_eq!(f.latency.listener_count(), 0);

        assert_eq!(fresh.load().await.unwrap(), 1);
        assert!(fresh.contains("slow"));
        assert_eq!(f.latency.listener_count(), 1);
        assert_eq!(fresh.rules_for_metric("latency"), vec!["slow".to_string()]);
    }

    #[tokio::test]
    async fn test_manual_trigger_and_prune() {
        let f = fixture();
        f.manager.create(slow_jobs()).await.unwrap();

        let t = f.manager.trigger("slow", "paged", ErrorLevel::Critical).await.unwrap();
        assert_eq!(t.state, CircuitState::Open);
        assert_eq!(f.manager.get_alerts("slow", 0, i64::MAX).await.unwrap().len(), 1);

        // muting closes the first alert, the second one stays open
        f.manager.set_active("slow", false).await.unwrap();
        f.manager.set_active("slow", true).await.unwrap();
        let second_at = f.clock.advance_by(100);
        f.manager.trigger("slow", "paged again", ErrorLevel::Critical).await.unwrap();
        assert_eq!(f.store.hgetall(ALERTS_KEY).await.unwrap().len(), 2);

        let removed = f.manager.prune_alerts("slow", second_at + 1_000).await.unwrap();
        assert_eq!(removed, 1);
        let alerts = f.manager.get_alerts("slow", 0, i64::MAX).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].is_open());
        assert_eq!(f.store.hgetall(ALERTS_KEY).await.unwrap().len(), 1);

        assert_eq!(f.manager.prune_alerts("slow", i64::MAX).await.unwrap(), 0);
        assert_eq!(f.store.hgetall(ALERTS_KEY).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_loaded_tripped_rule_recovers_without_events() {
        let f = fixture();
        let rule = slow_jobs().with_alert_options(RuleAlertOptions::default().with_recovery_window(100));
        f.manager.create(rule).await.unwrap();
        job(&f, 900.0).await;
        assert_eq!(f.manager.get("slow").unwrap().state, RuleState::Error);

        let fresh = RuleManager::new(f.manager.services.clone(), f.metrics.clone());
        f.manager.shutdown();
        assert_eq!(fresh.load().await.unwrap(), 1);
        assert_eq!(fresh.get("slow").unwrap().state, RuleState::Error);
        assert!(fresh.alerter("slow").unwrap().has_cooldown_timer());

        f.clock.advance_by(200);
        assert_eq!(wait_for_state(&fresh, "slow", RuleState::Normal).await, RuleState::Normal);
        let alerts = fresh.get_alerts("slow", 0, i64::MAX).await.unwrap();
        assert!(!alerts[0].is_open());
    }

    #[tokio::test]
    async fn test_updated_tripped_rule_recovers_without_events() {
        let f = fixture();
        f.manager.create(slow_jobs()).await.unwrap();
        job(&f, 900.0).await;

        let relaxed = slow_jobs().with_alert_options(RuleAlertOptions::default().with_recovery_window(100));
        f.manager.update(relaxed).await.unwrap();
        assert!(f.manager.alerter("slow").unwrap().has_cooldown_timer());

        f.clock.advance_by(200);
        assert_eq!(wait_for_state(&f.manager, "slow", RuleState::Normal).await, RuleState::Normal);
    }
}
