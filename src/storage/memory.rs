//! In-process store
//!
//! Implements [`AlertStore`] for tests and single-process deployments. Rule
//! transitions run under one mutex, which gives the same atomicity a shared
//! store provides with a server-side transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::chunked::ChunkedAssociativeArray;
use super::engine::{decode_alert, rule_alerts_key, AlertStore, StoreError, ALERTS_KEY};
use super::transition::{self, AlertMutation, RuleAction, RuleAlertState, TransitionResult};
use crate::alerts::{new_alert_id, AlertStatus, RuleAlert};
use crate::clock::SharedClock;

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: i64,
}

#[derive(Debug)]
pub struct InMemoryStore {
    clock: SharedClock,
    hashes: DashMap<String, FxHashMap<String, String>>,
    series: DashMap<String, ChunkedAssociativeArray<i64, Vec<String>>>,
    rule_states: Mutex<FxHashMap<String, RuleAlertState>>,
    locks: Mutex<FxHashMap<String, Lease>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            hashes: DashMap::new(),
            series: DashMap::new(),
            rule_states: Mutex::new(FxHashMap::default()),
            locks: Mutex::new(FxHashMap::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every call fail with [`StoreError::Unavailable`] until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current durable state of a rule
    pub fn rule_state(&self, rule_id: &str) -> Option<RuleAlertState> {
        self.rule_states.lock().get(rule_id).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        self.hashes.get(key).and_then(|h| h.get(field).cloned())
    }

    fn hash_set(&self, key: &str, field: &str, value: String) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    fn series_add(&self, key: &str, ts: i64, value: String) {
        let mut series = self.series.entry(key.to_string()).or_default();
        match series.get_mut(ts) {
            Some(values) => values.push(value),
            None => series.put(ts, vec![value]),
        }
    }

    fn load_alert(&self, alert_id: &str) -> Result<Option<RuleAlert>, StoreError> {
        match self.hash_get(ALERTS_KEY, alert_id) {
            Some(json) => decode_alert(alert_id, &json).map(Some),
            None => Ok(None),
        }
    }

    fn save_alert(&self, alert: &RuleAlert) -> Result<(), StoreError> {
        let json = serde_json::to_string(alert)?;
        self.hash_set(ALERTS_KEY, &alert.id, json);
        Ok(())
    }

    /// Perform the alert write of a transition and return the resulting alert
    fn apply_mutation(&self, rule_id: &str, mutation: AlertMutation) -> Result<Option<RuleAlert>, StoreError> {
        match mutation {
            AlertMutation::Create(alert) => {
                self.save_alert(&alert)?;
                self.series_add(&rule_alerts_key(rule_id), alert.raised_at, alert.id.clone());
                Ok(Some(alert))
            }
            AlertMutation::Escalate { alert_id, error_level } => {
                let Some(mut alert) = self.load_alert(&alert_id)? else {
                    return Ok(None);
                };
                alert.error_level = error_level;
                self.save_alert(&alert)?;
                Ok(Some(alert))
            }
            AlertMutation::Close { alert_id, reset_at } => {
                let Some(mut alert) = self.load_alert(&alert_id)? else {
                    return Ok(None);
                };
                alert.status = AlertStatus::Close;
                alert.reset_at = Some(reset_at);
                self.save_alert(&alert)?;
                Ok(Some(alert))
            }
        }
    }
}

#[async_trait]
impl AlertStore for InMemoryStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        Ok(self.hash_get(key, field))
    }

    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), StoreError> {
        self.check_available()?;
        self.hash_set(key, field, value);
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .hashes
            .get_mut(key)
            .map_or(false, |mut h| h.remove(field).is_some()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_available()?;
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let hash = self.hashes.remove(key).is_some();
        let series = self.series.remove(key).is_some();
        Ok(hash || series)
    }

    async fn ts_add(&self, key: &str, ts: i64, value: String) -> Result<(), StoreError> {
        self.check_available()?;
        self.series_add(key, ts, value);
        Ok(())
    }

    async fn ts_get(&self, key: &str, ts: i64) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        Ok(self
            .series
            .get(key)
            .and_then(|s| s.get(ts).cloned())
            .unwrap_or_default())
    }

    async fn ts_range(&self, key: &str, start: i64, end: i64) -> Result<Vec<(i64, String)>, StoreError> {
        self.check_available()?;
        let Some(series) = self.series.get(key) else {
            return Ok(Vec::new());
        };
        Ok(series
            .range(start, end)
            .flat_map(|(ts, values)| values.iter().map(move |v| (ts, v.clone())))
            .collect())
    }

    async fn ts_truncate(&self, key: &str, min_ts: i64) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self
            .series
            .get_mut(key)
            .map_or(0, |mut s| s.trim(min_ts)))
    }

    async fn transition_rule_state(
        &self,
        rule_id: &str,
        action: RuleAction,
        now: i64,
    ) -> Result<TransitionResult, StoreError> {
        self.check_available()?;
        let mut states = self.rule_states.lock();
        let current = states.get(rule_id).cloned().unwrap_or_default();

        // work on a copy so a failed alert write leaves the state untouched
        let mut next = current;
        let (mut result, mutation) = transition::apply(&mut next, rule_id, action, now, new_alert_id);
        if let Some(mutation) = mutation {
            result.alert = self.apply_mutation(rule_id, mutation)?;
        }
        states.insert(rule_id.to_string(), next);
        Ok(result)
    }

    async fn delete_rule_state(&self, rule_id: &str) -> Result<Option<RuleAlertState>, StoreError> {
        self.check_available()?;
        Ok(self.rule_states.lock().remove(rule_id))
    }

    async fn acquire_lock(&self, key: &str, owner: &str, ttl_ms: i64) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut locks = self.locks.lock();
        if let Some(lease) = locks.get(key) {
            if lease.owner != owner && lease.expires_at > now {
                return Ok(false);
            }
        }
        locks.insert(
            key.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl_ms,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(lease) if lease.owner == owner => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertDraft, RuleAlertOptions, Severity};
    use crate::clock::ManualClock;
    use crate::conditions::{ErrorLevel, EvaluationResult, EvaluationState};
    use crate::storage::transition::{CircuitState, TransitionStatus};
    use std::sync::Arc;

    fn store() -> (Arc<ManualClock>, InMemoryStore) {
        let clock = Arc::new(ManualClock::new(0));
        let store = InMemoryStore::new(clock.clone());
        (clock, store)
    }

    fn check(level: ErrorLevel, options: RuleAlertOptions) -> RuleAction {
        RuleAction::Check {
            result: EvaluationResult::new(9.0, level, EvaluationState::Threshold { threshold: Some(5.0) }),
            options,
            draft: AlertDraft {
                value: 9.0,
                error_level: level,
                message: "value above 5".to_string(),
                severity: Severity::Critical,
                state: None,
            },
            can_notify: true,
        }
    }

    #[tokio::test]
    async fn test_hash_roundtrip() {
        let (_, store) = store();
        store.hset("h", "a", "1".to_string()).await.unwrap();
        store.hset("h", "b", "2".to_string()).await.unwrap();

        assert_eq!(store.hget("h", "a").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.hgetall("h").await.unwrap().len(), 2);
        assert!(store.hdel("h", "a").await.unwrap());
        assert!(!store.hdel("h", "a").await.unwrap());
        assert_eq!(store.hget("h", "a").await.unwrap(), None);
        assert!(store.hgetall("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_time_series() {
        let (_, store) = store();
        for ts in [10, 20, 20, 30, 40] {
            store.ts_add("s", ts, format!("v{}", ts)).await.unwrap();
        }

        assert_eq!(store.ts_get("s", 20).await.unwrap(), vec!["v20", "v20"]);
        let range = store.ts_range("s", 15, 30).await.unwrap();
        assert_eq!(range.iter().map(|(ts, _)| *ts).collect::<Vec<_>>(), vec![20, 20, 30]);

        assert_eq!(store.ts_truncate("s", 30).await.unwrap(), 2);
        assert_eq!(store.ts_range("s", 0, 100).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transition_persists_alert_lifecycle() {
        let (_, store) = store();
        let opts = RuleAlertOptions::default();

        store.transition_rule_state("r1", RuleAction::Start, 0).await.unwrap();
        let res = store
            .transition_rule_state("r1", check(ErrorLevel::Critical, opts), 100)
            .await
            .unwrap();
        assert_eq!(res.status, TransitionStatus::Triggered);
        let alert = res.alert.unwrap();
        assert!(alert.is_open());

        let stored = store.get_alert(&alert.id).await.unwrap().unwrap();
        assert_eq!(stored, alert);

        let res = store
            .transition_rule_state("r1", check(ErrorLevel::None, opts), 200)
            .await
            .unwrap();
        assert_eq!(res.status, TransitionStatus::Reset);
        let closed = res.alert.unwrap();
        assert_eq!(closed.status, AlertStatus::Close);
        assert_eq!(closed.reset_at, Some(200));

        let history = store.get_alerts("r1", 0, 1000).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AlertStatus::Close);
        assert!(store.get_alerts("r1", 150, 1000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_keeps_state() {
        let (_, store) = store();
        store.transition_rule_state("r1", RuleAction::Start, 0).await.unwrap();

        store.set_unavailable(true);
        let err = store
            .transition_rule_state("r1", check(ErrorLevel::Critical, RuleAlertOptions::default()), 1)
            .await;
        assert!(matches!(err, Err(StoreError::Unavailable(_))));

        store.set_unavailable(false);
        let state = store.rule_state("r1").unwrap();
        assert_eq!(state.failures, 0);
        assert_eq!(state.circuit_state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_lock_lease() {
        let (clock, store) = store();
        assert!(store.acquire_lock("q", "a", 100).await.unwrap());
        assert!(!store.acquire_lock("q", "b", 100).await.unwrap());
        // re-entrant for the owner
        assert!(store.acquire_lock("q", "a", 100).await.unwrap());

        clock.advance_by(150);
        assert!(store.acquire_lock("q", "b", 100).await.unwrap());
        assert!(!store.release_lock("q", "a").await.unwrap());
        assert!(store.release_lock("q", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_del_drops_hash_and_series() {
        let (_, store) = store();
        store.hset("h", "a", "1".to_string()).await.unwrap();
        store.ts_add("s", 10, "x".to_string()).await.unwrap();

        assert!(store.del("h").await.unwrap());
        assert!(store.del("s").await.unwrap());
        assert!(!store.del("s").await.unwrap());
        assert!(store.hgetall("h").await.unwrap().is_empty());
        assert!(store.ts_range("s", 0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_alert_is_corrupt() {
        let (_, store) = store();
        store.hset(ALERTS_KEY, "bad", "{not json".to_string()).await.unwrap();

        let err = store.get_alert("bad").await;
        assert!(matches!(err, Err(StoreError::Corrupt { ref key, .. }) if key == "alerts:bad"));
        assert!(store.get_alert("missing").await.unwrap().is_none());
    }
}
