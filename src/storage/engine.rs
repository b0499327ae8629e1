//! Store contract
//!
//! Everything durable goes through [`AlertStore`]: hashes for definitions and
//! alerts, ordered time series for per-rule alert history, the atomic rule
//! transition and the per-queue notification lock.

use std::collections::HashMap;

use async_trait::async_trait;

use super::transition::{RuleAction, RuleAlertState, TransitionResult};
use crate::alerts::RuleAlert;

/// Hash holding metric definitions keyed by metric id
pub const METRICS_KEY: &str = "metrics";
/// Hash holding rule definitions keyed by rule id
pub const RULES_KEY: &str = "rules";
/// Hash holding alerts keyed by alert id
pub const ALERTS_KEY: &str = "alerts";

/// Time series of alert ids raised for a rule, keyed by raise time
pub fn rule_alerts_key(rule_id: &str) -> String {
    format!("rules:{}:alerts", rule_id)
}

/// Notification lock for a queue
pub fn queue_lock_key(queue: &str) -> String {
    format!("lock:{}:notify", queue)
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), StoreError>;

    /// Returns whether the field existed
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Drop a whole hash or series, returns whether it existed
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    async fn ts_add(&self, key: &str, ts: i64, value: String) -> Result<(), StoreError>;

    /// Values stored at exactly `ts`
    async fn ts_get(&self, key: &str, ts: i64) -> Result<Vec<String>, StoreError>;

    /// Values with `start <= ts <= end`, oldest first
    async fn ts_range(&self, key: &str, start: i64, end: i64) -> Result<Vec<(i64, String)>, StoreError>;

    /// Drop entries older than `min_ts`, returns the number removed
    async fn ts_truncate(&self, key: &str, min_ts: i64) -> Result<usize, StoreError>;

    /// Run one rule state transition atomically, including the alert writes
    /// it implies
    async fn transition_rule_state(
        &self,
        rule_id: &str,
        action: RuleAction,
        now: i64,
    ) -> Result<TransitionResult, StoreError>;

    /// Forget the durable state of a deleted rule
    async fn delete_rule_state(&self, rule_id: &str) -> Result<Option<RuleAlertState>, StoreError>;

    /// Take `key` for `owner` unless someone else holds an unexpired lease
    async fn acquire_lock(&self, key: &str, owner: &str, ttl_ms: i64) -> Result<bool, StoreError>;

    /// Release `key` if held by `owner`
    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool, StoreError>;

    async fn get_alert(&self, alert_id: &str) -> Result<Option<RuleAlert>, StoreError> {
        match self.hget(ALERTS_KEY, alert_id).await? {
            Some(json) => decode_alert(alert_id, &json).map(Some),
            None => Ok(None),
        }
    }

    /// Alerts of a rule raised within `[start, end]`, oldest first
    async fn get_alerts(&self, rule_id: &str, start: i64, end: i64) -> Result<Vec<RuleAlert>, StoreError> {
        let ids = self.ts_range(&rule_alerts_key(rule_id), start, end).await?;
        let mut alerts = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(alert) = self.get_alert(&id).await? {
                alerts.push(alert);
            }
        }
        Ok(alerts)
    }
}

/// Parse a stored alert body
pub fn decode_alert(alert_id: &str, json: &str) -> Result<RuleAlert, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
        key: format!("{}:{}", ALERTS_KEY, alert_id),
        reason: e.to_string(),
    })
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}
