use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_BUS_CAPACITY;
use crate::ingest::{DEFAULT_CONCURRENCY, DEFAULT_LANE_CAPACITY};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Metrics processed concurrently by the dispatcher
    pub concurrency: usize,
    /// Queued messages per metric lane
    pub lane_capacity: usize,
    /// Lower bound for the tick scheduler interval (ms)
    pub min_tick_interval_ms: i64,
    /// How often a recovering rule re-checks its cooldown (ms)
    pub cooldown_check_interval_ms: u64,
    /// Lease of the notification lock (ms)
    pub lock_ttl_ms: i64,
    /// Identity of this process when taking locks
    pub lock_owner: String,
    /// Queue this engine watches
    pub queue: String,
    pub bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            lane_capacity: DEFAULT_LANE_CAPACITY,
            min_tick_interval_ms: 1_000,
            cooldown_check_interval_ms: 1_000,
            lock_ttl_ms: 30_000,
            lock_owner: format!("queuewatch-{}", std::process::id()),
            queue: "default".to_string(),
            bus_capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Create a config from environment variables, falling back to defaults
    /// QUEUEWATCH_CONCURRENCY=16
    /// QUEUEWATCH_LANE_CAPACITY=1024
    /// QUEUEWATCH_MIN_TICK_INTERVAL_MS=1000
    /// QUEUEWATCH_COOLDOWN_CHECK_INTERVAL_MS=1000
    /// QUEUEWATCH_LOCK_TTL_MS=30000
    /// QUEUEWATCH_LOCK_OWNER=worker-1
    /// QUEUEWATCH_QUEUE=emails
    /// QUEUEWATCH_BUS_CAPACITY=1024
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            concurrency: parse_var(&lookup, "QUEUEWATCH_CONCURRENCY").unwrap_or(defaults.concurrency),
            lane_capacity: parse_var(&lookup, "QUEUEWATCH_LANE_CAPACITY").unwrap_or(defaults.lane_capacity),
            min_tick_interval_ms: parse_var(&lookup, "QUEUEWATCH_MIN_TICK_INTERVAL_MS")
                .unwrap_or(defaults.min_tick_interval_ms),
            cooldown_check_interval_ms: parse_var(&lookup, "QUEUEWATCH_COOLDOWN_CHECK_INTERVAL_MS")
                .unwrap_or(defaults.cooldown_check_interval_ms),
            lock_ttl_ms: parse_var(&lookup, "QUEUEWATCH_LOCK_TTL_MS").unwrap_or(defaults.lock_ttl_ms),
            lock_owner: lookup("QUEUEWATCH_LOCK_OWNER")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.lock_owner),
            queue: lookup("QUEUEWATCH_QUEUE")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.queue),
            bus_capacity: parse_var(&lookup, "QUEUEWATCH_BUS_CAPACITY").unwrap_or(defaults.bus_capacity),
        }
    }

    pub fn cooldown_check_interval(&self) -> Duration {
        Duration::from_millis(self.cooldown_check_interval_ms.max(1))
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("QUEUEWATCH_CONCURRENCY", "4"),
            ("QUEUEWATCH_QUEUE", "emails"),
            ("QUEUEWATCH_LOCK_TTL_MS", "not-a-number"),
            ("QUEUEWATCH_LOCK_OWNER", " "),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.queue, "emails");
        assert_eq!(config.lock_ttl_ms, 30_000);
        assert!(config.lock_owner.starts_with("queuewatch-"));
        assert_eq!(config.lane_capacity, DEFAULT_LANE_CAPACITY);
    }

    #[test]
    fn test_json_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"concurrency": 2}"#).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.min_tick_interval_ms, 1_000);
        assert_eq!(config.cooldown_check_interval(), Duration::from_secs(1));
    }
}
