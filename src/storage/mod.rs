pub mod chunked;
pub mod engine;
pub mod memory;
pub mod transition;

pub use chunked::ChunkedAssociativeArray;
pub use engine::{
    decode_alert, queue_lock_key, rule_alerts_key, AlertStore, StoreError, ALERTS_KEY, METRICS_KEY, RULES_KEY,
};
pub use memory::InMemoryStore;
pub use transition::{
    AlertMutation, CircuitState, RuleAction, RuleAlertState, TransitionResult, TransitionStatus,
};
