//! Alert records

use serde::{Deserialize, Serialize};

use super::config::Severity;
use crate::conditions::{ErrorLevel, EvaluationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Close,
}

/// Alert raised when a rule trips, closed when it recovers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAlert {
    pub id: String,
    pub rule_id: String,
    /// Metric value that tripped the rule
    pub value: f64,
    pub error_level: ErrorLevel,
    pub status: AlertStatus,
    pub raised_at: i64,
    #[serde(default)]
    pub reset_at: Option<i64>,
    pub message: String,
    /// Consecutive failures when raised
    pub failures: u32,
    pub severity: Severity,
    /// Evaluation detail at trip time
    #[serde(default)]
    pub state: Option<EvaluationState>,
}

impl RuleAlert {
    pub fn is_open(&self) -> bool {
        self.status == AlertStatus::Open
    }
}

/// Alert content prepared by the caller; the store assigns id and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDraft {
    pub value: f64,
    pub error_level: ErrorLevel,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub state: Option<EvaluationState>,
}

impl AlertDraft {
    pub fn into_alert(self, id: String, rule_id: &str, raised_at: i64, failures: u32) -> RuleAlert {
        RuleAlert {
            id,
            rule_id: rule_id.to_string(),
            value: self.value,
            error_level: self.error_level,
            status: AlertStatus::Open,
            raised_at,
            reset_at: None,
            message: self.message,
            failures,
            severity: self.severity,
            state: self.state,
        }
    }
}

/// Random alert identifier
pub fn new_alert_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("alert-{:016x}", rng.gen::<u64>())
}
