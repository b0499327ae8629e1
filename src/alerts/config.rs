//! Rule configuration types

use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

/// Visible rule state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleState {
    #[default]
    Normal,
    Warning,
    Error,
    Muted,
}

impl std::fmt::Display for RuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleState::Normal => write!(f, "NORMAL"),
            RuleState::Warning => write!(f, "WARNING"),
            RuleState::Error => write!(f, "ERROR"),
            RuleState::Muted => write!(f, "MUTED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

/// Debounce and rate limiting of a rule's alerts (durations in ms)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleAlertOptions {
    /// Evaluations are ignored for this long after the rule starts
    pub warmup_window: i64,
    /// Consecutive failures needed to trip
    pub failure_threshold: u32,
    /// Uninterrupted success needed before an open alert closes
    pub recovery_window: i64,
    /// Minimum gap between two notifications of the same alert
    pub notify_interval: i64,
    /// Cap on notifications per alert
    pub max_alerts_per_event: Option<u32>,
    /// Notify when the alert closes
    pub alert_on_reset: bool,
}

impl Default for RuleAlertOptions {
    fn default() -> Self {
        Self {
            warmup_window: 0,
            failure_threshold: 1,
            recovery_window: 0,
            notify_interval: 0,
            max_alerts_per_event: None,
            alert_on_reset: false,
        }
    }
}

impl RuleAlertOptions {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_window(mut self, window: i64) -> Self {
        self.recovery_window = window;
        self
    }

    pub fn with_notify_interval(mut self, interval: i64) -> Self {
        self.notify_interval = interval;
        self
    }

    pub fn with_warmup_window(mut self, window: i64) -> Self {
        self.warmup_window = window;
        self
    }

    pub fn with_max_alerts(mut self, max: u32) -> Self {
        self.max_alerts_per_event = Some(max);
        self
    }

    pub fn with_alert_on_reset(mut self, enabled: bool) -> Self {
        self.alert_on_reset = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.warmup_window < 0 || self.recovery_window < 0 || self.notify_interval < 0 {
            return Err("durations must not be negative".to_string());
        }
        if self.max_alerts_per_event == Some(0) {
            return Err("max_alerts_per_event must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Alerting rule attached to a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub metric_id: String,
    pub condition: Condition,
    #[serde(default)]
    pub alert_options: RuleAlertOptions,
    /// Notification channel names
    #[serde(default)]
    pub channels: Vec<String>,
    /// Opaque data handed to notification templates
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub state: RuleState,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_active() -> bool {
    true
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        metric_id: impl Into<String>,
        condition: Condition,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            metric_id: metric_id.into(),
            condition,
            alert_options: RuleAlertOptions::default(),
            channels: Vec::new(),
            payload: None,
            severity: Severity::default(),
            is_active: true,
            state: RuleState::Normal,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_alert_options(mut self, options: RuleAlertOptions) -> Self {
        self.alert_options = options;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    /// Check everything except metric existence
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if self.metric_id.trim().is_empty() {
            return Err("metric_id must not be empty".to_string());
        }
        self.condition.validate().map_err(|e| e.to_string())?;
        self.alert_options.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::CompareOp;

    #[test]
    fn test_rule_json_defaults() {
        let json = r#"{
            "id": "r1",
            "name": "Slow jobs",
            "metric_id": "m1",
            "condition": {"type": "threshold", "operator": "gt", "error_threshold": 500},
            "alert_options": {"failure_threshold": 3, "notify_interval": 60000}
        }"#;
        let rule: Rule = serde_json::from_str(json).unwrap();

        assert!(rule.is_active);
        assert_eq!(rule.state, RuleState::Normal);
        assert_eq!(rule.alert_options.failure_threshold, 3);
        assert_eq!(rule.alert_options.notify_interval, 60_000);
        assert_eq!(rule.alert_options.recovery_window, 0);
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_rule_validation() {
        let rule = Rule::new("r1", "", "m1", Condition::threshold(CompareOp::Gt, 1.0));
        assert!(rule.validate().is_err());

        let rule = Rule::new("r1", "n", "m1", Condition::threshold(CompareOp::Gt, 1.0))
            .with_alert_options(RuleAlertOptions::default().with_failure_threshold(0));
        assert!(rule.validate().is_err());
    }
}
