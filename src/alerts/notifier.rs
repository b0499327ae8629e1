//! Notification dispatch
//!
//! Delivery to real channels lives outside this crate; it plugs in through
//! [`Notifier`]. [`LogNotifier`] writes notifications to the log.

use async_trait::async_trait;

/// Notification sent when a rule trips
pub const ALERT_TRIGGERED: &str = "alert.triggered";
/// Repeated notification for an alert that is still open
pub const ALERT_RENOTIFY: &str = "alert.renotify";
/// Notification sent when an alert closes
pub const ALERT_RESET: &str = "alert.reset";

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `event` rendered from `context` to every channel
    async fn dispatch(
        &self,
        event: &str,
        context: &serde_json::Value,
        channels: &[String],
    ) -> Result<(), NotifierError>;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn dispatch(
        &self,
        event: &str,
        context: &serde_json::Value,
        channels: &[String],
    ) -> Result<(), NotifierError> {
        let rule_id = context
            .pointer("/rule/id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let message = context
            .pointer("/message")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if channels.is_empty() {
            tracing::warn!(event = %event, rule_id = %rule_id, "Alert notification: {}", message);
        }
        for channel in channels {
            tracing::warn!(
                event = %event,
                rule_id = %rule_id,
                channel = %channel,
                "Alert notification: {}",
                message
            );
        }
        Ok(())
    }
}

/// Notifier errors
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("Channel '{channel}' failed: {reason}")]
    Channel { channel: String, reason: String },

    #[error("Multiple notification failures: {0:?}")]
    Multiple(Vec<NotifierError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notification() {
        let notifier = LogNotifier::new();
        let context = serde_json::json!({
            "rule": {"id": "r1", "name": "Slow jobs"},
            "message": "latency above 500ms",
        });

        tokio_test::assert_ok!(
            notifier
                .dispatch(ALERT_TRIGGERED, &context, &["ops".to_string()])
                .await
        );
        tokio_test::assert_ok!(notifier.dispatch(ALERT_RESET, &context, &[]).await);
    }
}
