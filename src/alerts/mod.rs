//! Rules and their alert lifecycle
//!
//! A [`Rule`] watches one metric through a condition. The [`RuleManager`]
//! owns rule definitions; each live rule gets a [`RuleAlerter`] that turns
//! evaluation results into debounced alerts and notifications. Only the
//! holder of a queue's [`NotifyLease`] sends notifications.

pub mod alert;
pub mod alerter;
pub mod config;
pub mod lease;
pub mod manager;
pub mod notifier;

pub use alert::{new_alert_id, AlertDraft, AlertStatus, RuleAlert};
pub use alerter::{AlertServices, RuleAlerter};
pub use config::{Rule, RuleAlertOptions, RuleState, Severity};
pub use lease::NotifyLease;
pub use manager::{RuleError, RuleManager};
pub use notifier::{
    LogNotifier, Notifier, NotifierError, ALERT_RENOTIFY, ALERT_RESET, ALERT_TRIGGERED,
};
