//! Per-rule alert lifecycle
//!
//! [`RuleAlerter`] sends every evaluation result through the store's atomic
//! transition and acts on the answer: it mirrors the durable state, publishes
//! state changes and alerts, sends notifications while this process owns the
//! queue's notification lease and runs the cooldown re-check timer while the
//! rule is tripped. Transitions of one alerter run one at a time.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::alert::AlertDraft;
use super::config::Rule;
use super::lease::NotifyLease;
use super::notifier::{Notifier, ALERT_RENOTIFY, ALERT_RESET, ALERT_TRIGGERED};
use crate::bus::{EngineEvent, EventBus};
use crate::clock::SharedClock;
use crate::conditions::{ErrorLevel, EvaluationResult};
use crate::storage::{
    AlertStore, RuleAction, RuleAlertState, StoreError, TransitionResult, TransitionStatus, RULES_KEY,
};

/// Collaborators shared by every alerter
#[derive(Clone)]
pub struct AlertServices {
    pub store: Arc<dyn AlertStore>,
    pub clock: SharedClock,
    pub bus: EventBus,
    pub notifier: Arc<dyn Notifier>,
    /// Notification lease of the watched queue
    pub lease: Arc<NotifyLease>,
    pub cooldown_check_interval: Duration,
}

pub struct RuleAlerter {
    rule: Arc<RwLock<Rule>>,
    services: AlertServices,
    mirror: Mutex<RuleAlertState>,
    cooldown: Mutex<Option<JoinHandle<()>>>,
    /// Held for a whole transition so results are applied in commit order
    turn: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for RuleAlerter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleAlerter")
            .field("rule_id", &self.rule_id())
            .field("state", &*self.mirror.lock())
            .finish()
    }
}

impl RuleAlerter {
    pub fn new(rule: Arc<RwLock<Rule>>, services: AlertServices) -> Arc<Self> {
        Arc::new(Self {
            rule,
            services,
            mirror: Mutex::new(RuleAlertState::default()),
            cooldown: Mutex::new(None),
            turn: tokio::sync::Mutex::new(()),
        })
    }

    pub fn rule_id(&self) -> String {
        self.rule.read().id.clone()
    }

    /// Last durable state returned by the store
    pub fn state(&self) -> RuleAlertState {
        self.mirror.lock().clone()
    }

    pub fn has_cooldown_timer(&self) -> bool {
        self.cooldown
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Activate the rule; evaluations are ignored for the warmup window
    pub async fn start(self: &Arc<Self>) -> Result<TransitionResult, StoreError> {
        self.run(RuleAction::Start, false).await
    }

    /// Deactivate the rule, closing any open alert without notification
    pub async fn stop(self: &Arc<Self>) -> Result<TransitionResult, StoreError> {
        self.run(RuleAction::Stop, false).await
    }

    /// Feed one evaluation result. Store errors are logged and the cycle is
    /// skipped.
    pub async fn handle_result(self: &Arc<Self>, result: EvaluationResult) -> Option<TransitionResult> {
        let (options, draft) = {
            let rule = self.rule.read();
            (rule.alert_options, draft_for(&rule, &result))
        };
        let action = RuleAction::Check {
            result,
            options,
            draft,
            can_notify: self.services.lease.ensure().await,
        };
        match self.run(action, false).await {
            Ok(transition) => Some(transition),
            Err(e) => {
                tracing::warn!(rule_id = %self.rule_id(), error = %e, "Rule transition failed, skipping evaluation");
                None
            }
        }
    }

    /// Re-check whether a tripped rule has recovered
    pub async fn check_cooldown(self: &Arc<Self>) -> Result<TransitionResult, StoreError> {
        self.clear(false).await
    }

    /// Raise an alert by hand
    pub async fn trigger_manual(
        self: &Arc<Self>,
        message: impl Into<String>,
        error_level: ErrorLevel,
    ) -> Result<TransitionResult, StoreError> {
        let (draft, options) = {
            let rule = self.rule.read();
            let draft = AlertDraft {
                value: 0.0,
                error_level,
                message: message.into(),
                severity: rule.severity,
                state: None,
            };
            (draft, rule.alert_options)
        };
        let action = RuleAction::Alert {
            draft,
            options,
            can_notify: self.services.lease.ensure().await,
        };
        self.run(action, false).await
    }

    /// Record a notification sent by someone else
    pub async fn mark_notified(self: &Arc<Self>) -> Result<TransitionResult, StoreError> {
        let options = self.rule.read().alert_options;
        self.run(RuleAction::MarkNotify { options }, false).await
    }

    /// Reload the durable state into the mirror
    pub async fn refresh(self: &Arc<Self>) -> Result<TransitionResult, StoreError> {
        self.run(RuleAction::State, false).await
    }

    /// Stop the cooldown timer. The durable state is left alone.
    pub fn destroy(&self) {
        self.cancel_cooldown(false);
    }

    async fn clear(self: &Arc<Self>, from_timer: bool) -> Result<TransitionResult, StoreError> {
        let options = self.rule.read().alert_options;
        let action = RuleAction::Clear {
            options,
            can_notify: self.services.lease.ensure().await,
        };
        self.run(action, from_timer).await
    }

    async fn run(self: &Arc<Self>, action: RuleAction, from_timer: bool) -> Result<TransitionResult, StoreError> {
        let _turn = self.turn.lock().await;
        let rule_id = self.rule_id();
        let now = self.services.clock.now();
        let action_name = action.name();
        let transition = self
            .services
            .store
            .transition_rule_state(&rule_id, action, now)
            .await?;

        tracing::debug!(
            rule_id = %rule_id,
            action = action_name,
            status = ?transition.status,
            failures = transition.failures,
            alert_count = transition.alert_count,
            "Rule transition"
        );

        self.apply(&transition, now, from_timer).await;
        Ok(transition)
    }

    async fn apply(self: &Arc<Self>, transition: &TransitionResult, now: i64, from_timer: bool) {
        *self.mirror.lock() = transition.snapshot.clone();
        self.sync_rule_state(transition, now).await;

        match transition.status {
            TransitionStatus::Triggered => {
                if let Some(alert) = &transition.alert {
                    tracing::info!(rule_id = %alert.rule_id, alert_id = %alert.id, level = %alert.error_level, "Alert triggered");
                    self.services.bus.publish(EngineEvent::AlertTriggered { alert: alert.clone() });
                }
            }
            TransitionStatus::Reset => {
                self.cancel_cooldown(from_timer);
                if let Some(alert) = &transition.alert {
                    tracing::info!(rule_id = %alert.rule_id, alert_id = %alert.id, "Alert reset");
                    self.services.bus.publish(EngineEvent::AlertReset { alert: alert.clone() });
                }
            }
            TransitionStatus::Stopped | TransitionStatus::Inactive => self.cancel_cooldown(from_timer),
            _ => {}
        }

        let snapshot = &transition.snapshot;
        if snapshot.active && snapshot.circuit_state.is_tripped() {
            self.arm_cooldown();
        }

        if transition.notify {
            // the first notification of an alert may come after the trip when
            // the lease was held elsewhere at trip time
            let event = match transition.status {
                TransitionStatus::Reset => ALERT_RESET,
                _ if transition.alert_count <= 1 => ALERT_TRIGGERED,
                _ => ALERT_RENOTIFY,
            };
            self.notify(event, transition, now).await;
        }
    }

    /// Mirror the visible state into the rule, publish and persist changes
    async fn sync_rule_state(&self, transition: &TransitionResult, now: i64) {
        let visible = transition.snapshot.rule_state();
        let changed = {
            let mut rule = self.rule.write();
            if rule.state == visible {
                None
            } else {
                rule.state = visible;
                rule.updated_at = now;
                Some((rule.id.clone(), serde_json::to_string(&*rule)))
            }
        };

        let Some((rule_id, json)) = changed else {
            return;
        };

        tracing::info!(rule_id = %rule_id, state = %visible, "Rule state changed");
        self.services.bus.publish(EngineEvent::RuleStateChanged {
            rule_id: rule_id.clone(),
            state: visible,
            ts: now,
        });

        let result = match json {
            Ok(json) => self.services.store.hset(RULES_KEY, &rule_id, json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!(rule_id = %rule_id, error = %e, "Failed to persist rule state");
        }
    }

    async fn notify(&self, event: &str, transition: &TransitionResult, now: i64) {
        let (rule_id, context, channels) = {
            let rule = self.rule.read();
            let context = notification_context(&rule, self.services.lease.queue(), transition, now);
            (rule.id.clone(), context, rule.channels.clone())
        };

        if let Err(e) = self.services.notifier.dispatch(event, &context, &channels).await {
            tracing::error!(rule_id = %rule_id, event = %event, error = %e, "Failed to send notification");
        }
    }

    fn arm_cooldown(self: &Arc<Self>) {
        let mut slot = self.cooldown.lock();
        if slot.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.services.cooldown_check_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(alerter) = weak.upgrade() else {
                    break;
                };
                match alerter.clear(true).await {
                    Ok(transition) if transition.status == TransitionStatus::Cooldown => {}
                    Ok(_) => break,
                    Err(e) => {
                        tracing::warn!(rule_id = %alerter.rule_id(), error = %e, "Cooldown check failed");
                    }
                }
            }
        }));
    }

    /// Drop the cooldown timer. Called from inside the timer task the handle
    /// is released without aborting so the running check can finish.
    fn cancel_cooldown(&self, from_timer: bool) {
        if let Some(handle) = self.cooldown.lock().take() {
            if !from_timer {
                handle.abort();
            }
        }
    }
}

impl Drop for RuleAlerter {
    fn drop(&mut self) {
        if let Some(handle) = self.cooldown.get_mut().take() {
            handle.abort();
        }
    }
}

fn draft_for(rule: &Rule, result: &EvaluationResult) -> AlertDraft {
    AlertDraft {
        value: result.value,
        error_level: result.error_level,
        message: format!(
            "Rule '{}' is {}: value {}",
            rule.name, result.error_level, result.value
        ),
        severity: rule.severity,
        state: Some(result.state),
    }
}

fn notification_context(rule: &Rule, queue: &str, transition: &TransitionResult, now: i64) -> serde_json::Value {
    let message = transition
        .alert
        .as_ref()
        .map(|a| a.message.clone())
        .unwrap_or_else(|| format!("Rule '{}' is {}", rule.name, transition.snapshot.rule_state()));

    serde_json::json!({
        "rule": {
            "id": rule.id,
            "name": rule.name,
            "description": rule.description,
            "severity": rule.severity,
            "payload": rule.payload,
        },
        "queue": queue,
        "alert": transition.alert,
        "alert_id": transition.snapshot.alert_id,
        "state": transition.snapshot.rule_state(),
        "failures": transition.failures,
        "alert_count": transition.alert_count,
        "message": message,
        "ts": now,
    })
}
