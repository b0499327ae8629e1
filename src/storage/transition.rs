//! Rule state transition
//!
//! The circuit breaker behind every rule. [`apply`] is a pure function over
//! the durable [`RuleAlertState`]; a store runs it, together with the alert
//! writes it asks for, as one atomic step so several processes can evaluate
//! the same rule against shared state.

use serde::{Deserialize, Serialize};

use crate::alerts::{AlertDraft, RuleAlert, RuleAlertOptions, RuleState};
use crate::conditions::{ErrorLevel, EvaluationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    /// Tripped at warning level
    HalfOpen,
    /// Tripped at critical level
    Open,
}

impl CircuitState {
    pub fn is_tripped(&self) -> bool {
        *self != CircuitState::Closed
    }

    fn for_level(level: ErrorLevel) -> Self {
        match level {
            ErrorLevel::Warning => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

/// Durable per-rule alert state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleAlertState {
    pub circuit_state: CircuitState,
    pub active: bool,
    pub started_at: Option<i64>,
    /// Consecutive failures
    pub failures: u32,
    pub total_failures: u64,
    /// Consecutive successes
    pub successes: u32,
    /// Notifications sent for the open alert
    pub alert_count: u32,
    pub alert_id: Option<String>,
    pub error_level: ErrorLevel,
    pub last_failure: Option<i64>,
    pub last_triggered_at: Option<i64>,
    pub last_notify: Option<i64>,
}

impl RuleAlertState {
    /// Visible rule state derived from the circuit
    pub fn rule_state(&self) -> RuleState {
        if !self.active {
            return RuleState::Muted;
        }
        match self.circuit_state {
            CircuitState::Closed => RuleState::Normal,
            CircuitState::HalfOpen => RuleState::Warning,
            CircuitState::Open => RuleState::Error,
        }
    }
}

/// Operation requested from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RuleAction {
    Start,
    Stop,
    Check {
        result: EvaluationResult,
        options: RuleAlertOptions,
        draft: AlertDraft,
        /// Caller holds the notification lease; without it the notify
        /// budget is left untouched
        can_notify: bool,
    },
    /// Cooldown re-check without a new evaluation
    Clear {
        options: RuleAlertOptions,
        can_notify: bool,
    },
    /// Trip regardless of failure count, notifying within the throttle
    Alert {
        draft: AlertDraft,
        options: RuleAlertOptions,
        can_notify: bool,
    },
    /// Record a notification sent outside the transition
    MarkNotify { options: RuleAlertOptions },
    State,
}

impl RuleAction {
    pub fn name(&self) -> &'static str {
        match self {
            RuleAction::Start => "start",
            RuleAction::Stop => "stop",
            RuleAction::Check { .. } => "check",
            RuleAction::Clear { .. } => "clear",
            RuleAction::Alert { .. } => "alert",
            RuleAction::MarkNotify { .. } => "mark-notify",
            RuleAction::State => "state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStatus {
    Started,
    Stopped,
    Inactive,
    Warmup,
    /// Success while closed
    Ok,
    /// Failure below the threshold
    Pending,
    /// Circuit just tripped
    Triggered,
    /// Failure while tripped
    Alert,
    /// Success while tripped, recovery window not elapsed
    Cooldown,
    /// Circuit closed again
    Reset,
    Notified,
    State,
}

/// Alert write the store must perform with the transition
#[derive(Debug, Clone, PartialEq)]
pub enum AlertMutation {
    Create(RuleAlert),
    Escalate { alert_id: String, error_level: ErrorLevel },
    Close { alert_id: String, reset_at: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionResult {
    pub status: TransitionStatus,
    pub state: CircuitState,
    pub failures: u32,
    pub alert_count: u32,
    /// Caller should send a notification
    pub notify: bool,
    /// Time left until the rule may close (ms)
    pub end_delay: Option<i64>,
    /// Alert created, escalated or closed by this transition
    pub alert: Option<RuleAlert>,
    /// Full durable state after the transition
    pub snapshot: RuleAlertState,
}

/// Apply `action` at `now` to `state`. `next_id` is called once if an alert
/// is created.
pub fn apply(
    state: &mut RuleAlertState,
    rule_id: &str,
    action: RuleAction,
    now: i64,
    next_id: impl FnOnce() -> String,
) -> (TransitionResult, Option<AlertMutation>) {
    let mut step = Step::default();

    let status = match action {
        RuleAction::Start => {
            state.active = true;
            state.started_at = Some(now);
            TransitionStatus::Started
        }
        RuleAction::Stop => {
            state.active = false;
            state.failures = 0;
            state.successes = 0;
            if state.circuit_state.is_tripped() {
                step.mutation = close(state, now);
            }
            TransitionStatus::Stopped
        }
        RuleAction::Check {
            result,
            options,
            draft,
            can_notify,
        } => {
            step.can_notify = can_notify;
            if !state.active {
                TransitionStatus::Inactive
            } else if in_warmup(state, &options, now) {
                TransitionStatus::Warmup
            } else if result.success {
                on_success(state, &options, now, &mut step)
            } else {
                on_failure(state, rule_id, &result, &options, draft, now, next_id, &mut step)
            }
        }
        RuleAction::Clear { options, can_notify } => {
            step.can_notify = can_notify;
            if !state.active {
                TransitionStatus::Inactive
            } else if !state.circuit_state.is_tripped() {
                TransitionStatus::Ok
            } else {
                cooldown(state, &options, now, &mut step)
            }
        }
        RuleAction::Alert {
            draft,
            options,
            can_notify,
        } => {
            step.can_notify = can_notify;
            if !state.active {
                TransitionStatus::Inactive
            } else {
                state.last_failure = Some(now);
                state.successes = 0;
                let status = if state.circuit_state.is_tripped() {
                    escalate(state, draft.error_level, &mut step);
                    TransitionStatus::Alert
                } else {
                    trip(state, rule_id, draft, now, next_id, &mut step);
                    TransitionStatus::Triggered
                };
                throttled_notify(state, &options, now, &mut step);
                status
            }
        }
        RuleAction::MarkNotify { options } => {
            if under_cap(state, &options) {
                state.alert_count += 1;
                state.last_notify = Some(now);
            }
            TransitionStatus::Notified
        }
        RuleAction::State => TransitionStatus::State,
    };

    let alert = match &step.mutation {
        Some(AlertMutation::Create(alert)) => Some(alert.clone()),
        _ => None,
    };

    let result = TransitionResult {
        status,
        state: state.circuit_state,
        failures: state.failures,
        alert_count: state.alert_count,
        notify: step.notify,
        end_delay: step.end_delay,
        alert,
        snapshot: state.clone(),
    };
    (result, step.mutation)
}

#[derive(Default)]
struct Step {
    can_notify: bool,
    notify: bool,
    end_delay: Option<i64>,
    mutation: Option<AlertMutation>,
}

fn in_warmup(state: &RuleAlertState, options: &RuleAlertOptions, now: i64) -> bool {
    options.warmup_window > 0
        && state
            .started_at
            .map_or(false, |started| now - started < options.warmup_window)
}

#[allow(clippy::too_many_arguments)]
fn on_failure(
    state: &mut RuleAlertState,
    rule_id: &str,
    result: &EvaluationResult,
    options: &RuleAlertOptions,
    mut draft: AlertDraft,
    now: i64,
    next_id: impl FnOnce() -> String,
    step: &mut Step,
) -> TransitionStatus {
    state.failures += 1;
    state.total_failures += 1;
    state.successes = 0;
    state.last_failure = Some(now);

    let status = if state.circuit_state.is_tripped() {
        escalate(state, result.error_level, step);
        TransitionStatus::Alert
    } else if state.failures >= options.failure_threshold {
        draft.error_level = result.error_level;
        trip(state, rule_id, draft, now, next_id, step);
        TransitionStatus::Triggered
    } else {
        return TransitionStatus::Pending;
    };

    throttled_notify(state, options, now, step);
    status
}

fn on_success(
    state: &mut RuleAlertState,
    options: &RuleAlertOptions,
    now: i64,
    step: &mut Step,
) -> TransitionStatus {
    state.failures = 0;
    state.successes += 1;
    if !state.circuit_state.is_tripped() {
        return TransitionStatus::Ok;
    }

    cooldown(state, options, now, step)
}

/// Close the circuit if the recovery window has passed since the last
/// failure. A quiet window with no evaluations counts as recovery.
fn cooldown(
    state: &mut RuleAlertState,
    options: &RuleAlertOptions,
    now: i64,
    step: &mut Step,
) -> TransitionStatus {
    let elapsed = now - state.last_failure.unwrap_or(now);
    if elapsed >= options.recovery_window {
        step.mutation = close(state, now);
        step.notify = options.alert_on_reset && step.can_notify;
        TransitionStatus::Reset
    } else {
        step.end_delay = Some((options.recovery_window - elapsed).max(0));
        TransitionStatus::Cooldown
    }
}

fn trip(
    state: &mut RuleAlertState,
    rule_id: &str,
    draft: AlertDraft,
    now: i64,
    next_id: impl FnOnce() -> String,
    step: &mut Step,
) {
    let level = if draft.error_level.is_error() {
        draft.error_level
    } else {
        ErrorLevel::Critical
    };
    state.circuit_state = CircuitState::for_level(level);
    state.error_level = level;
    state.alert_count = 0;
    state.last_notify = None;
    state.last_triggered_at = Some(now);

    let mut alert = draft.into_alert(next_id(), rule_id, now, state.failures.max(1));
    alert.error_level = level;
    state.alert_id = Some(alert.id.clone());
    step.mutation = Some(AlertMutation::Create(alert));
}

/// Warning to critical while tripped
fn escalate(state: &mut RuleAlertState, level: ErrorLevel, step: &mut Step) {
    if state.circuit_state == CircuitState::HalfOpen && level == ErrorLevel::Critical {
        state.circuit_state = CircuitState::Open;
        state.error_level = ErrorLevel::Critical;
        if let Some(alert_id) = &state.alert_id {
            step.mutation = Some(AlertMutation::Escalate {
                alert_id: alert_id.clone(),
                error_level: ErrorLevel::Critical,
            });
        }
    }
}

fn close(state: &mut RuleAlertState, now: i64) -> Option<AlertMutation> {
    state.circuit_state = CircuitState::Closed;
    state.failures = 0;
    state.error_level = ErrorLevel::None;
    state.alert_count = 0;
    state.last_notify = None;
    state
        .alert_id
        .take()
        .map(|alert_id| AlertMutation::Close { alert_id, reset_at: now })
}

fn under_cap(state: &RuleAlertState, options: &RuleAlertOptions) -> bool {
    options
        .max_alerts_per_event
        .map_or(true, |max| state.alert_count < max)
}

/// Spend one notification if the caller may notify, the cap allows it and
/// the notify interval has passed
fn throttled_notify(state: &mut RuleAlertState, options: &RuleAlertOptions, now: i64, step: &mut Step) {
    let interval_elapsed = state
        .last_notify
        .map_or(true, |last| now - last >= options.notify_interval);
    if step.can_notify && under_cap(state, options) && interval_elapsed {
        state.alert_count += 1;
        state.last_notify = Some(now);
        step.notify = true;
    }
}
