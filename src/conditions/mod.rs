//! Rule conditions
//!
//! A condition evaluator maps each metric value to an [`EvaluationResult`].
//! `success` means the condition is not violated; `error_level` says how
//! badly it is violated otherwise.

pub mod change;
pub mod config;
pub mod peak;
pub mod threshold;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use change::ChangeEvaluator;
pub use config::{
    ChangeCondition, CompareOp, Condition, ConditionType, PeakCondition, PeakDirection,
    ThresholdCondition,
};
pub use peak::{PeakEvaluator, ZScoreDetector};
pub use threshold::ThresholdEvaluator;

use crate::aggregators::AggregatorError;
use crate::clock::SharedClock;

/// Severity of a violated condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorLevel {
    #[default]
    None,
    Warning,
    Critical,
}

impl ErrorLevel {
    pub fn is_error(&self) -> bool {
        *self != ErrorLevel::None
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorLevel::None => write!(f, "NONE"),
            ErrorLevel::Warning => write!(f, "WARNING"),
            ErrorLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Evaluator specific detail kept with alerts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluationState {
    Threshold {
        /// Threshold that was crossed, if any
        threshold: Option<f64>,
    },
    Peak {
        signal: i8,
        mean: f64,
        std_dev: f64,
    },
    Change {
        change: f64,
        full_window: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub success: bool,
    pub error_level: ErrorLevel,
    pub value: f64,
    pub state: EvaluationState,
}

impl EvaluationResult {
    pub fn new(value: f64, error_level: ErrorLevel, state: EvaluationState) -> Self {
        Self {
            success: !error_level.is_error(),
            error_level,
            value,
            state,
        }
    }
}

/// Stateful mapping from metric values to evaluation results
pub trait ConditionEvaluator: Send + Sync + fmt::Debug {
    fn condition_type(&self) -> ConditionType;

    fn evaluate(&mut self, value: f64) -> EvaluationResult;
}

/// Condition errors
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("Invalid condition field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Invalid change options: {0}")]
    Aggregator(#[from] AggregatorError),

    #[error("No evaluator registered for condition type '{0}'")]
    Unsupported(ConditionType),
}

pub type EvaluatorFactory =
    fn(&Condition, &SharedClock) -> Result<Box<dyn ConditionEvaluator>, ConditionError>;

/// Maps condition type tags to evaluator factories
#[derive(Clone)]
pub struct EvaluatorRegistry {
    factories: HashMap<ConditionType, EvaluatorFactory>,
}

impl fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluatorRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EvaluatorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: ConditionType, factory: EvaluatorFactory) {
        self.factories.insert(kind, factory);
    }

    /// Validate `condition` and build its evaluator
    pub fn create(
        &self,
        condition: &Condition,
        clock: &SharedClock,
    ) -> Result<Box<dyn ConditionEvaluator>, ConditionError> {
        condition.validate()?;
        let kind = condition.condition_type();
        let factory = self
            .factories
            .get(&kind)
            .ok_or(ConditionError::Unsupported(kind))?;
        factory(condition, clock)
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(ConditionType::Threshold, create_evaluator);
        registry.register(ConditionType::Peak, create_evaluator);
        registry.register(ConditionType::Change, create_evaluator);
        registry
    }
}

/// Build the built-in evaluator for `condition`
pub fn create_evaluator(
    condition: &Condition,
    clock: &SharedClock,
) -> Result<Box<dyn ConditionEvaluator>, ConditionError> {
    let evaluator: Box<dyn ConditionEvaluator> = match condition {
        Condition::Threshold(c) => Box::new(ThresholdEvaluator::new(*c)),
        Condition::Peak(c) => Box::new(PeakEvaluator::new(*c)),
        Condition::Change(c) => Box::new(ChangeEvaluator::new(*c, clock.clone())?),
    };
    Ok(evaluator)
}
