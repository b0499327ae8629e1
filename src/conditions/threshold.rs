use super::config::{CompareOp, ConditionType, ThresholdCondition};
use super::{ConditionEvaluator, ErrorLevel, EvaluationResult, EvaluationState};

/// Classify `value` against an error tier and an optional warning tier
pub fn classify(
    operator: CompareOp,
    value: f64,
    error_threshold: f64,
    warning_threshold: Option<f64>,
) -> (ErrorLevel, Option<f64>) {
    if operator.check(value, error_threshold) {
        return (ErrorLevel::Critical, Some(error_threshold));
    }
    match warning_threshold {
        Some(warning) if operator.check(value, warning) => (ErrorLevel::Warning, Some(warning)),
        _ => (ErrorLevel::None, None),
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdEvaluator {
    condition: ThresholdCondition,
}

impl ThresholdEvaluator {
    pub fn new(condition: ThresholdCondition) -> Self {
        Self { condition }
    }
}

impl ConditionEvaluator for ThresholdEvaluator {
    fn condition_type(&self) -> ConditionType {
        ConditionType::Threshold
    }

    fn evaluate(&mut self, value: f64) -> EvaluationResult {
        let (level, threshold) = classify(
            self.condition.operator,
            value,
            self.condition.error_threshold,
            self.condition.warning_threshold,
        );
        EvaluationResult::new(value, level, EvaluationState::Threshold { threshold })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator(op: CompareOp, error: f64, warning: Option<f64>) -> ThresholdEvaluator {
        ThresholdEvaluator::new(ThresholdCondition {
            operator: op,
            error_threshold: error,
            warning_threshold: warning,
        })
    }

    #[test]
    fn test_two_tiers() {
        let mut eval = evaluator(CompareOp::Gt, 100.0, Some(50.0));

        let ok = eval.evaluate(10.0);
        assert!(ok.success);
        assert_eq!(ok.error_level, ErrorLevel::None);

        let warn = eval.evaluate(75.0);
        assert!(!warn.success);
        assert_eq!(warn.error_level, ErrorLevel::Warning);
        assert_eq!(warn.state, EvaluationState::Threshold { threshold: Some(50.0) });

        let crit = eval.evaluate(150.0);
        assert_eq!(crit.error_level, ErrorLevel::Critical);
        assert_eq!(crit.value, 150.0);
    }

    #[test]
    fn test_less_than_without_warning() {
        let mut eval = evaluator(CompareOp::Lt, 5.0, None);
        assert_eq!(eval.evaluate(4.0).error_level, ErrorLevel::Critical);
        assert!(eval.evaluate(5.0).success);
    }
}
