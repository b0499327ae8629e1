use super::config::{ChangeCondition, ConditionType};
use super::threshold::classify;
use super::{ConditionError, ConditionEvaluator, ErrorLevel, EvaluationResult, EvaluationState};
use crate::aggregators::{Aggregator, ChangeAggregator};
use crate::clock::SharedClock;

/// Threshold check over the change between two shifted windows of metric
/// values. Samples are stamped with the clock time of evaluation.
#[derive(Debug)]
pub struct ChangeEvaluator {
    condition: ChangeCondition,
    aggregator: ChangeAggregator,
    clock: SharedClock,
}

impl ChangeEvaluator {
    pub fn new(condition: ChangeCondition, clock: SharedClock) -> Result<Self, ConditionError> {
        let aggregator = ChangeAggregator::new(&condition.change)?;
        Ok(Self {
            condition,
            aggregator,
            clock,
        })
    }
}

impl ConditionEvaluator for ChangeEvaluator {
    fn condition_type(&self) -> ConditionType {
        ConditionType::Change
    }

    fn evaluate(&mut self, value: f64) -> EvaluationResult {
        let now = self.clock.now();
        let change = self.aggregator.update(value, now);
        let full_window = self.aggregator.is_full_window(now);

        // no verdict until both windows hold data
        let level = if full_window {
            classify(
                self.condition.operator,
                change,
                self.condition.error_threshold,
                self.condition.warning_threshold,
            )
            .0
        } else {
            ErrorLevel::None
        };

        EvaluationResult::new(value, level, EvaluationState::Change { change, full_window })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregators::ChangeOptions;
    use crate::clock::ManualClock;
    use crate::conditions::config::CompareOp;
    use std::sync::Arc;

    #[test]
    fn test_change_fires_on_growth() {
        let clock = Arc::new(ManualClock::new(0));
        let condition = ChangeCondition {
            operator: CompareOp::Gt,
            error_threshold: 1.0,
            warning_threshold: Some(0.2),
            change: ChangeOptions::new(4_000, 4_000)
                .with_sample_interval(1_000)
                .with_percentage(true),
        };
        let mut eval = ChangeEvaluator::new(condition, clock.clone()).unwrap();

        // flat for two windows
        for _ in 0..=8 {
            let result = eval.evaluate(10.0);
            assert!(result.success);
            clock.advance_by(1_000);
        }

        // doubling against the previous window
        let mut last = eval.evaluate(10.0);
        for _ in 0..4 {
            clock.advance_by(1_000);
            last = eval.evaluate(30.0);
        }
        assert_eq!(last.error_level, ErrorLevel::Critical);
        match last.state {
            EvaluationState::Change { change, full_window } => {
                assert!(full_window);
                assert!(change > 1.0);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_no_verdict_before_full_window() {
        let clock = Arc::new(ManualClock::new(0));
        let condition = ChangeCondition {
            operator: CompareOp::Lt,
            error_threshold: 1.0,
            warning_threshold: None,
            change: ChangeOptions::new(10_000, 10_000),
        };
        let mut eval = ChangeEvaluator::new(condition, clock).unwrap();
        // a zero change would satisfy `lt 1`, but the windows are not filled yet
        assert!(eval.evaluate(5.0).success);
    }
}
