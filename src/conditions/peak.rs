//! Smoothed z-score peak detection
//!
//! A detector keeps the last `lag` filtered samples and flags a new sample
//! whose distance from their mean exceeds `threshold` standard deviations.
//! Flagged samples enter the filtered series damped by `influence`, so a
//! burst of peaks does not drag the baseline along with it.

use std::collections::VecDeque;

use super::config::{ConditionType, PeakCondition};
use super::{ConditionEvaluator, ErrorLevel, EvaluationResult, EvaluationState};

/// Outcome of feeding one sample to a detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakSignal {
    /// +1 above, -1 below, 0 no peak
    pub signal: i8,
    /// Baseline mean the sample was compared against
    pub mean: f64,
    /// Baseline deviation the sample was compared against
    pub std_dev: f64,
}

#[derive(Debug, Clone)]
pub struct ZScoreDetector {
    lag: usize,
    threshold: f64,
    influence: f64,
    filtered: VecDeque<f64>,
    mean: f64,
    std_dev: f64,
}

impl ZScoreDetector {
    pub fn new(lag: usize, threshold: f64, influence: f64) -> Self {
        Self {
            lag: lag.max(1),
            threshold,
            influence,
            filtered: VecDeque::with_capacity(lag.max(1)),
            mean: 0.0,
            std_dev: 0.0,
        }
    }

    /// Whether `lag` samples have been seen
    pub fn is_ready(&self) -> bool {
        self.filtered.len() >= self.lag
    }

    pub fn update(&mut self, value: f64) -> PeakSignal {
        if !self.is_ready() {
            self.filtered.push_back(value);
            self.recompute();
            return PeakSignal {
                signal: 0,
                mean: self.mean,
                std_dev: self.std_dev,
            };
        }

        let baseline = PeakSignal {
            signal: 0,
            mean: self.mean,
            std_dev: self.std_dev,
        };

        let deviation = value - self.mean;
        let (signal, filtered) = if deviation.abs() > self.threshold * self.std_dev {
            let last = self.filtered.back().copied().unwrap_or(value);
            let signal = if deviation > 0.0 { 1 } else { -1 };
            (signal, self.influence * value + (1.0 - self.influence) * last)
        } else {
            (0, value)
        };

        self.filtered.pop_front();
        self.filtered.push_back(filtered);
        self.recompute();

        PeakSignal { signal, ..baseline }
    }

    fn recompute(&mut self) {
        let n = self.filtered.len() as f64;
        if n == 0.0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            return;
        }
        self.mean = self.filtered.iter().sum::<f64>() / n;
        let variance = self
            .filtered
            .iter()
            .map(|v| (v - self.mean).powi(2))
            .sum::<f64>()
            / n;
        self.std_dev = variance.sqrt();
    }
}

/// Peak condition with a mandatory error tier and an optional warning tier.
/// Both detectors see every sample.
#[derive(Debug, Clone)]
pub struct PeakEvaluator {
    condition: PeakCondition,
    error: ZScoreDetector,
    warning: Option<ZScoreDetector>,
}

impl PeakEvaluator {
    pub fn new(condition: PeakCondition) -> Self {
        let error = ZScoreDetector::new(condition.lag, condition.error_threshold, condition.influence);
        let warning = condition
            .warning_threshold
            .map(|t| ZScoreDetector::new(condition.lag, t, condition.influence));
        Self {
            condition,
            error,
            warning,
        }
    }
}

impl ConditionEvaluator for PeakEvaluator {
    fn condition_type(&self) -> ConditionType {
        ConditionType::Peak
    }

    fn evaluate(&mut self, value: f64) -> EvaluationResult {
        let direction = self.condition.direction;
        let error = self.error.update(value);
        let warning = self.warning.as_mut().map(|d| d.update(value));

        let (level, detail) = if direction.accepts(error.signal) {
            (ErrorLevel::Critical, error)
        } else {
            match warning {
                Some(w) if direction.accepts(w.signal) => (ErrorLevel::Warning, w),
                _ => (ErrorLevel::None, error),
            }
        };

        EvaluationResult::new(
            value,
            level,
            EvaluationState::Peak {
                signal: detail.signal,
                mean: detail.mean,
                std_dev: detail.std_dev,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::config::PeakDirection;

    fn baseline() -> [f64; 6] {
        [1.0, 1.1, 0.9, 1.0, 1.05, 0.95]
    }

    #[test]
    fn test_detector_silent_during_lag() {
        let mut detector = ZScoreDetector::new(6, 3.0, 0.0);
        for v in [1.0, 100.0, -100.0, 5.0, 1.0] {
            assert_eq!(detector.update(v).signal, 0);
        }
        assert!(!detector.is_ready());
    }

    #[test]
    fn test_detector_signals() {
        let mut detector = ZScoreDetector::new(6, 3.0, 0.0);
        for v in baseline() {
            detector.update(v);
        }
        assert!(detector.is_ready());
        assert_eq!(detector.update(1.02).signal, 0);
        assert_eq!(detector.update(10.0).signal, 1);
        // zero influence keeps the peak out of the baseline
        assert_eq!(detector.update(-10.0).signal, -1);
        assert_eq!(detector.update(1.0).signal, 0);
    }

    #[test]
    fn test_influence_moves_baseline() {
        let mut damped = ZScoreDetector::new(6, 3.0, 0.0);
        let mut influenced = ZScoreDetector::new(6, 3.0, 1.0);
        for v in baseline() {
            damped.update(v);
            influenced.update(v);
        }
        damped.update(50.0);
        influenced.update(50.0);

        let d = damped.update(1.0);
        let i = influenced.update(1.0);
        assert!(i.mean > d.mean);
        assert!(i.std_dev > d.std_dev);
    }

    #[test]
    fn test_evaluator_tiers_and_direction() {
        let condition = PeakCondition {
            error_threshold: 50.0,
            warning_threshold: Some(3.0),
            lag: 6,
            influence: 0.0,
            direction: PeakDirection::Above,
        };
        let mut eval = PeakEvaluator::new(condition);
        for v in baseline() {
            assert!(eval.evaluate(v).success);
        }

        // just over 3 deviations: warning tier only
        let warn = eval.evaluate(1.2);
        assert_eq!(warn.error_level, ErrorLevel::Warning);

        let crit = eval.evaluate(100.0);
        assert_eq!(crit.error_level, ErrorLevel::Critical);
        assert!(matches!(crit.state, EvaluationState::Peak { signal: 1, .. }));

        // below the baseline is not a peak when only ABOVE counts
        assert!(eval.evaluate(-100.0).success);
    }
}
