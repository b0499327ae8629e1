//! Condition definitions

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ConditionError;
use crate::aggregators::ChangeOptions;

/// Comparison applied between a value and a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(alias = "equal", alias = "==")]
    Eq,
    #[serde(alias = "not_equal", alias = "!=")]
    Ne,
    #[default]
    #[serde(alias = "greater_than", alias = ">")]
    Gt,
    #[serde(alias = "greater_equal", alias = ">=")]
    Gte,
    #[serde(alias = "less_than", alias = "<")]
    Lt,
    #[serde(alias = "less_equal", alias = "<=")]
    Lte,
}

impl FromStr for CompareOp {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" | "equal" | "==" => Ok(Self::Eq),
            "ne" | "not_equal" | "!=" => Ok(Self::Ne),
            "gt" | "greater_than" | ">" => Ok(Self::Gt),
            "gte" | "greater_equal" | ">=" => Ok(Self::Gte),
            "lt" | "less_than" | "<" => Ok(Self::Lt),
            "lte" | "less_equal" | "<=" => Ok(Self::Lte),
            _ => Err(ConditionError::Invalid {
                field: "operator",
                reason: format!("unknown compare operator: {s}"),
            }),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq => write!(f, "eq"),
            Self::Ne => write!(f, "ne"),
            Self::Gt => write!(f, "gt"),
            Self::Gte => write!(f, "gte"),
            Self::Lt => write!(f, "lt"),
            Self::Lte => write!(f, "lte"),
        }
    }
}

impl CompareOp {
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Eq => value == threshold,
            Self::Ne => value != threshold,
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
        }
    }
}

/// Which side of the rolling mean counts as a peak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakDirection {
    Above,
    Below,
    #[default]
    Both,
}

impl PeakDirection {
    /// Whether a detector signal (+1, -1, 0) is a peak in this direction
    pub fn accepts(&self, signal: i8) -> bool {
        match self {
            PeakDirection::Above => signal > 0,
            PeakDirection::Below => signal < 0,
            PeakDirection::Both => signal != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Threshold,
    Peak,
    Change,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::Threshold => write!(f, "threshold"),
            ConditionType::Peak => write!(f, "peak"),
            ConditionType::Change => write!(f, "change"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCondition {
    #[serde(default)]
    pub operator: CompareOp,
    pub error_threshold: f64,
    #[serde(default)]
    pub warning_threshold: Option<f64>,
}

fn default_lag() -> usize {
    30
}

fn default_influence() -> f64 {
    0.5
}

/// Smoothed z-score peak detection. Thresholds are in standard deviations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakCondition {
    pub error_threshold: f64,
    #[serde(default)]
    pub warning_threshold: Option<f64>,
    /// Number of filtered samples the rolling mean and deviation cover
    #[serde(default = "default_lag")]
    pub lag: usize,
    /// Weight in [0, 1] of a peak sample when folded into the filtered series
    #[serde(default = "default_influence")]
    pub influence: f64,
    #[serde(default)]
    pub direction: PeakDirection,
}

/// Threshold comparison applied to a windowed change value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangeCondition {
    #[serde(default)]
    pub operator: CompareOp,
    pub error_threshold: f64,
    #[serde(default)]
    pub warning_threshold: Option<f64>,
    #[serde(flatten)]
    pub change: ChangeOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Threshold(ThresholdCondition),
    Peak(PeakCondition),
    Change(ChangeCondition),
}

impl Condition {
    pub fn threshold(operator: CompareOp, error_threshold: f64) -> Self {
        Condition::Threshold(ThresholdCondition {
            operator,
            error_threshold,
            warning_threshold: None,
        })
    }

    pub fn peak(error_threshold: f64) -> Self {
        Condition::Peak(PeakCondition {
            error_threshold,
            warning_threshold: None,
            lag: default_lag(),
            influence: default_influence(),
            direction: PeakDirection::Both,
        })
    }

    pub fn change(operator: CompareOp, error_threshold: f64, change: ChangeOptions) -> Self {
        Condition::Change(ChangeCondition {
            operator,
            error_threshold,
            warning_threshold: None,
            change,
        })
    }

    /// Set the warning tier
    pub fn with_warning(mut self, threshold: f64) -> Self {
        match &mut self {
            Condition::Threshold(c) => c.warning_threshold = Some(threshold),
            Condition::Peak(c) => c.warning_threshold = Some(threshold),
            Condition::Change(c) => c.warning_threshold = Some(threshold),
        }
        self
    }

    pub fn condition_type(&self) -> ConditionType {
        match self {
            Condition::Threshold(_) => ConditionType::Threshold,
            Condition::Peak(_) => ConditionType::Peak,
            Condition::Change(_) => ConditionType::Change,
        }
    }

    pub fn error_threshold(&self) -> f64 {
        match self {
            Condition::Threshold(c) => c.error_threshold,
            Condition::Peak(c) => c.error_threshold,
            Condition::Change(c) => c.error_threshold,
        }
    }

    pub fn warning_threshold(&self) -> Option<f64> {
        match self {
            Condition::Threshold(c) => c.warning_threshold,
            Condition::Peak(c) => c.warning_threshold,
            Condition::Change(c) => c.warning_threshold,
        }
    }

    pub fn validate(&self) -> Result<(), ConditionError> {
        check_finite("error_threshold", self.error_threshold())?;
        if let Some(warning) = self.warning_threshold() {
            check_finite("warning_threshold", warning)?;
        }

        match self {
            Condition::Threshold(_) => Ok(()),
            Condition::Peak(c) => {
                if c.lag < 2 {
                    return Err(ConditionError::Invalid {
                        field: "lag",
                        reason: format!("must be at least 2, got {}", c.lag),
                    });
                }
                if !(0.0..=1.0).contains(&c.influence) {
                    return Err(ConditionError::Invalid {
                        field: "influence",
                        reason: format!("must be in [0, 1], got {}", c.influence),
                    });
                }
                if c.error_threshold <= 0.0 || c.warning_threshold.map_or(false, |w| w <= 0.0) {
                    return Err(ConditionError::Invalid {
                        field: "error_threshold",
                        reason: "peak thresholds must be positive".to_string(),
                    });
                }
                Ok(())
            }
            Condition::Change(c) => Ok(c.change.validate()?),
        }
    }
}

fn check_finite(field: &'static str, value: f64) -> Result<(), ConditionError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConditionError::Invalid {
            field,
            reason: format!("must be finite, got {}", value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_op_parse_and_check() {
        assert_eq!("greater_than".parse::<CompareOp>().unwrap(), CompareOp::Gt);
        assert_eq!("lte".parse::<CompareOp>().unwrap(), CompareOp::Lte);
        assert!("between".parse::<CompareOp>().is_err());

        assert!(CompareOp::Gte.check(5.0, 5.0));
        assert!(!CompareOp::Gt.check(5.0, 5.0));
        assert!(CompareOp::Ne.check(1.0, 2.0));
        assert_eq!(CompareOp::Lt.to_string(), "lt");
    }

    #[test]
    fn test_condition_json() {
        let json = r#"{"type":"threshold","operator":"greater_than","error_threshold":10,"warning_threshold":5}"#;
        let cond: Condition = serde_json::from_str(json).unwrap();
        assert_eq!(cond, Condition::threshold(CompareOp::Gt, 10.0).with_warning(5.0));

        let json = r#"{"type":"peak","error_threshold":3.5,"direction":"above"}"#;
        let cond: Condition = serde_json::from_str(json).unwrap();
        match cond {
            Condition::Peak(p) => {
                assert_eq!(p.lag, 30);
                assert_eq!(p.influence, 0.5);
                assert_eq!(p.direction, PeakDirection::Above);
            }
            other => panic!("unexpected {:?}", other),
        }

        let json = r#"{"type":"change","operator":"gt","error_threshold":0.5,"window_size":60000,"time_shift":60000,"use_percentage":true}"#;
        let cond: Condition = serde_json::from_str(json).unwrap();
        assert_eq!(cond.condition_type(), ConditionType::Change);
        assert!(cond.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut peak = Condition::peak(3.0);
        if let Condition::Peak(p) = &mut peak {
            p.influence = 1.5;
        }
        assert!(peak.validate().is_err());

        assert!(Condition::threshold(CompareOp::Gt, f64::NAN).validate().is_err());
        assert!(Condition::change(CompareOp::Gt, 1.0, ChangeOptions::new(0, 10))
            .validate()
            .is_err());
    }

    #[test]
    fn test_direction_accepts() {
        assert!(PeakDirection::Above.accepts(1));
        assert!(!PeakDirection::Above.accepts(-1));
        assert!(PeakDirection::Below.accepts(-1));
        assert!(PeakDirection::Both.accepts(-1));
        assert!(!PeakDirection::Both.accepts(0));
    }
}
