//! Rollout specification — the immutable plan for one rollout.
//!
//! A spec is pure configuration data. The state machine reads it but
//! never mutates it; a retry against a new target version builds a new
//! value with [`RolloutSpec::with_canary_version`].

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;
use crate::error::ValidationError;
use crate::types::{Comparator, Metric};

/// One traffic-weight plateau.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Percentage of traffic routed to the canary (1-100).
    #[serde(alias = "weight")]
    pub weight_percent: u8,
    /// How long the weight is held while analysis runs.
    #[serde(with = "duration::serde_str")]
    pub pause: Duration,
}

/// A step-analysis rule. The comparison is the *pass* condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCheck {
    pub name: String,
    pub metric: Metric,
    pub comparator: Comparator,
    pub threshold: f64,
    /// Failed samples in a row before the check fails.
    #[serde(default = "default_failures_to_fail")]
    pub consecutive_failures_to_fail: u32,
    #[serde(with = "duration::serde_str", alias = "interval")]
    pub evaluation_interval: Duration,
    /// Query window. Defaults to the evaluation interval.
    #[serde(default, with = "duration::serde_opt", skip_serializing_if = "Option::is_none")]
    pub window: Option<Duration>,
}

impl AnalysisCheck {
    pub fn query_window(&self) -> Duration {
        self.window.unwrap_or(self.evaluation_interval)
    }
}

/// A hard-stop rule. The comparison is the *breach* condition: when it
/// holds for any sample, the rollout aborts regardless of step checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackThreshold {
    pub name: String,
    pub metric: Metric,
    pub comparator: Comparator,
    pub threshold: f64,
    #[serde(
        with = "duration::serde_str",
        alias = "interval",
        default = "default_rollback_interval"
    )]
    pub evaluation_interval: Duration,
    #[serde(default, with = "duration::serde_opt", skip_serializing_if = "Option::is_none")]
    pub window: Option<Duration>,
}

impl RollbackThreshold {
    pub fn query_window(&self) -> Duration {
        self.window.unwrap_or(self.evaluation_interval)
    }
}

/// Immutable per-rollout configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutSpec {
    /// The workload being rolled out. At most one active rollout per workload.
    pub workload: String,
    pub stable_version: String,
    pub canary_version: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub checks: Vec<AnalysisCheck>,
    #[serde(default)]
    pub rollback_thresholds: Vec<RollbackThreshold>,
    /// How long 100% canary traffic is validated before success.
    /// Defaults to the last step's pause.
    #[serde(default, with = "duration::serde_opt", skip_serializing_if = "Option::is_none")]
    pub promotion_window: Option<Duration>,
}

fn default_failures_to_fail() -> u32 {
    1
}

fn default_rollback_interval() -> Duration {
    Duration::from_secs(10)
}

impl RolloutSpec {
    /// Check structural invariants. Must pass before any traffic change.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workload.trim().is_empty() {
            return Err(ValidationError::EmptyWorkload);
        }
        if self.stable_version.is_empty()
            || self.canary_version.is_empty()
            || self.stable_version == self.canary_version
        {
            return Err(ValidationError::Versions);
        }
        if self.steps.is_empty() {
            return Err(ValidationError::NoSteps);
        }

        let mut previous = 0u8;
        for (index, step) in self.steps.iter().enumerate() {
            let weight = step.weight_percent;
            if weight == 0 || weight > 100 {
                return Err(ValidationError::WeightOutOfRange { index, weight });
            }
            if index > 0 && weight <= previous {
                return Err(ValidationError::WeightNotIncreasing {
                    index,
                    weight,
                    previous,
                });
            }
            previous = weight;
        }
        if previous != 100 {
            return Err(ValidationError::LastStepNotFull(previous));
        }

        let mut names = HashSet::new();
        for check in &self.checks {
            if !names.insert(check.name.as_str()) {
                return Err(ValidationError::DuplicateCheck(check.name.clone()));
            }
            if check.consecutive_failures_to_fail == 0 {
                return Err(ValidationError::FailuresToFail(check.name.clone()));
            }
            if check.evaluation_interval.is_zero() {
                return Err(ValidationError::ZeroInterval(check.name.clone()));
            }
            if !check.threshold.is_finite() {
                return Err(ValidationError::NonFiniteThreshold(check.name.clone()));
            }
        }
        for rule in &self.rollback_thresholds {
            if rule.evaluation_interval.is_zero() {
                return Err(ValidationError::ZeroInterval(rule.name.clone()));
            }
            if !rule.threshold.is_finite() {
                return Err(ValidationError::NonFiniteThreshold(rule.name.clone()));
            }
        }
        Ok(())
    }

    /// Weight mandated by step `index`.
    pub fn weight_at(&self, index: usize) -> Option<u8> {
        self.steps.get(index).map(|s| s.weight_percent)
    }

    pub fn last_step_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    /// Duration of the final validation window at 100%.
    pub fn promotion_window(&self) -> Duration {
        self.promotion_window
            .or_else(|| self.steps.last().map(|s| s.pause))
            .unwrap_or_default()
    }

    /// A copy of this spec targeting another canary version.
    pub fn with_canary_version(&self, version: &str) -> Self {
        Self {
            canary_version: version.to_string(),
            ..self.clone()
        }
    }
}
