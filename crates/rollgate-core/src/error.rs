//! Validation errors for rollout specifications.

use thiserror::Error;

/// A malformed rollout spec. Rejected before any traffic change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workload name must not be empty")]
    EmptyWorkload,

    #[error("rollout must have at least one step")]
    NoSteps,

    #[error("step {index}: weight {weight} outside (0, 100]")]
    WeightOutOfRange { index: usize, weight: u8 },

    #[error("step {index}: weight {weight} must be greater than previous weight {previous}")]
    WeightNotIncreasing { index: usize, weight: u8, previous: u8 },

    #[error("last step must route 100% of traffic, got {0}%")]
    LastStepNotFull(u8),

    #[error("stable and canary versions must be set and differ")]
    Versions,

    #[error("duplicate check name: {0}")]
    DuplicateCheck(String),

    #[error("check {0}: consecutive_failures_to_fail must be at least 1")]
    FailuresToFail(String),

    #[error("{0}: evaluation interval must be non-zero")]
    ZeroInterval(String),

    #[error("{0}: threshold must be a finite number")]
    NonFiniteThreshold(String),
}
