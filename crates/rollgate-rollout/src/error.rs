use thiserror::Error;

use rollgate_core::ValidationError;
use rollgate_state::StateError;
use rollgate_traffic::TrafficError;

/// Errors returned by controller operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid rollout spec: {0}")]
    Validation(#[from] ValidationError),

    #[error("rollout not found: {0}")]
    NotFound(String),

    #[error("workload {workload} already has an active rollout: {holder}")]
    AlreadyActive { workload: String, holder: String },

    /// The command does not apply to the rollout's current phase.
    #[error("{0}")]
    OverrideConflict(String),

    #[error("state store error: {0}")]
    Store(#[from] StateError),

    #[error("traffic splitter error: {0}")]
    Traffic(#[from] TrafficError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
