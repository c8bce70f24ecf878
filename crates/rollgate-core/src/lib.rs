//! rollgate-core — shared types for the Rollgate progressive-delivery controller.
//!
//! Holds the immutable rollout specification (`RolloutSpec`), the metric
//! and verdict vocabulary shared by the analysis engine and the state
//! machine, the daemon configuration file, and spec validation.

pub mod config;
pub mod duration;
pub mod error;
pub mod spec;
pub mod types;

pub use config::{DaemonConfig, RolloutManifest, ServicePools};
pub use error::ValidationError;
pub use spec::{AnalysisCheck, RollbackThreshold, RolloutSpec, Step};
pub use types::*;
