//! Rollgate rollout engine — per-rollout state machines and the
//! controller that owns them.
//!
//! # Components
//!
//! - **`machine`** — One task per rollout: applies step weights, holds
//!   them while analysis runs, promotes or rolls back
//! - **`controller`** — Starts, resumes and commands machines; enforces
//!   one active rollout per workload
//! - **`retry`** — Bounded exponential backoff for traffic writes
//! - **`alert`** — Alert types and sinks (log, memory, webhook)

pub mod alert;
pub mod controller;
pub mod error;
pub mod machine;
pub mod retry;

pub use alert::{
    Alert, AlertFanout, AlertKind, AlertSink, LogAlertSink, MemoryAlertSink, Severity,
    WebhookAlertSink,
};
pub use controller::RolloutController;
pub use error::{ControllerError, ControllerResult};
pub use machine::{Command, MachineDeps, MachineSettings, RolloutMachine};
pub use retry::{Backoff, set_weight_with_retry};
