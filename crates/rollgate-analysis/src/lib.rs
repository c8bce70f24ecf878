//! rollgate-analysis — evaluates a step's health checks against a metric
//! source.
//!
//! The engine runs a background task per check and per rollback
//! threshold. Each task queries the canary cohort on its own cadence and
//! folds the result into a shared [`AnalysisSnapshot`] published over a
//! `watch` channel. The state machine reads the aggregate verdict and the
//! breach flag from that snapshot; it never waits on a query.
//!
//! # Architecture
//!
//! ```text
//! AnalysisEngine::start_step()
//!   ├── Per-check task
//!   │   ├── MetricSource::query() under a timeout
//!   │   └── CheckTracker (consecutive failures, latched verdict)
//!   ├── Per-threshold task → Breach on a matching sample
//!   └── AnalysisHandle (verdict, snapshot, subscribe, stop)
//! ```
//!
//! Query errors are counted across every task of the step. The snapshot's
//! `consecutive_query_errors` resets on any successful query, including
//! one that found no samples.

pub mod checker;
pub mod engine;

pub use checker::{CheckTracker, SampleOutcome, evaluate_sample};
pub use engine::{AnalysisEngine, AnalysisHandle, AnalysisSnapshot, Breach, CheckStatus, EngineConfig};
