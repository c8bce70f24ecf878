//! rollgate-metrics — health signal sources for rollout analysis.
//!
//! The analysis engine depends only on the [`MetricSource`] trait. Two
//! adapters ship here: a Prometheus HTTP query client and an in-process
//! per-cohort recorder. The crate also renders Prometheus text exposition
//! for the daemon's `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! MetricSource (trait)
//!   ├── PrometheusSource → GET /api/v1/query (PromQL templates per metric)
//!   └── CohortRecorder   ← record() per observed request, scoped by
//!                          {rollout_id}:{cohort}; windowed queries
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```
//!
//! A query distinguishes "zero samples" (`Ok` with `sample_count == 0`)
//! from a failed query (`Err`); the analysis engine treats the first as
//! inconclusive and the second as a transient error.

pub mod prometheus;
pub mod promql;
pub mod recorder;
pub mod source;

pub use prometheus::render_prometheus;
pub use promql::{PrometheusSource, QueryTemplates};
pub use recorder::{CohortRecorder, CohortSnapshot, CohortStats, cohort_labels};
pub use source::{MetricQueryError, MetricSample, MetricSource};
