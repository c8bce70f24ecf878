//! The metric source contract.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use rollgate_core::{CohortLabels, Metric};

/// A windowed metric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    /// Value in the metric's native unit.
    pub value: f64,
    /// Number of requests behind the value. Zero means "no data yet".
    pub sample_count: u64,
}

impl MetricSample {
    pub fn new(value: f64, sample_count: u64) -> Self {
        Self {
            value,
            sample_count,
        }
    }

    /// A successful query that found no traffic for the cohort.
    pub fn empty() -> Self {
        Self {
            value: 0.0,
            sample_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

/// A failed query. Always transient from the controller's point of view.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricQueryError {
    #[error("metric backend unreachable: {0}")]
    Transport(String),

    #[error("metric backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed metric response: {0}")]
    Decode(String),

    #[error("metric backend error: {0}")]
    Backend(String),

    #[error("metric query timed out after {0:?}")]
    Timeout(Duration),
}

/// Read-only, stateless query interface over a telemetry store.
///
/// Implementations own their windowing and aggregation; the caller
/// passes the cohort labels explicitly on every call.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn query(
        &self,
        metric: Metric,
        cohort: &CohortLabels,
        window: Duration,
    ) -> Result<MetricSample, MetricQueryError>;
}
