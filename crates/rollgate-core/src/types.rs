//! Shared types used across Rollgate crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a rollout.
pub type RolloutId = String;

/// A named health signal reported by a metric source.
///
/// Units are whatever the source reports: rates are 0-100 percentages,
/// latencies are milliseconds, error count is a plain count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Percentage of successful requests (0-100).
    SuccessRate,
    /// P50 latency in milliseconds.
    LatencyP50,
    /// P95 latency in milliseconds.
    LatencyP95,
    /// P99 latency in milliseconds.
    LatencyP99,
    /// Number of failed requests in the window.
    ErrorCount,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::SuccessRate => "success_rate",
            Metric::LatencyP50 => "latency_p50",
            Metric::LatencyP95 => "latency_p95",
            Metric::LatencyP99 => "latency_p99",
            Metric::ErrorCount => "error_count",
        }
    }

    /// Latency quantile for the latency metrics.
    pub fn quantile(&self) -> Option<f64> {
        match self {
            Metric::LatencyP50 => Some(0.50),
            Metric::LatencyP95 => Some(0.95),
            Metric::LatencyP99 => Some(0.99),
            _ => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison operator between a metric value and a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl Comparator {
    /// Evaluate `value <op> threshold`.
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Gt => value > threshold,
            Comparator::Ge => value >= threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Judgment for a single check or for a whole step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    Inconclusive,
}

impl Verdict {
    /// Combine per-check verdicts into a step verdict.
    ///
    /// Any failure fails the step; the step passes only when every check
    /// passed. An empty set of checks passes.
    pub fn aggregate<I: IntoIterator<Item = Verdict>>(verdicts: I) -> Verdict {
        let mut all_passed = true;
        for v in verdicts {
            match v {
                Verdict::Failed => return Verdict::Failed,
                Verdict::Inconclusive => all_passed = false,
                Verdict::Passed => {}
            }
        }
        if all_passed {
            Verdict::Passed
        } else {
            Verdict::Inconclusive
        }
    }
}

/// Which version of the workload a slice of traffic is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cohort {
    Stable,
    Canary,
}

impl Cohort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cohort::Stable => "stable",
            Cohort::Canary => "canary",
        }
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels that scope a metric query to one cohort of one rollout.
///
/// Passed explicitly into every query so telemetry from different
/// rollouts never mixes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CohortLabels {
    pub rollout_id: RolloutId,
    pub workload: String,
    pub cohort: Cohort,
    pub version: String,
}

impl CohortLabels {
    /// Key used by in-process telemetry stores: `{rollout_id}:{cohort}`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.rollout_id, self.cohort)
    }
}
