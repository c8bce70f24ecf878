//! Per-check verdict tracking.
//!
//! A check compares each metric sample against its threshold. Failing
//! samples build a streak; once the streak reaches the check's
//! `consecutive_failures_to_fail`, the check fails and stays failed for
//! the rest of the step.

use tracing::{debug, warn};

use rollgate_core::{AnalysisCheck, Verdict};
use rollgate_metrics::MetricSample;

/// Result of comparing one sample against a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// The comparison held.
    Pass,
    /// The comparison did not hold.
    Fail,
    /// The query succeeded but found no traffic.
    NoData,
}

/// Compare a sample against a check's threshold.
pub fn evaluate_sample(check: &AnalysisCheck, sample: &MetricSample) -> SampleOutcome {
    if sample.is_empty() {
        return SampleOutcome::NoData;
    }
    if check.comparator.holds(sample.value, check.threshold) {
        SampleOutcome::Pass
    } else {
        SampleOutcome::Fail
    }
}

/// Tracks consecutive results for one check during one step.
#[derive(Debug, Clone)]
pub struct CheckTracker {
    /// Carried across steps via the rollout record.
    consecutive_failures: u32,
    /// Passing samples seen this step.
    passes: u32,
    /// Latched once the streak reaches the threshold.
    failed: bool,
    failures_to_fail: u32,
}

impl CheckTracker {
    /// Create a tracker, seeding the streak from the persisted counter.
    pub fn new(failures_to_fail: u32, seed: u32) -> Self {
        Self {
            consecutive_failures: seed,
            passes: 0,
            failed: false,
            failures_to_fail: failures_to_fail.max(1),
        }
    }

    /// Record a sample outcome and return the check's verdict.
    pub fn record(&mut self, outcome: SampleOutcome) -> Verdict {
        match outcome {
            SampleOutcome::Pass => {
                self.consecutive_failures = 0;
                self.passes += 1;
            }
            SampleOutcome::Fail => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failures_to_fail && !self.failed {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.failures_to_fail,
                        "check failed"
                    );
                    self.failed = true;
                }
            }
            SampleOutcome::NoData => {
                debug!("sample had no data");
            }
        }
        self.verdict()
    }

    pub fn verdict(&self) -> Verdict {
        if self.failed {
            Verdict::Failed
        } else if self.passes > 0 {
            Verdict::Passed
        } else {
            Verdict::Inconclusive
        }
    }

    /// Current failing streak.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
