//! Prometheus text exposition format.
//!
//! Renders rollout progress gauges and per-cohort telemetry into the
//! Prometheus text exposition format for scraping.

use rollgate_state::{Phase, RolloutState};

use crate::recorder::CohortSnapshot;

const PHASES: [Phase; 8] = [
    Phase::Initializing,
    Phase::Progressing,
    Phase::Paused,
    Phase::Degraded,
    Phase::Promoting,
    Phase::Succeeded,
    Phase::Aborting,
    Phase::RolledBack,
];

/// Render rollout gauges and cohort snapshots into Prometheus text format.
pub fn render_prometheus(cohorts: &[CohortSnapshot], rollouts: &[RolloutState]) -> String {
    let mut out = String::new();

    out.push_str("# HELP rollgate_rollout_weight Canary traffic weight applied (0-100).\n");
    out.push_str("# TYPE rollgate_rollout_weight gauge\n");
    for r in rollouts {
        out.push_str(&format!(
            "rollgate_rollout_weight{{rollout=\"{}\",workload=\"{}\"}} {}\n",
            r.id, r.workload, r.applied_weight
        ));
    }

    out.push_str("# HELP rollgate_rollout_step Current step index.\n");
    out.push_str("# TYPE rollgate_rollout_step gauge\n");
    for r in rollouts {
        out.push_str(&format!(
            "rollgate_rollout_step{{rollout=\"{}\",workload=\"{}\"}} {}\n",
            r.id, r.workload, r.current_step_index
        ));
    }

    out.push_str("# HELP rollgate_rollout_phase Current phase (1 for the active phase).\n");
    out.push_str("# TYPE rollgate_rollout_phase gauge\n");
    for r in rollouts {
        for phase in PHASES {
            out.push_str(&format!(
                "rollgate_rollout_phase{{rollout=\"{}\",workload=\"{}\",phase=\"{}\"}} {}\n",
                r.id,
                r.workload,
                phase,
                u8::from(r.phase == phase)
            ));
        }
    }

    out.push_str("# HELP rollgate_cohort_requests_total Requests observed per cohort.\n");
    out.push_str("# TYPE rollgate_cohort_requests_total counter\n");
    for c in cohorts {
        out.push_str(&format!(
            "rollgate_cohort_requests_total{{{}}} {}\n",
            labels(c),
            c.total_requests
        ));
    }

    out.push_str("# HELP rollgate_cohort_errors_total Failed requests observed per cohort.\n");
    out.push_str("# TYPE rollgate_cohort_errors_total counter\n");
    for c in cohorts {
        out.push_str(&format!(
            "rollgate_cohort_errors_total{{{}}} {}\n",
            labels(c),
            c.total_errors
        ));
    }

    out.push_str("# HELP rollgate_cohort_success_rate Success rate over the window (0-100).\n");
    out.push_str("# TYPE rollgate_cohort_success_rate gauge\n");
    for c in cohorts {
        out.push_str(&format!(
            "rollgate_cohort_success_rate{{{}}} {:.2}\n",
            labels(c),
            c.window.success_rate
        ));
    }

    out.push_str("# HELP rollgate_cohort_latency_p99_ms P99 latency over the window in milliseconds.\n");
    out.push_str("# TYPE rollgate_cohort_latency_p99_ms gauge\n");
    for c in cohorts {
        out.push_str(&format!(
            "rollgate_cohort_latency_p99_ms{{{}}} {:.2}\n",
            labels(c),
            c.window.latency_p99_ms
        ));
    }

    out
}

fn labels(c: &CohortSnapshot) -> String {
    format!(
        "rollout=\"{}\",workload=\"{}\",cohort=\"{}\",version=\"{}\"",
        c.labels.rollout_id, c.labels.workload, c.labels.cohort, c.labels.version
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::recorder::CohortStats;
    use rollgate_core::{Cohort, CohortLabels, RolloutSpec, Step};

    fn snapshot(rollout: &str, cohort: Cohort) -> CohortSnapshot {
        CohortSnapshot {
            labels: CohortLabels {
                rollout_id: rollout.to_string(),
                workload: "voyager-gateway".to_string(),
                cohort,
                version: "1.1.0".to_string(),
            },
            total_requests: 1200,
            total_errors: 3,
            window: CohortStats {
                requests: 600,
                errors: 1,
                success_rate: 99.83,
                latency_p50_ms: 52.0,
                latency_p95_ms: 80.0,
                latency_p99_ms: 120.5,
            },
        }
    }

    fn rollout(id: &str) -> RolloutState {
        let spec = RolloutSpec {
            workload: "voyager-gateway".to_string(),
            stable_version: "1.0.0".to_string(),
            canary_version: "1.1.0".to_string(),
            steps: vec![
                Step {
                    weight_percent: 10,
                    pause: Duration::from_secs(30),
                },
                Step {
                    weight_percent: 100,
                    pause: Duration::from_secs(30),
                },
            ],
            checks: vec![],
            rollback_thresholds: vec![],
            promotion_window: None,
        };
        let mut state = RolloutState::new(id, spec, 0);
        state.phase = Phase::Paused;
        state.applied_weight = 10;
        state
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&[], &[]);
        // Type declarations are always present.
        assert!(output.contains("# HELP rollgate_rollout_weight"));
        assert!(output.contains("# TYPE rollgate_cohort_requests_total counter"));
    }

    #[test]
    fn render_rollout_gauges() {
        let output = render_prometheus(&[], &[rollout("r-1")]);

        assert!(output.contains("rollgate_rollout_weight{rollout=\"r-1\",workload=\"voyager-gateway\"} 10"));
        assert!(output.contains("rollgate_rollout_step{rollout=\"r-1\",workload=\"voyager-gateway\"} 0"));
        assert!(output.contains(
            "rollgate_rollout_phase{rollout=\"r-1\",workload=\"voyager-gateway\",phase=\"paused\"} 1"
        ));
        assert!(output.contains(
            "rollgate_rollout_phase{rollout=\"r-1\",workload=\"voyager-gateway\",phase=\"succeeded\"} 0"
        ));
    }

    #[test]
    fn render_cohort_telemetry() {
        let output = render_prometheus(&[snapshot("r-1", Cohort::Canary)], &[]);
        let labels = "rollout=\"r-1\",workload=\"voyager-gateway\",cohort=\"canary\",version=\"1.1.0\"";

        assert!(output.contains(&format!("rollgate_cohort_requests_total{{{labels}}} 1200")));
        assert!(output.contains(&format!("rollgate_cohort_errors_total{{{labels}}} 3")));
        assert!(output.contains(&format!("rollgate_cohort_success_rate{{{labels}}} 99.83")));
        assert!(output.contains(&format!("rollgate_cohort_latency_p99_ms{{{labels}}} 120.50")));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let output = render_prometheus(
            &[snapshot("r-1", Cohort::Stable), snapshot("r-1", Cohort::Canary)],
            &[rollout("r-1")],
        );

        // Every non-empty, non-comment line should match: metric_name{labels} value
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(
                line.contains('{') && line.contains('}'),
                "line should have labels: {line}"
            );
        }
    }
}
