//! Cohort recorder — in-process telemetry scoped per rollout and cohort.
//!
//! Each `{rollout_id}:{cohort}` key owns its own series of request
//! observations. Nothing is shared between rollouts, so two rollouts of
//! different workloads never see each other's success rates. Queries
//! aggregate the observations that fall inside the requested window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use rollgate_core::{Cohort, CohortLabels, Metric};

use crate::source::{MetricQueryError, MetricSample, MetricSource};

/// One observed request.
#[derive(Debug, Clone, Copy)]
struct Observation {
    at: Instant,
    latency_ms: f64,
    success: bool,
}

/// Per-cohort series.
struct CohortSeries {
    labels: CohortLabels,
    /// Lifetime totals, used for exposition.
    total: AtomicU64,
    errors: AtomicU64,
    /// Observations inside the retention horizon, oldest first.
    observations: Mutex<VecDeque<Observation>>,
}

impl CohortSeries {
    fn new(labels: CohortLabels) -> Self {
        Self {
            labels,
            total: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            observations: Mutex::new(VecDeque::new()),
        }
    }
}

/// Aggregates over a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CohortStats {
    pub requests: u64,
    pub errors: u64,
    /// Percentage 0-100. 0 when there were no requests.
    pub success_rate: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
}

impl CohortStats {
    fn empty() -> Self {
        Self {
            requests: 0,
            errors: 0,
            success_rate: 0.0,
            latency_p50_ms: 0.0,
            latency_p95_ms: 0.0,
            latency_p99_ms: 0.0,
        }
    }

    /// Value of `metric` in its native unit.
    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::SuccessRate => self.success_rate,
            Metric::LatencyP50 => self.latency_p50_ms,
            Metric::LatencyP95 => self.latency_p95_ms,
            Metric::LatencyP99 => self.latency_p99_ms,
            Metric::ErrorCount => self.errors as f64,
        }
    }
}

/// Point-in-time view of one cohort for exposition.
#[derive(Debug, Clone)]
pub struct CohortSnapshot {
    pub labels: CohortLabels,
    pub total_requests: u64,
    pub total_errors: u64,
    pub window: CohortStats,
}

/// Records request observations per `{rollout_id}:{cohort}` and answers
/// windowed metric queries over them.
#[derive(Clone)]
pub struct CohortRecorder {
    series: Arc<RwLock<HashMap<String, Arc<CohortSeries>>>>,
    /// Observations older than this are dropped.
    retention: Duration,
}

impl CohortRecorder {
    pub fn new(retention: Duration) -> Self {
        Self {
            series: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// Record one request for a cohort.
    pub async fn record(&self, labels: &CohortLabels, latency_ms: f64, success: bool) {
        let key = labels.key();
        let observation = Observation {
            at: Instant::now(),
            latency_ms,
            success,
        };

        // The map guard is held while appending so pruning never drops a
        // series between lookup and append.
        {
            let map = self.series.read().await;
            if let Some(series) = map.get(&key) {
                self.append(series, observation).await;
                return;
            }
        }
        let mut map = self.series.write().await;
        let series = map.entry(key.clone()).or_insert_with(|| {
            debug!(cohort = %key, "registered cohort series");
            Arc::new(CohortSeries::new(labels.clone()))
        });
        self.append(series, observation).await;
    }

    async fn append(&self, series: &CohortSeries, observation: Observation) {
        series.total.fetch_add(1, Ordering::Relaxed);
        if !observation.success {
            series.errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut obs = series.observations.lock().await;
        obs.push_back(observation);
        trim(&mut obs, observation.at, self.retention);
    }

    /// Drop every series with no observation inside the retention horizon.
    /// Returns how many were dropped.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut map = self.series.write().await;
        let mut stale = Vec::new();
        for (key, series) in map.iter() {
            let mut obs = series.observations.lock().await;
            trim(&mut obs, now, self.retention);
            if obs.is_empty() {
                stale.push(key.clone());
            }
        }
        for key in &stale {
            map.remove(key);
            debug!(cohort = %key, "stale cohort series dropped");
        }
        stale.len()
    }

    /// Aggregate a cohort's observations over the trailing `window`.
    pub async fn stats(&self, labels: &CohortLabels, window: Duration) -> CohortStats {
        let series = self.series.read().await.get(&labels.key()).cloned();
        match series {
            Some(s) => {
                let obs = s.observations.lock().await;
                window_stats(&obs, Instant::now(), window)
            }
            None => CohortStats::empty(),
        }
    }

    /// Drop every series that belongs to a rollout.
    pub async fn forget_rollout(&self, rollout_id: &str) {
        let mut map = self.series.write().await;
        map.retain(|_, s| s.labels.rollout_id != rollout_id);
        debug!(rollout = %rollout_id, "cohort series dropped");
    }

    /// Snapshot every live cohort over `window` for exposition.
    pub async fn snapshots(&self, window: Duration) -> Vec<CohortSnapshot> {
        self.prune().await;
        let map = self.series.read().await;
        let now = Instant::now();
        let mut out = Vec::with_capacity(map.len());
        for s in map.values() {
            let obs = s.observations.lock().await;
            out.push(CohortSnapshot {
                labels: s.labels.clone(),
                total_requests: s.total.load(Ordering::Relaxed),
                total_errors: s.errors.load(Ordering::Relaxed),
                window: window_stats(&obs, now, window),
            });
        }
        out.sort_by(|a, b| a.labels.key().cmp(&b.labels.key()));
        out
    }

    /// Number of tracked cohort series.
    pub async fn series_count(&self) -> usize {
        self.series.read().await.len()
    }
}

impl Default for CohortRecorder {
    fn default() -> Self {
        Self::new(Duration::from_secs(15 * 60))
    }
}

#[async_trait]
impl MetricSource for CohortRecorder {
    async fn query(
        &self,
        metric: Metric,
        cohort: &CohortLabels,
        window: Duration,
    ) -> Result<MetricSample, MetricQueryError> {
        let stats = self.stats(cohort, window).await;
        if stats.requests == 0 {
            return Ok(MetricSample::empty());
        }
        Ok(MetricSample::new(stats.value(metric), stats.requests))
    }
}

/// Pop observations older than `retention` off the front.
fn trim(obs: &mut VecDeque<Observation>, now: Instant, retention: Duration) {
    while let Some(front) = obs.front() {
        if now.duration_since(front.at) > retention {
            obs.pop_front();
        } else {
            break;
        }
    }
}

fn window_stats(obs: &VecDeque<Observation>, now: Instant, window: Duration) -> CohortStats {
    let mut latencies = Vec::new();
    let mut errors = 0u64;
    for o in obs.iter().rev() {
        if now.duration_since(o.at) > window {
            break;
        }
        latencies.push(o.latency_ms);
        if !o.success {
            errors += 1;
        }
    }

    let requests = latencies.len() as u64;
    if requests == 0 {
        return CohortStats::empty();
    }

    latencies.sort_unstable_by(|a, b| a.total_cmp(b));
    let successes = requests - errors;
    CohortStats {
        requests,
        errors,
        success_rate: successes as f64 / requests as f64 * 100.0,
        latency_p50_ms: percentile(&latencies, 0.50),
        latency_p95_ms: percentile(&latencies, 0.95),
        latency_p99_ms: percentile(&latencies, 0.99),
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (sorted.len() as f64 * q) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Build the labels for a rollout's cohort.
pub fn cohort_labels(rollout_id: &str, workload: &str, cohort: Cohort, version: &str) -> CohortLabels {
    CohortLabels {
        rollout_id: rollout_id.to_string(),
        workload: workload.to_string(),
        cohort,
        version: version.to_string(),
    }
}
