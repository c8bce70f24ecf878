//! Analysis engine: background evaluation of one step's checks.
//!
//! `start_step` spawns a task per check and per rollback threshold and
//! returns an [`AnalysisHandle`]. Tasks share nothing but the snapshot
//! sender, so a slow query on one check never delays another check's
//! cadence. Stopping the handle signals every task; results of queries
//! that finish afterwards are discarded.
//!
//! Each task also publishes when its next evaluation is due. A caller
//! whose deadline coincides with a tick uses [`AnalysisHandle::settle`]
//! to see that tick's result before it judges the step.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use rollgate_core::{AnalysisCheck, CohortLabels, Comparator, Metric, RollbackThreshold, Verdict};
use rollgate_metrics::{MetricQueryError, MetricSample, MetricSource};

use crate::checker::{CheckTracker, evaluate_sample};

/// Extra wait in [`AnalysisHandle::settle`] beyond the slowest query bound.
const SETTLE_SLACK: Duration = Duration::from_millis(50);

/// Engine settings.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Upper bound on a single query. The effective bound is also capped
    /// at four fifths of the evaluation interval.
    pub query_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(2),
        }
    }
}

/// Live state of one check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckStatus {
    pub metric: Metric,
    pub verdict: Verdict,
    pub consecutive_failures: u32,
    /// Successful queries this step, including ones with no data.
    pub evaluations: u32,
    pub last_value: Option<f64>,
}

/// A rollback threshold whose breach condition held.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub threshold: String,
    pub metric: Metric,
    pub comparator: Comparator,
    pub limit: f64,
    pub value: f64,
}

impl Breach {
    pub fn describe(&self) -> String {
        format!(
            "rollback threshold {} breached: {} = {:.2} {} {}",
            self.threshold, self.metric, self.value, self.comparator, self.limit
        )
    }
}

/// Point-in-time view of a step's analysis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisSnapshot {
    pub checks: BTreeMap<String, CheckStatus>,
    /// First breach seen this step. Never cleared.
    pub breach: Option<Breach>,
    /// Query errors in a row, across every task of the step.
    pub consecutive_query_errors: u32,
    pub last_query_error: Option<String>,
    /// Completed queries, successful or not.
    pub queries: u64,
}

impl AnalysisSnapshot {
    /// Aggregate step verdict. A step with no checks passes.
    pub fn verdict(&self) -> Verdict {
        Verdict::aggregate(self.checks.values().map(|c| c.verdict))
    }

    /// Names of checks whose verdict is `Failed`.
    pub fn failing_checks(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|(_, c)| c.verdict == Verdict::Failed)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Failure streaks to persist into the rollout record.
    pub fn failure_counters(&self) -> BTreeMap<String, u32> {
        self.checks
            .iter()
            .map(|(name, c)| (name.clone(), c.consecutive_failures))
            .collect()
    }

    fn record_success(&mut self) {
        self.queries += 1;
        self.consecutive_query_errors = 0;
    }

    fn record_error(&mut self, err: &MetricQueryError) {
        self.queries += 1;
        self.consecutive_query_errors += 1;
        self.last_query_error = Some(err.to_string());
    }
}

/// Evaluates checks against a metric source.
#[derive(Clone)]
pub struct AnalysisEngine {
    source: Arc<dyn MetricSource>,
    config: EngineConfig,
}

impl AnalysisEngine {
    pub fn new(source: Arc<dyn MetricSource>, config: EngineConfig) -> Self {
        Self { source, config }
    }

    /// Start evaluating a step.
    ///
    /// `seed` carries each check's failure streak from earlier steps.
    /// Queries are scoped to `cohort`.
    pub fn start_step(
        &self,
        checks: &[AnalysisCheck],
        thresholds: &[RollbackThreshold],
        cohort: CohortLabels,
        seed: &BTreeMap<String, u32>,
    ) -> AnalysisHandle {
        let mut initial = AnalysisSnapshot::default();
        let mut trackers = Vec::with_capacity(checks.len());
        for check in checks {
            let tracker = CheckTracker::new(
                check.consecutive_failures_to_fail,
                seed.get(&check.name).copied().unwrap_or(0),
            );
            initial.checks.insert(
                check.name.clone(),
                CheckStatus {
                    metric: check.metric,
                    verdict: tracker.verdict(),
                    consecutive_failures: tracker.consecutive_failures(),
                    evaluations: 0,
                    last_value: None,
                },
            );
            trackers.push(tracker);
        }

        let start = Instant::now();
        let intervals: Vec<Duration> = checks
            .iter()
            .map(|c| c.evaluation_interval)
            .chain(thresholds.iter().map(|t| t.evaluation_interval))
            .collect();
        let grace = intervals
            .iter()
            .map(|i| self.timeout_for(*i))
            .max()
            .unwrap_or_default()
            + SETTLE_SLACK;

        let (tx, rx) = watch::channel(initial);
        let tx = Arc::new(tx);
        let (due_tx, due_rx) = watch::channel(intervals.iter().map(|i| start + *i).collect::<Vec<_>>());
        let due_tx = Arc::new(due_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(intervals.len());

        for (slot, (check, tracker)) in checks.iter().zip(trackers).enumerate() {
            let timeout = self.timeout_for(check.evaluation_interval);
            let progress = Progress {
                start,
                slot,
                due: due_tx.clone(),
            };
            tasks.push(tokio::spawn(run_check(
                self.source.clone(),
                check.clone(),
                cohort.clone(),
                tracker,
                timeout,
                tx.clone(),
                progress,
                shutdown_rx.clone(),
            )));
        }
        for (i, threshold) in thresholds.iter().enumerate() {
            let timeout = self.timeout_for(threshold.evaluation_interval);
            let progress = Progress {
                start,
                slot: checks.len() + i,
                due: due_tx.clone(),
            };
            tasks.push(tokio::spawn(run_threshold(
                self.source.clone(),
                threshold.clone(),
                cohort.clone(),
                timeout,
                tx.clone(),
                progress,
                shutdown_rx.clone(),
            )));
        }

        debug!(
            rollout = %cohort.rollout_id,
            checks = checks.len(),
            thresholds = thresholds.len(),
            "analysis started"
        );

        AnalysisHandle {
            rx,
            _tx: tx,
            due: due_rx,
            grace,
            shutdown: shutdown_tx,
            tasks,
        }
    }

    fn timeout_for(&self, interval: Duration) -> Duration {
        self.config.query_timeout.min(interval * 4 / 5)
    }
}

/// Running analysis for one step. Stops on drop.
pub struct AnalysisHandle {
    rx: watch::Receiver<AnalysisSnapshot>,
    /// Keeps the channel open after the tasks exit.
    _tx: Arc<watch::Sender<AnalysisSnapshot>>,
    /// Next due evaluation per task.
    due: watch::Receiver<Vec<Instant>>,
    grace: Duration,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AnalysisHandle {
    /// Current aggregate verdict. Never blocks on a query.
    pub fn verdict(&self) -> Verdict {
        self.rx.borrow().verdict()
    }

    pub fn snapshot(&self) -> AnalysisSnapshot {
        self.rx.borrow().clone()
    }

    /// Receiver that is notified on every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<AnalysisSnapshot> {
        self.rx.clone()
    }

    /// Wait until every evaluation scheduled at or before `at` has been
    /// published, then return the snapshot. Bounded by the slowest query
    /// timeout, so a stuck or stopped task cannot hold the caller.
    pub async fn settle(&self, at: Instant) -> AnalysisSnapshot {
        let mut due = self.due.clone();
        let settled = tokio::time::timeout(
            self.grace,
            due.wait_for(|next| next.iter().all(|d| *d > at)),
        )
        .await
        .is_ok();
        if !settled {
            debug!("analysis did not settle before the grace period");
        }
        self.snapshot()
    }

    /// Cancel evaluation. Idempotent.
    pub fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for AnalysisHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn query_with_timeout(
    source: &dyn MetricSource,
    metric: Metric,
    cohort: &CohortLabels,
    window: Duration,
    timeout: Duration,
) -> Result<MetricSample, MetricQueryError> {
    match tokio::time::timeout(timeout, source.query(metric, cohort, window)).await {
        Ok(result) => result,
        Err(_) => Err(MetricQueryError::Timeout(timeout)),
    }
}

/// A task's slot in the handle's due list.
struct Progress {
    start: Instant,
    slot: usize,
    due: Arc<watch::Sender<Vec<Instant>>>,
}

impl Progress {
    fn ticker(&self, interval: Duration) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval_at(self.start + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Mark the tick at `at` as published.
    fn done(&self, at: Instant, interval: Duration) {
        self.due.send_modify(|due| {
            if let Some(next) = due.get_mut(self.slot) {
                *next = at + interval;
            }
        });
    }
}

/// Evaluation loop for a single check.
async fn run_check(
    source: Arc<dyn MetricSource>,
    check: AnalysisCheck,
    cohort: CohortLabels,
    mut tracker: CheckTracker,
    timeout: Duration,
    tx: Arc<watch::Sender<AnalysisSnapshot>>,
    progress: Progress,
    mut shutdown: watch::Receiver<bool>,
) {
    let window = check.query_window();
    let mut ticker = progress.ticker(check.evaluation_interval);

    loop {
        let at = tokio::select! {
            at = ticker.tick() => at,
            _ = shutdown.changed() => break,
        };

        let result = tokio::select! {
            r = query_with_timeout(source.as_ref(), check.metric, &cohort, window, timeout) => r,
            _ = shutdown.changed() => break,
        };
        if *shutdown.borrow() {
            break;
        }

        match result {
            Ok(sample) => {
                let outcome = evaluate_sample(&check, &sample);
                let verdict = tracker.record(outcome);
                debug!(
                    rollout = %cohort.rollout_id,
                    check = %check.name,
                    value = sample.value,
                    samples = sample.sample_count,
                    ?outcome,
                    ?verdict,
                    "check evaluated"
                );
                let streak = tracker.consecutive_failures();
                tx.send_modify(|snap| {
                    snap.record_success();
                    if let Some(status) = snap.checks.get_mut(&check.name) {
                        status.verdict = verdict;
                        status.consecutive_failures = streak;
                        status.evaluations += 1;
                        if !sample.is_empty() {
                            status.last_value = Some(sample.value);
                        }
                    }
                });
            }
            Err(e) => {
                warn!(
                    rollout = %cohort.rollout_id,
                    check = %check.name,
                    error = %e,
                    "metric query failed"
                );
                tx.send_modify(|snap| snap.record_error(&e));
            }
        }
        progress.done(at, check.evaluation_interval);
    }

    debug!(rollout = %cohort.rollout_id, check = %check.name, "check loop stopped");
}

/// Watch loop for a single rollback threshold.
async fn run_threshold(
    source: Arc<dyn MetricSource>,
    threshold: RollbackThreshold,
    cohort: CohortLabels,
    timeout: Duration,
    tx: Arc<watch::Sender<AnalysisSnapshot>>,
    progress: Progress,
    mut shutdown: watch::Receiver<bool>,
) {
    let window = threshold.query_window();
    let mut ticker = progress.ticker(threshold.evaluation_interval);

    loop {
        let at = tokio::select! {
            at = ticker.tick() => at,
            _ = shutdown.changed() => break,
        };

        let result = tokio::select! {
            r = query_with_timeout(source.as_ref(), threshold.metric, &cohort, window, timeout) => r,
            _ = shutdown.changed() => break,
        };
        if *shutdown.borrow() {
            break;
        }

        match result {
            Ok(sample) => {
                let breached = !sample.is_empty()
                    && threshold.comparator.holds(sample.value, threshold.threshold);
                if breached {
                    warn!(
                        rollout = %cohort.rollout_id,
                        threshold = %threshold.name,
                        value = sample.value,
                        limit = threshold.threshold,
                        "rollback threshold breached"
                    );
                }
                tx.send_modify(|snap| {
                    snap.record_success();
                    if breached && snap.breach.is_none() {
                        snap.breach = Some(Breach {
                            threshold: threshold.name.clone(),
                            metric: threshold.metric,
                            comparator: threshold.comparator,
                            limit: threshold.threshold,
                            value: sample.value,
                        });
                    }
                });
            }
            Err(e) => {
                warn!(
                    rollout = %cohort.rollout_id,
                    threshold = %threshold.name,
                    error = %e,
                    "metric query failed"
                );
                tx.send_modify(|snap| snap.record_error(&e));
            }
        }
        progress.done(at, threshold.evaluation_interval);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use rollgate_core::Cohort;

    type Script = Box<dyn Fn(Metric, u32) -> Result<MetricSample, MetricQueryError> + Send + Sync>;

    /// Source answering from a closure of (metric, call number per metric).
    struct ScriptSource {
        script: Script,
        delay: Duration,
        calls: Mutex<HashMap<Metric, u32>>,
    }

    impl ScriptSource {
        fn new(script: Script) -> Arc<Self> {
            Self::slow(script, Duration::ZERO)
        }

        fn slow(script: Script, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script,
                delay,
                calls: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl MetricSource for ScriptSource {
        async fn query(
            &self,
            metric: Metric,
            _cohort: &CohortLabels,
            _window: Duration,
        ) -> Result<MetricSample, MetricQueryError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(metric).or_insert(0);
                *n += 1;
                *n
            };
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.script)(metric, n)
        }
    }

    fn cohort() -> CohortLabels {
        CohortLabels {
            rollout_id: "r-1".to_string(),
            workload: "voyager-gateway".to_string(),
            cohort: Cohort::Canary,
            version: "1.1.0".to_string(),
        }
    }

    fn check(name: &str, metric: Metric, comparator: Comparator, threshold: f64, fails: u32) -> AnalysisCheck {
        AnalysisCheck {
            name: name.to_string(),
            metric,
            comparator,
            threshold,
            consecutive_failures_to_fail: fails,
            evaluation_interval: Duration::from_secs(5),
            window: None,
        }
    }

    fn success_check(fails: u32) -> AnalysisCheck {
        check("success-rate", Metric::SuccessRate, Comparator::Ge, 99.0, fails)
    }

    fn rollback(name: &str, metric: Metric, comparator: Comparator, limit: f64) -> RollbackThreshold {
        RollbackThreshold {
            name: name.to_string(),
            metric,
            comparator,
            threshold: limit,
            evaluation_interval: Duration::from_secs(5),
            window: None,
        }
    }

    fn engine(source: Arc<dyn MetricSource>) -> AnalysisEngine {
        AnalysisEngine::new(source, EngineConfig::default())
    }

    async fn wait_queries(handle: &AnalysisHandle, n: u64) -> AnalysisSnapshot {
        let mut rx = handle.subscribe();
        let snap = rx.wait_for(|s| s.queries >= n).await.unwrap();
        snap.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn no_checks_pass_immediately() {
        let source = ScriptSource::new(Box::new(|_, _| Ok(MetricSample::new(99.9, 10))));
        let handle = engine(source).start_step(&[], &[], cohort(), &BTreeMap::new());
        assert_eq!(handle.verdict(), Verdict::Passed);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_check_passes() {
        let source = ScriptSource::new(Box::new(|_, _| Ok(MetricSample::new(99.8, 500))));
        let handle = engine(source).start_step(&[success_check(1)], &[], cohort(), &BTreeMap::new());
        assert_eq!(handle.verdict(), Verdict::Inconclusive);

        let snap = wait_queries(&handle, 1).await;
        assert_eq!(snap.verdict(), Verdict::Passed);
        assert_eq!(snap.checks["success-rate"].last_value, Some(99.8));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_fail_the_check() {
        let source = ScriptSource::new(Box::new(|_, _| Ok(MetricSample::new(95.0, 500))));
        let handle = engine(source).start_step(&[success_check(2)], &[], cohort(), &BTreeMap::new());

        let snap = wait_queries(&handle, 1).await;
        assert_eq!(snap.verdict(), Verdict::Inconclusive);

        let snap = wait_queries(&handle, 2).await;
        assert_eq!(snap.verdict(), Verdict::Failed);
        assert_eq!(snap.failing_checks(), vec!["success-rate".to_string()]);
        assert_eq!(snap.failure_counters()["success-rate"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_streak_fails_sooner() {
        let source = ScriptSource::new(Box::new(|_, _| Ok(MetricSample::new(95.0, 500))));
        let mut seed = BTreeMap::new();
        seed.insert("success-rate".to_string(), 1);
        let handle = engine(source).start_step(&[success_check(2)], &[], cohort(), &seed);

        let snap = wait_queries(&handle, 1).await;
        assert_eq!(snap.verdict(), Verdict::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_samples_stay_inconclusive() {
        let source = ScriptSource::new(Box::new(|_, _| Ok(MetricSample::empty())));
        let handle = engine(source).start_step(&[success_check(1)], &[], cohort(), &BTreeMap::new());

        let snap = wait_queries(&handle, 4).await;
        assert_eq!(snap.verdict(), Verdict::Inconclusive);
        assert_eq!(snap.consecutive_query_errors, 0);
        assert_eq!(snap.checks["success-rate"].evaluations, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn query_errors_count_until_a_query_succeeds() {
        let source = ScriptSource::new(Box::new(|_, n| {
            if n <= 3 {
                Err(MetricQueryError::Transport("connection refused".to_string()))
            } else {
                Ok(MetricSample::empty())
            }
        }));
        let mut seed = BTreeMap::new();
        seed.insert("success-rate".to_string(), 1);
        let handle = engine(source).start_step(&[success_check(3)], &[], cohort(), &seed);

        let snap = wait_queries(&handle, 3).await;
        assert_eq!(snap.consecutive_query_errors, 3);
        assert!(snap.last_query_error.unwrap().contains("connection refused"));

        let snap = wait_queries(&handle, 4).await;
        assert_eq!(snap.consecutive_query_errors, 0);
        // Errors never touch the failure streak.
        assert_eq!(snap.failure_counters()["success-rate"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_query_times_out() {
        let source = ScriptSource::slow(
            Box::new(|_, _| Ok(MetricSample::new(99.9, 10))),
            Duration::from_secs(10),
        );
        let handle = engine(source).start_step(&[success_check(1)], &[], cohort(), &BTreeMap::new());

        let snap = wait_queries(&handle, 1).await;
        assert_eq!(snap.consecutive_query_errors, 1);
        assert_eq!(
            snap.last_query_error,
            Some(MetricQueryError::Timeout(Duration::from_secs(2)).to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_threshold_breach() {
        let source = ScriptSource::new(Box::new(|metric, _| match metric {
            Metric::SuccessRate => Ok(MetricSample::new(97.0, 500)),
            _ => Ok(MetricSample::new(120.0, 500)),
        }));
        let thresholds = [
            rollback("success-floor", Metric::SuccessRate, Comparator::Lt, 98.0),
            rollback("p99-ceiling", Metric::LatencyP99, Comparator::Gt, 800.0),
        ];
        let handle = engine(source).start_step(&[], &thresholds, cohort(), &BTreeMap::new());

        let mut rx = handle.subscribe();
        let snap = rx.wait_for(|s| s.breach.is_some()).await.unwrap().clone();
        let breach = snap.breach.unwrap();
        assert_eq!(breach.threshold, "success-floor");
        assert_eq!(breach.value, 97.0);
        assert!(breach.describe().contains("success_rate = 97.00 < 98"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_sample_never_breaches() {
        let source = ScriptSource::new(Box::new(|_, _| Ok(MetricSample::empty())));
        let thresholds = [rollback("success-floor", Metric::SuccessRate, Comparator::Lt, 98.0)];
        let handle = engine(source).start_step(&[], &thresholds, cohort(), &BTreeMap::new());

        let snap = wait_queries(&handle, 3).await;
        assert!(snap.breach.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_check_does_not_delay_others() {
        let source = ScriptSource::slow(
            Box::new(|_, _| Ok(MetricSample::new(99.9, 10))),
            Duration::from_millis(1500),
        );
        let checks = [
            success_check(1),
            AnalysisCheck {
                evaluation_interval: Duration::from_secs(2),
                ..check("p99", Metric::LatencyP99, Comparator::Lt, 500.0, 1)
            },
        ];
        let handle = engine(source).start_step(&checks, &[], cohort(), &BTreeMap::new());

        // p99 ticks at 2s and 4s; success-rate first ticks at 5s.
        tokio::time::sleep(Duration::from_millis(5600)).await;
        let snap = handle.snapshot();
        assert_eq!(snap.checks["p99"].evaluations, 2);
        assert_eq!(snap.checks["success-rate"].evaluations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_waits_for_the_tick_at_the_deadline() {
        let source = ScriptSource::slow(
            Box::new(|_, _| Ok(MetricSample::new(97.0, 500))),
            Duration::from_millis(300),
        );
        let thresholds = [rollback("success-floor", Metric::SuccessRate, Comparator::Lt, 98.0)];
        let handle = engine(source).start_step(&[success_check(1)], &thresholds, cohort(), &BTreeMap::new());

        // Both tasks tick exactly at the deadline.
        let deadline = Instant::now() + Duration::from_secs(5);
        tokio::time::sleep_until(deadline).await;
        assert!(handle.snapshot().breach.is_none());

        let snap = handle.settle(deadline).await;
        assert_eq!(snap.queries, 2);
        assert!(snap.breach.is_some());
        assert_eq!(snap.verdict(), Verdict::Failed);
        assert_eq!(Instant::now(), deadline + Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn settle_is_bounded_when_nothing_is_due() {
        let source = ScriptSource::new(Box::new(|_, _| Ok(MetricSample::new(99.9, 10))));
        let handle = engine(source).start_step(&[success_check(1)], &[], cohort(), &BTreeMap::new());

        let before = Instant::now();
        let snap = handle.settle(before + Duration::from_secs(1)).await;
        assert_eq!(Instant::now(), before);
        assert_eq!(snap.queries, 0);

        let mut stopped = handle;
        stopped.stop();
        // Stopped tasks never publish; settle gives up after the grace period.
        let snap = stopped.settle(before + Duration::from_secs(60)).await;
        assert_eq!(snap.queries, 0);
        assert!(Instant::now() - before <= Duration::from_secs(2) + SETTLE_SLACK);
    }

    #[tokio::test(start_paused = true)]
    async fn results_after_stop_are_discarded() {
        let source = ScriptSource::slow(
            Box::new(|_, _| Ok(MetricSample::new(99.9, 10))),
            Duration::from_secs(1),
        );
        let mut handle = engine(source).start_step(&[success_check(1)], &[], cohort(), &BTreeMap::new());

        // The first query is in flight between 5s and 6s.
        tokio::time::sleep(Duration::from_millis(5500)).await;
        handle.stop();
        tokio::time::sleep(Duration::from_secs(20)).await;

        let snap = handle.snapshot();
        assert_eq!(snap.queries, 0);
        assert_eq!(snap.verdict(), Verdict::Inconclusive);
    }
}
