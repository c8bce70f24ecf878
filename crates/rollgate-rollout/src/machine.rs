//! Rollout state machine.
//!
//! One `RolloutMachine` runs as its own task per active rollout and is
//! the only writer of that rollout's [`RolloutState`]. Every transition
//! is persisted before it is published on the status channel, so a
//! restarted controller resumes from the last durable phase.
//!
//! While a step holds its weight, the machine waits on a single
//! `tokio::select!` over operator commands, analysis snapshot changes
//! and the pause deadline. Time spent degraded is not counted toward
//! the pause.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use rollgate_analysis::{AnalysisEngine, AnalysisSnapshot};
use rollgate_core::config::ControllerConfig;
use rollgate_core::{Cohort, CohortLabels, Verdict};
use rollgate_metrics::cohort_labels;
use rollgate_state::{
    AbortInfo, DecidedBy, OutcomeVerdict, Phase, RolloutState, StateStore, StepOutcome,
};
use rollgate_traffic::{SingleFlight, TrafficSplitter};

use crate::alert::{Alert, AlertKind, AlertSink};
use crate::error::ControllerError;
use crate::retry::{Backoff, set_weight_with_retry};

/// Operator command for a running machine. The machine replies once it
/// has accepted or rejected the command.
pub enum Command {
    Abort {
        reason: String,
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    Promote {
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
}

impl Command {
    fn reject(self, message: String) {
        let reply = match self {
            Command::Abort { reply, .. } | Command::Promote { reply } => reply,
        };
        let _ = reply.send(Err(ControllerError::OverrideConflict(message)));
    }
}

/// Timing and retry policy shared by every machine.
#[derive(Debug, Clone, Copy)]
pub struct MachineSettings {
    /// Consecutive query errors that mark a rollout degraded.
    pub degraded_after: u32,
    /// Longest a rollout may stay degraded before it aborts.
    pub max_degraded: Duration,
    pub backoff: Backoff,
}

impl MachineSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            degraded_after: config.degraded_after.max(1),
            max_degraded: config.max_degraded,
            backoff: Backoff::from_config(config),
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self::from_config(&ControllerConfig::default())
    }
}

/// Collaborators shared by every machine of a controller.
#[derive(Clone)]
pub struct MachineDeps {
    pub store: StateStore,
    pub engine: AnalysisEngine,
    pub alerts: Arc<dyn AlertSink>,
    pub settings: MachineSettings,
}

enum Flow {
    Continue,
    Stop,
}

/// How a hold (step pause or promotion window) ended.
enum HoldEnd {
    Passed(AnalysisSnapshot),
    /// The machine already moved on: abort, operator promote.
    Interrupted,
}

pub struct RolloutMachine {
    state: RolloutState,
    deps: MachineDeps,
    splitter: SingleFlight,
    status: watch::Sender<RolloutState>,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
}

impl RolloutMachine {
    pub fn new(
        state: RolloutState,
        deps: MachineDeps,
        splitter: Arc<dyn TrafficSplitter>,
        status: watch::Sender<RolloutState>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            state,
            deps,
            splitter: SingleFlight::new(splitter),
            status,
            commands,
            commands_open: true,
        }
    }

    /// Drive the rollout until it reaches a terminal phase, or until a
    /// rollback cannot be applied. Returns the final state.
    pub async fn run(mut self) -> RolloutState {
        self.prepare();

        loop {
            let flow = match self.state.phase {
                Phase::Initializing => self.initialize(),
                Phase::Progressing => self.enter_step().await,
                Phase::Paused | Phase::Degraded => self.hold_step().await,
                Phase::Promoting => self.promote().await,
                Phase::Aborting => self.roll_back().await,
                Phase::Succeeded | Phase::RolledBack => Flow::Stop,
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        debug!(rollout = %self.state.id, phase = %self.state.phase, "state machine stopped");
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            cmd.reject(format!("rollout {} is {}", self.state.id, self.state.phase));
        }
        self.state
    }

    /// Normalize a record loaded from the store: a held step is re-entered
    /// from the top, and an interrupted weight write is re-applied by the
    /// phase handler.
    fn prepare(&mut self) {
        let mut changed = self.state.pending_weight.take().is_some();

        match self.state.phase {
            Phase::Paused => {
                self.state.phase = Phase::Progressing;
                changed = true;
            }
            Phase::Degraded => {
                self.state.phase = match self.state.degraded_from.take() {
                    Some(Phase::Promoting) => Phase::Promoting,
                    _ => Phase::Progressing,
                };
                changed = true;
            }
            _ => {}
        }

        if changed {
            info!(
                rollout = %self.state.id,
                phase = %self.state.phase,
                step = self.state.current_step_index,
                "resuming rollout"
            );
            self.commit();
        }
    }

    fn initialize(&mut self) -> Flow {
        match self.state.spec.validate() {
            Ok(()) => {
                info!(
                    rollout = %self.state.id,
                    workload = %self.state.workload,
                    from = %self.state.spec.stable_version,
                    to = %self.state.spec.canary_version,
                    steps = self.state.spec.steps.len(),
                    "rollout started"
                );
                self.state.phase = Phase::Progressing;
                self.commit();
            }
            Err(e) => {
                self.begin_abort(format!("invalid rollout spec: {e}"), Vec::new(), DecidedBy::Controller);
            }
        }
        Flow::Continue
    }

    /// Apply the current step's weight and start holding it.
    async fn enter_step(&mut self) -> Flow {
        let index = self.state.current_step_index;
        let Some(weight) = self.state.spec.weight_at(index) else {
            self.begin_abort(
                format!("step index {index} is out of range"),
                Vec::new(),
                DecidedBy::Controller,
            );
            return Flow::Continue;
        };

        if !self.apply_weight(weight).await {
            return Flow::Continue;
        }
        self.state.step_started_at = Some(epoch_millis());
        self.state.phase = Phase::Paused;
        self.commit();
        info!(
            rollout = %self.state.id,
            workload = %self.state.workload,
            step = index,
            weight,
            "step started"
        );
        Flow::Continue
    }

    async fn hold_step(&mut self) -> Flow {
        let index = self.state.current_step_index;
        let pause = self
            .state
            .spec
            .steps
            .get(index)
            .map(|s| s.pause)
            .unwrap_or_default();

        if let HoldEnd::Passed(snapshot) = self.hold(pause).await {
            let now = epoch_millis();
            self.state.consecutive_check_failures = snapshot.failure_counters();
            self.state.record_outcome(StepOutcome {
                step_index: index,
                weight: self.state.applied_weight,
                verdict: OutcomeVerdict::Passed,
                failing_checks: Vec::new(),
                decided_by: DecidedBy::Analysis,
                note: None,
                started_at: self.state.step_started_at.unwrap_or(now),
                finished_at: now,
            });

            if index >= self.state.spec.last_step_index() {
                self.state.phase = Phase::Promoting;
                info!(rollout = %self.state.id, step = index, "all steps passed, promoting");
            } else {
                self.state.current_step_index = index + 1;
                self.state.phase = Phase::Progressing;
                info!(rollout = %self.state.id, step = index, "step passed");
            }
            self.commit();
        }
        Flow::Continue
    }

    /// Hold full traffic for the promotion window, then succeed.
    async fn promote(&mut self) -> Flow {
        if !self.apply_weight(100).await {
            return Flow::Continue;
        }
        self.commit();

        let window = self.state.spec.promotion_window();
        info!(
            rollout = %self.state.id,
            window = ?window,
            "holding full canary traffic for promotion window"
        );
        if let HoldEnd::Passed(snapshot) = self.hold(window).await {
            self.state.consecutive_check_failures = snapshot.failure_counters();
            self.succeed();
        }
        Flow::Continue
    }

    /// Wait out a hold while analysis runs.
    async fn hold(&mut self, duration: Duration) -> HoldEnd {
        let base_phase = self.state.phase;
        let index = self.state.current_step_index;
        let handle = self.deps.engine.start_step(
            &self.state.spec.checks,
            &self.state.spec.rollback_thresholds,
            self.canary_cohort(),
            &self.state.consecutive_check_failures,
        );
        let mut snapshots = handle.subscribe();
        let mut snapshots_open = true;

        let mut deadline = Instant::now() + duration;
        let mut remaining = duration;
        let mut extended = false;
        let mut degraded_deadline = Instant::now();

        loop {
            let degraded = self.state.phase == Phase::Degraded;

            let at_deadline = tokio::select! {
                cmd = self.commands.recv(), if self.commands_open => {
                    match cmd {
                        Some(cmd) => {
                            self.handle_command(cmd).await;
                            return HoldEnd::Interrupted;
                        }
                        None => {
                            self.commands_open = false;
                            continue;
                        }
                    }
                }
                changed = snapshots.changed(), if snapshots_open => {
                    if changed.is_err() {
                        snapshots_open = false;
                        continue;
                    }
                    false
                }
                _ = sleep_until(deadline), if !degraded => {
                    // Evaluations due at the deadline count toward this hold.
                    handle.settle(deadline).await;
                    true
                }
                _ = sleep_until(degraded_deadline), if degraded => {
                    self.begin_abort(
                        format!(
                            "metric source unavailable for longer than {:?}",
                            self.deps.settings.max_degraded
                        ),
                        Vec::new(),
                        DecidedBy::Controller,
                    );
                    return HoldEnd::Interrupted;
                }
            };

            let snapshot = snapshots.borrow_and_update().clone();

            if let Some(breach) = &snapshot.breach {
                let reason = breach.describe();
                let failing = vec![breach.threshold.clone()];
                self.alert(AlertKind::ThresholdBreach, reason.clone(), failing.clone());
                self.begin_abort(reason, failing, DecidedBy::Analysis);
                return HoldEnd::Interrupted;
            }
            if snapshot.verdict() == Verdict::Failed {
                let failing = snapshot.failing_checks();
                self.state.consecutive_check_failures = snapshot.failure_counters();
                self.begin_abort(
                    format!("analysis failed at step {index}: {}", failing.join(", ")),
                    failing,
                    DecidedBy::Analysis,
                );
                return HoldEnd::Interrupted;
            }

            let counters = snapshot.failure_counters();
            let counters_changed = counters != self.state.consecutive_check_failures;
            self.state.consecutive_check_failures = counters;

            if !degraded && snapshot.consecutive_query_errors >= self.deps.settings.degraded_after {
                let now = Instant::now();
                remaining = deadline.saturating_duration_since(now);
                degraded_deadline = now + self.deps.settings.max_degraded;
                self.state.degraded_from = Some(self.state.phase);
                self.state.phase = Phase::Degraded;
                self.state.last_error = snapshot.last_query_error.clone();
                self.commit();
                self.alert(
                    AlertKind::Degraded,
                    format!(
                        "metric source unavailable after {} consecutive query errors",
                        snapshot.consecutive_query_errors
                    ),
                    Vec::new(),
                );
                continue;
            } else if degraded && snapshot.consecutive_query_errors == 0 {
                deadline = Instant::now() + remaining;
                self.state.phase = self.state.degraded_from.take().unwrap_or(base_phase);
                self.state.last_error = None;
                self.commit();
                self.alert(AlertKind::Recovered, "metric source reachable again".to_string(), Vec::new());
            } else if counters_changed {
                self.commit();
            }

            if !at_deadline {
                continue;
            }
            match snapshot.verdict() {
                Verdict::Passed => return HoldEnd::Passed(snapshot),
                Verdict::Inconclusive if !extended => {
                    extended = true;
                    deadline = Instant::now() + duration;
                    info!(
                        rollout = %self.state.id,
                        step = index,
                        extension = ?duration,
                        "not enough evidence, extending hold once"
                    );
                }
                _ => {
                    let failing: Vec<String> = snapshot
                        .checks
                        .iter()
                        .filter(|(_, c)| c.verdict != Verdict::Passed)
                        .map(|(name, _)| name.clone())
                        .collect();
                    self.begin_abort(
                        format!("insufficient evidence at step {index}: {}", failing.join(", ")),
                        failing,
                        DecidedBy::Analysis,
                    );
                    return HoldEnd::Interrupted;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Abort { reason, reply } => {
                let _ = reply.send(Ok(()));
                warn!(rollout = %self.state.id, %reason, "operator abort");
                self.begin_abort(reason, Vec::new(), DecidedBy::Operator);
            }
            Command::Promote { reply } => {
                let _ = reply.send(Ok(()));
                self.operator_promote().await;
            }
        }
    }

    /// Skip remaining analysis: full traffic, then `Succeeded`.
    async fn operator_promote(&mut self) {
        let from_step = self.state.current_step_index;
        warn!(
            rollout = %self.state.id,
            workload = %self.state.workload,
            step = from_step,
            "operator override: promoting without remaining analysis"
        );
        let started_at = self.state.step_started_at.unwrap_or_else(epoch_millis);
        if !self.apply_weight(100).await {
            return;
        }

        self.state.current_step_index = self.state.spec.last_step_index().max(from_step);
        self.state.record_outcome(StepOutcome {
            step_index: self.state.current_step_index,
            weight: 100,
            verdict: OutcomeVerdict::Passed,
            failing_checks: Vec::new(),
            decided_by: DecidedBy::Operator,
            note: Some(format!("promoted by operator from step {from_step}")),
            started_at,
            finished_at: epoch_millis(),
        });
        self.succeed();
    }

    fn succeed(&mut self) {
        self.state.phase = Phase::Succeeded;
        self.state.degraded_from = None;
        self.commit();
        self.release_claim(true);
        info!(
            rollout = %self.state.id,
            workload = %self.state.workload,
            version = %self.state.spec.canary_version,
            "rollout succeeded"
        );
        self.alert(
            AlertKind::Succeeded,
            format!("{} is now the stable version", self.state.spec.canary_version),
            Vec::new(),
        );
    }

    fn begin_abort(&mut self, reason: String, failing_checks: Vec<String>, decided_by: DecidedBy) {
        warn!(
            rollout = %self.state.id,
            workload = %self.state.workload,
            step = self.state.current_step_index,
            weight = self.state.applied_weight,
            %reason,
            ?decided_by,
            "aborting rollout"
        );
        self.state.phase = Phase::Aborting;
        self.state.degraded_from = None;
        self.state.abort = Some(AbortInfo {
            reason: reason.clone(),
            failing_checks: failing_checks.clone(),
            decided_by,
        });
        self.commit();
        self.alert(AlertKind::Aborting, reason, failing_checks);
    }

    /// Return all traffic to stable and record the terminal outcome.
    async fn roll_back(&mut self) -> Flow {
        let abort = self.state.abort.clone().unwrap_or_else(|| AbortInfo {
            reason: "aborted".to_string(),
            failing_checks: Vec::new(),
            decided_by: DecidedBy::Controller,
        });
        let from_weight = self.state.applied_weight;

        self.state.pending_weight = Some(0);
        self.commit();

        match set_weight_with_retry(&self.splitter, 0, &self.deps.settings.backoff).await {
            Ok(()) => {
                let now = epoch_millis();
                self.state.applied_weight = 0;
                self.state.pending_weight = None;
                self.state.record_outcome(StepOutcome {
                    step_index: self.state.current_step_index,
                    weight: from_weight,
                    verdict: OutcomeVerdict::Aborted,
                    failing_checks: abort.failing_checks,
                    decided_by: abort.decided_by,
                    note: Some(abort.reason),
                    started_at: self.state.step_started_at.unwrap_or(now),
                    finished_at: now,
                });
                self.state.phase = Phase::RolledBack;
                self.commit();
                self.release_claim(false);
                info!(
                    rollout = %self.state.id,
                    workload = %self.state.workload,
                    step = self.state.current_step_index,
                    "rolled back to stable"
                );
                Flow::Continue
            }
            Err(e) => {
                self.state.pending_weight = None;
                self.state.applied_weight = self.splitter.current_weight();
                self.state.last_error = Some(format!("rollback to 0% failed: {e}"));
                self.commit();
                error!(
                    rollout = %self.state.id,
                    workload = %self.state.workload,
                    weight = self.state.applied_weight,
                    error = %e,
                    "rollback failed, canary traffic still routed"
                );
                self.alert(
                    AlertKind::RollbackFailed,
                    format!("rollback to stable failed: {e}"),
                    Vec::new(),
                );
                Flow::Stop
            }
        }
    }

    /// Write a weight with retries. On exhaustion the rollout is moved to
    /// `Aborting` and `false` is returned.
    async fn apply_weight(&mut self, weight: u8) -> bool {
        self.state.pending_weight = Some(weight);
        self.commit();

        match set_weight_with_retry(&self.splitter, weight, &self.deps.settings.backoff).await {
            Ok(()) => {
                self.state.applied_weight = weight;
                self.state.pending_weight = None;
                true
            }
            Err(e) => {
                self.state.pending_weight = None;
                self.state.applied_weight = self.splitter.current_weight();
                self.state.last_error = Some(format!("traffic write to {weight}% failed: {e}"));
                self.begin_abort(
                    format!("traffic write to {weight}% failed after retries: {e}"),
                    Vec::new(),
                    DecidedBy::Controller,
                );
                false
            }
        }
    }

    fn release_claim(&mut self, promoted: bool) {
        let new_stable = promoted.then(|| self.state.spec.canary_version.clone());
        if let Err(e) = self.deps.store.release_workload(
            &self.state.workload,
            &self.state.id,
            new_stable.as_deref(),
            epoch_millis(),
        ) {
            error!(rollout = %self.state.id, error = %e, "failed to release workload claim");
            self.state.last_error = Some(format!("failed to release workload claim: {e}"));
            self.commit();
        }
    }

    fn canary_cohort(&self) -> CohortLabels {
        cohort_labels(
            &self.state.id,
            &self.state.workload,
            Cohort::Canary,
            &self.state.spec.canary_version,
        )
    }

    /// Persist, then publish.
    fn commit(&mut self) {
        self.state.updated_at = epoch_millis();
        if let Err(e) = self.deps.store.put_rollout(&self.state) {
            error!(rollout = %self.state.id, error = %e, "failed to persist rollout state");
            self.state.last_error = Some(format!("failed to persist rollout state: {e}"));
        }
        self.status.send_replace(self.state.clone());
    }

    fn alert(&self, kind: AlertKind, message: String, failing_checks: Vec<String>) {
        self.deps.alerts.emit(&Alert {
            kind,
            severity: kind.severity(),
            rollout_id: self.state.id.clone(),
            workload: self.state.workload.clone(),
            step: self.state.current_step_index,
            weight: self.state.applied_weight,
            failing_checks,
            message,
            at: epoch_millis(),
        });
    }
}

pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
