//! Rollout controller — starts, tracks and commands rollout machines.
//!
//! The controller owns one slot per rollout it has spawned: the machine's
//! task handle, its status receiver and its command sender. It enforces
//! one active rollout per workload through the persisted workload claim,
//! and resumes unfinished rollouts after a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rollgate_analysis::AnalysisEngine;
use rollgate_core::{RolloutId, RolloutSpec};
use rollgate_state::{Phase, RolloutState, StateError, StateStore, WorkloadRecord};
use rollgate_traffic::SplitterProvider;

use crate::alert::AlertSink;
use crate::error::{ControllerError, ControllerResult};
use crate::machine::{Command, MachineDeps, MachineSettings, RolloutMachine, epoch_millis};

const COMMAND_BUFFER: usize = 16;

/// A spawned machine.
struct Slot {
    status: watch::Receiver<RolloutState>,
    commands: mpsc::Sender<Command>,
    handle: JoinHandle<RolloutState>,
}

/// Entry point for rollout operations.
pub struct RolloutController {
    deps: MachineDeps,
    splitters: Arc<dyn SplitterProvider>,
    /// Spawned machines: rollout id → slot.
    rollouts: RwLock<HashMap<RolloutId, Slot>>,
    sequence: AtomicU64,
}

impl RolloutController {
    pub fn new(
        store: StateStore,
        engine: AnalysisEngine,
        splitters: Arc<dyn SplitterProvider>,
        alerts: Arc<dyn AlertSink>,
        settings: MachineSettings,
    ) -> Self {
        Self {
            deps: MachineDeps {
                store,
                engine,
                alerts,
                settings,
            },
            splitters,
            rollouts: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.deps.store
    }

    /// Validate a spec, claim its workload and start a machine for it.
    pub async fn start(&self, spec: RolloutSpec) -> ControllerResult<RolloutId> {
        spec.validate()?;

        let id = self.next_id(&spec.workload);
        let now = epoch_millis();
        self.claim(&spec.workload, &id, &spec.stable_version, now)?;

        let workload = spec.workload.clone();
        let state = RolloutState::new(&id, spec, now);
        let stored = self
            .deps
            .store
            .put_rollout(&state)
            .map_err(ControllerError::from)
            .and_then(|_| self.splitters.splitter_for(&workload).map_err(ControllerError::from));
        if let Err(e) = stored {
            let _ = self.deps.store.delete_rollout(&id);
            let _ = self.deps.store.release_workload(&workload, &id, None, now);
            return Err(e);
        }

        self.spawn(state).await?;
        info!(rollout = %id, %workload, "rollout accepted");
        Ok(id)
    }

    /// Latest state of a rollout.
    pub async fn status(&self, id: &str) -> ControllerResult<RolloutState> {
        if let Some(slot) = self.rollouts.read().await.get(id) {
            return Ok(slot.status.borrow().clone());
        }
        self.deps
            .store
            .get_rollout(id)?
            .ok_or_else(|| ControllerError::NotFound(id.to_string()))
    }

    /// Every known rollout, oldest first.
    pub async fn list(&self) -> ControllerResult<Vec<RolloutState>> {
        let mut all = self.deps.store.list_rollouts()?;
        let slots = self.rollouts.read().await;
        for state in &mut all {
            if let Some(slot) = slots.get(&state.id) {
                *state = slot.status.borrow().clone();
            }
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    /// Receiver notified on every transition of a running rollout.
    pub async fn watch(&self, id: &str) -> ControllerResult<watch::Receiver<RolloutState>> {
        self.rollouts
            .read()
            .await
            .get(id)
            .map(|slot| slot.status.clone())
            .ok_or_else(|| ControllerError::NotFound(id.to_string()))
    }

    /// Abort a rollout and return its traffic to stable.
    ///
    /// A rollout left in `Aborting` by a failed rollback is re-attempted.
    pub async fn abort(&self, id: &str, reason: &str) -> ControllerResult<()> {
        let state = self.status(id).await?;
        if state.is_terminal() {
            return Err(ControllerError::OverrideConflict(format!(
                "rollout {id} is already {}",
                state.phase
            )));
        }
        if state.phase == Phase::Aborting {
            if self.is_running(id).await {
                return Err(ControllerError::OverrideConflict(format!(
                    "rollout {id} is already aborting"
                )));
            }
            info!(rollout = %id, "re-attempting rollback");
            self.spawn(state).await?;
            return Ok(());
        }

        info!(rollout = %id, %reason, "abort requested");
        let reason = reason.to_string();
        self.send_command(id, |reply| Command::Abort { reason, reply })
            .await
    }

    /// Operator override: skip remaining analysis and promote to 100%.
    pub async fn promote(&self, id: &str) -> ControllerResult<()> {
        let state = self.status(id).await?;
        if state.is_terminal() || state.phase == Phase::Aborting {
            return Err(ControllerError::OverrideConflict(format!(
                "cannot promote rollout {id}: it is {}",
                state.phase
            )));
        }

        info!(rollout = %id, "operator promote requested");
        self.send_command(id, |reply| Command::Promote { reply }).await
    }

    /// Restart a rolled-back rollout from step 0, optionally against a new
    /// canary version. History is kept.
    pub async fn retry(
        &self,
        id: &str,
        canary_version: Option<&str>,
    ) -> ControllerResult<RolloutState> {
        let state = self.status(id).await?;
        if state.phase != Phase::RolledBack {
            return Err(ControllerError::OverrideConflict(format!(
                "retry is only allowed from rolled_back; rollout {id} is {}",
                state.phase
            )));
        }

        let spec = match canary_version {
            Some(version) => state.spec.with_canary_version(version),
            None => state.spec.clone(),
        };
        spec.validate()?;

        let now = epoch_millis();
        self.claim(&spec.workload, id, &spec.stable_version, now)?;

        let mut next = state;
        next.spec = spec;
        next.current_step_index = 0;
        next.phase = Phase::Progressing;
        next.pending_weight = None;
        next.step_started_at = None;
        next.consecutive_check_failures.clear();
        next.last_error = None;
        next.degraded_from = None;
        next.abort = None;
        next.attempt += 1;
        next.updated_at = now;

        if let Err(e) = self.deps.store.put_rollout(&next) {
            let _ = self.deps.store.release_workload(&next.workload, id, None, now);
            return Err(e.into());
        }
        self.spawn(next.clone()).await?;

        info!(
            rollout = %id,
            attempt = next.attempt,
            version = %next.spec.canary_version,
            "rollout retried"
        );
        Ok(next)
    }

    /// Resume every unfinished rollout found in the store.
    pub async fn recover(&self) -> ControllerResult<Vec<RolloutId>> {
        self.release_stale_claims()?;

        let mut resumed = Vec::new();
        for state in self.deps.store.list_unfinished_rollouts()? {
            if self.is_running(&state.id).await {
                continue;
            }
            match self.deps.store.claim_workload(
                &state.workload,
                &state.id,
                &state.spec.stable_version,
                epoch_millis(),
            ) {
                Ok(_) => {}
                Err(StateError::Claimed { holder, .. }) => {
                    warn!(
                        rollout = %state.id,
                        workload = %state.workload,
                        %holder,
                        "workload claimed by another rollout, not resuming"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            info!(
                rollout = %state.id,
                phase = %state.phase,
                step = state.current_step_index,
                "recovering rollout"
            );
            let id = state.id.clone();
            self.spawn(state).await?;
            resumed.push(id);
        }
        Ok(resumed)
    }

    /// Resolve once the rollout's machine stops: a terminal phase, or
    /// `Aborting` after a failed rollback.
    pub async fn wait(&self, id: &str) -> ControllerResult<RolloutState> {
        let rx = self
            .rollouts
            .read()
            .await
            .get(id)
            .map(|slot| slot.status.clone());
        let Some(mut rx) = rx else {
            return self.status(id).await;
        };
        while rx.changed().await.is_ok() {}
        let state = rx.borrow().clone();
        Ok(state)
    }

    pub fn workloads(&self) -> ControllerResult<Vec<WorkloadRecord>> {
        Ok(self.deps.store.list_workloads()?)
    }

    /// Stop every machine. Persisted state is resumed by `recover`.
    pub async fn shutdown(&self) {
        let mut slots = self.rollouts.write().await;
        for (id, slot) in slots.drain() {
            slot.handle.abort();
            debug!(rollout = %id, "state machine stopped");
        }
        info!("all rollout machines stopped");
    }

    async fn spawn(&self, state: RolloutState) -> ControllerResult<()> {
        let splitter = self.splitters.splitter_for(&state.workload)?;
        let id = state.id.clone();
        let (status_tx, status_rx) = watch::channel(state.clone());
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

        let machine = RolloutMachine::new(state, self.deps.clone(), splitter, status_tx, cmd_rx);
        let handle = tokio::spawn(machine.run());

        let mut slots = self.rollouts.write().await;
        if let Some(old) = slots.insert(
            id,
            Slot {
                status: status_rx,
                commands: cmd_tx,
                handle,
            },
        ) {
            old.handle.abort();
        }
        Ok(())
    }

    async fn is_running(&self, id: &str) -> bool {
        self.rollouts
            .read()
            .await
            .get(id)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    async fn send_command(
        &self,
        id: &str,
        make: impl FnOnce(oneshot::Sender<ControllerResult<()>>) -> Command,
    ) -> ControllerResult<()> {
        let sender = self
            .rollouts
            .read()
            .await
            .get(id)
            .map(|slot| slot.commands.clone())
            .ok_or_else(|| ControllerError::OverrideConflict(format!("rollout {id} is not running")))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender.send(make(reply_tx)).await.map_err(|_| {
            ControllerError::OverrideConflict(format!("rollout {id} is not running"))
        })?;
        reply_rx.await.map_err(|_| {
            ControllerError::OverrideConflict(format!(
                "rollout {id} stopped before the command was handled"
            ))
        })?
    }

    fn claim(
        &self,
        workload: &str,
        id: &str,
        stable_version: &str,
        now: u64,
    ) -> ControllerResult<()> {
        match self
            .deps
            .store
            .claim_workload(workload, id, stable_version, now)
        {
            Ok(_) => Ok(()),
            Err(StateError::Claimed { workload, holder }) => {
                Err(ControllerError::AlreadyActive { workload, holder })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop claims whose holder finished without releasing them.
    fn release_stale_claims(&self) -> ControllerResult<()> {
        let now = epoch_millis();
        for record in self.deps.store.list_workloads()? {
            let Some(holder) = record.active_rollout.as_deref() else {
                continue;
            };
            match self.deps.store.get_rollout(holder)? {
                Some(r) if !r.is_terminal() => {}
                Some(r) => {
                    let promoted = (r.phase == Phase::Succeeded).then_some(r.spec.canary_version.as_str());
                    self.deps.store.release_workload(&record.workload, holder, promoted, now)?;
                    info!(workload = %record.workload, rollout = %holder, "released stale claim");
                }
                None => {
                    self.deps.store.release_workload(&record.workload, holder, None, now)?;
                    info!(workload = %record.workload, rollout = %holder, "released orphaned claim");
                }
            }
        }
        Ok(())
    }

    fn next_id(&self, workload: &str) -> RolloutId {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{workload}-{}-{seq}", epoch_millis())
    }
}
