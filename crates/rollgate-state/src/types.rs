//! Persisted rollout records.
//!
//! These types represent the durable state of rollouts and workloads.
//! All types are serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use rollgate_core::{RolloutId, RolloutSpec};

// ── Phase ──────────────────────────────────────────────────────────

/// Lifecycle phase of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Spec accepted, not yet validated or routed.
    Initializing,
    /// Moving traffic to the current step's weight.
    Progressing,
    /// Holding the current step's weight while analysis runs.
    Paused,
    /// Metric source unreachable; weight held, timer frozen.
    Degraded,
    /// All steps passed; validating 100% canary traffic.
    Promoting,
    /// Canary is the new stable version.
    Succeeded,
    /// Reverting all traffic to the stable version.
    Aborting,
    /// All traffic back on stable.
    RolledBack,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::Progressing => "progressing",
            Phase::Paused => "paused",
            Phase::Degraded => "degraded",
            Phase::Promoting => "promoting",
            Phase::Succeeded => "succeeded",
            Phase::Aborting => "aborting",
            Phase::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Step outcomes ──────────────────────────────────────────────────

/// Verdict recorded in a step outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeVerdict {
    Passed,
    Failed,
    Aborted,
}

/// Who made the decision recorded in an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidedBy {
    /// Automatic analysis verdict or threshold breach.
    Analysis,
    /// An operator command (abort, promote).
    Operator,
    /// Controller-internal exhaustion (traffic writes, prolonged outage).
    Controller,
}

/// Append-only audit record for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_index: usize,
    pub weight: u8,
    pub verdict: OutcomeVerdict,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failing_checks: Vec<String>,
    pub decided_by: DecidedBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Unix millis when the step's weight was applied.
    pub started_at: u64,
    /// Unix millis when the verdict was reached.
    pub finished_at: u64,
}

/// Why a rollout is aborting. Present only while `phase == Aborting`
/// and kept afterwards for the status API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortInfo {
    pub reason: String,
    #[serde(default)]
    pub failing_checks: Vec<String>,
    pub decided_by: DecidedBy,
}

// ── Rollout state ──────────────────────────────────────────────────

/// The mutable record for one rollout. Written only by the state machine
/// that owns it; persisted after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutState {
    pub id: RolloutId,
    pub workload: String,
    pub spec: RolloutSpec,
    pub current_step_index: usize,
    pub phase: Phase,
    /// Canary weight confirmed by the traffic splitter.
    pub applied_weight: u8,
    /// Weight currently being written, if a change is in flight.
    #[serde(default)]
    pub pending_weight: Option<u8>,
    /// Unix millis when the current step's weight was applied.
    #[serde(default)]
    pub step_started_at: Option<u64>,
    #[serde(default)]
    pub consecutive_check_failures: BTreeMap<String, u32>,
    #[serde(default)]
    pub history: Vec<StepOutcome>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Phase to restore once a degraded rollout recovers.
    #[serde(default)]
    pub degraded_from: Option<Phase>,
    #[serde(default)]
    pub abort: Option<AbortInfo>,
    /// Starts at 1; incremented by each operator retry.
    pub attempt: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RolloutState {
    /// A fresh rollout in `Initializing`.
    pub fn new(id: &str, spec: RolloutSpec, now: u64) -> Self {
        Self {
            id: id.to_string(),
            workload: spec.workload.clone(),
            spec,
            current_step_index: 0,
            phase: Phase::Initializing,
            applied_weight: 0,
            pending_weight: None,
            step_started_at: None,
            consecutive_check_failures: BTreeMap::new(),
            history: Vec::new(),
            last_error: None,
            degraded_from: None,
            abort: None,
            attempt: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Table key: the rollout id.
    pub fn table_key(&self) -> String {
        self.id.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Canary weight that the current phase and step call for.
    pub fn mandated_weight(&self) -> u8 {
        match self.phase {
            Phase::Initializing | Phase::Aborting | Phase::RolledBack => 0,
            Phase::Progressing | Phase::Paused | Phase::Degraded => self
                .spec
                .weight_at(self.current_step_index)
                .unwrap_or(100),
            Phase::Promoting | Phase::Succeeded => 100,
        }
    }

    /// True when the applied weight matches the phase and no write is pending.
    pub fn weight_settled(&self) -> bool {
        self.pending_weight.is_none() && self.applied_weight == self.mandated_weight()
    }

    pub fn last_outcome(&self) -> Option<&StepOutcome> {
        self.history.last()
    }

    /// Append to the audit trail. History is never rewritten.
    pub fn record_outcome(&mut self, outcome: StepOutcome) {
        self.history.push(outcome);
    }
}

// ── Workloads ──────────────────────────────────────────────────────

/// Per-workload record: which version is stable and which rollout,
/// if any, currently holds the single-writer claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub workload: String,
    pub stable_version: String,
    #[serde(default)]
    pub active_rollout: Option<RolloutId>,
    pub updated_at: u64,
}

impl WorkloadRecord {
    pub fn table_key(&self) -> String {
        self.workload.clone()
    }
}
