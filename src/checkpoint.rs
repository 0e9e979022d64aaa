//! Checkpoint creation and rollback.
//!
//! Checkpoints are taken at phase-completion boundaries and capture just
//! enough run state to restart from: per-phase statuses, the current phase
//! pointer, the active artifact references and a sequence watermark.
//! Rollback restores that snapshot and marks every execution that happened
//! strictly after the watermark as rolled back; audit records survive, the
//! active state forgets them.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::SchedulerError;
use crate::model::{Checkpoint, CheckpointId, ExecutionId, PhaseStatus, RunState};

/// At which phase-completion boundaries checkpoints are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// After every completed phase.
    #[default]
    EveryPhase,
    /// After every Nth completed phase.
    EveryNth(u32),
    /// Never checkpoint; rollback is unavailable for the run.
    Disabled,
}

impl CheckpointPolicy {
    /// Decide whether to checkpoint after the given completion count.
    pub fn should_checkpoint(&self, completed_count: usize) -> bool {
        match self {
            Self::EveryPhase => true,
            Self::EveryNth(n) => *n > 0 && completed_count % (*n as usize) == 0,
            Self::Disabled => false,
        }
    }
}

impl fmt::Display for CheckpointPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EveryPhase => f.write_str("every_phase"),
            Self::EveryNth(n) => write!(f, "every_{}", n),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}

impl FromStr for CheckpointPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "every_phase" => Ok(Self::EveryPhase),
            "disabled" => Ok(Self::Disabled),
            other => other
                .strip_prefix("every_")
                .and_then(|n| n.parse().ok())
                .map(Self::EveryNth)
                .ok_or_else(|| format!("Invalid checkpoint policy: {}", s)),
        }
    }
}

/// What a rollback restored, for event reporting.
#[derive(Debug, Clone)]
pub struct RestoredState {
    pub checkpoint: CheckpointId,
    pub current_phase: Option<String>,
    /// Executions newly invalidated by this rollback.
    pub invalidated: Vec<ExecutionId>,
}

/// Creates checkpoints and restores run state from them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointManager {
    policy: CheckpointPolicy,
}

impl CheckpointManager {
    pub fn new(policy: CheckpointPolicy) -> Self {
        Self { policy }
    }

    pub fn should_checkpoint(&self, completed_count: usize) -> bool {
        self.policy.should_checkpoint(completed_count)
    }

    /// Snapshot the run at a phase-completion boundary.
    ///
    /// Phases still running when the snapshot is taken are captured as
    /// pending, so a later rollback restores a restartable state rather
    /// than a phantom in-flight one.
    pub fn create(&self, state: &RunState, after_phase: &str) -> Checkpoint {
        let phase_statuses = state
            .phase_statuses
            .iter()
            .map(|(id, status)| {
                let captured = match status {
                    PhaseStatus::Running => PhaseStatus::Pending,
                    other => *other,
                };
                (id.clone(), captured)
            })
            .collect();

        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            run_id: state.run.id,
            taken_after: after_phase.to_string(),
            sequence_watermark: state.highest_sequence(),
            phase_statuses,
            current_phase: state.run.current_phase.clone(),
            artifacts: state.active_artifacts.clone(),
            created_at: Utc::now(),
        };

        info!(
            run_id = %state.run.id,
            checkpoint = %checkpoint.id,
            after_phase,
            watermark = checkpoint.sequence_watermark,
            "checkpoint created"
        );

        checkpoint
    }

    /// Restore run state from a checkpoint.
    ///
    /// Validates that the checkpoint belongs to the run, restores the
    /// snapshot and marks every execution above the watermark as rolled
    /// back. Idempotent: repeating the call against the restored state is a
    /// no-op that invalidates nothing further.
    pub fn rollback(
        &self,
        state: &mut RunState,
        checkpoint: &Checkpoint,
    ) -> Result<RestoredState, SchedulerError> {
        if checkpoint.run_id != state.run.id {
            return Err(SchedulerError::RollbackConflict {
                run_id: state.run.id,
                checkpoint: checkpoint.id,
                checkpoint_run: checkpoint.run_id,
            });
        }

        let mut invalidated = Vec::new();
        for execution in &mut state.executions {
            if execution.sequence > checkpoint.sequence_watermark
                && execution.status != crate::model::ExecutionStatus::RolledBack
            {
                execution.roll_back();
                invalidated.push(execution.id);
            }
        }

        state.phase_statuses = checkpoint.phase_statuses.clone();
        state.active_artifacts = checkpoint.artifacts.clone();
        state.run.current_phase = checkpoint.current_phase.clone();

        info!(
            run_id = %state.run.id,
            checkpoint = %checkpoint.id,
            invalidated = invalidated.len(),
            "rollback restored run state"
        );

        Ok(RestoredState {
            checkpoint: checkpoint.id,
            current_phase: checkpoint.current_phase.clone(),
            invalidated,
        })
    }
}
