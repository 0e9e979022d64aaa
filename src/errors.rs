//! Typed error hierarchy for the conductor engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `TemplateError` — template loading and graph validation failures
//! - `PhaseError` — per-phase execution failures
//! - `SchedulerError` — run-level coordination and rollback failures

use thiserror::Error;

use crate::model::{CheckpointId, RunId, TemplateId};
use crate::validation::ValidationFailure;

/// Errors raised while loading or validating a workflow template.
///
/// All variants are fatal at load time: a template that fails validation is
/// never registered and can never back a run.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Cycle detected in phase dependencies. Involved phases: {phases:?}")]
    DependencyCycle { phases: Vec<String> },

    #[error("Phase {phase} references unknown output schema {schema}")]
    UnknownSchema { phase: String, schema: String },

    #[error("Output schema {schema} is not a valid JSON Schema: {message}")]
    InvalidSchema { schema: String, message: String },

    #[error("Template {0} not found")]
    NotFound(TemplateId),
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Phase {phase} timed out after {timeout_seconds}s in run {run_id}")]
    Timeout {
        run_id: RunId,
        phase: String,
        timeout_seconds: u64,
    },

    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    #[error("Repair budget exhausted after {cycles} cycles for phase {phase} in run {run_id}")]
    RepairExhausted {
        run_id: RunId,
        phase: String,
        cycles: u32,
    },

    #[error("Builder agent failed for phase {phase}: {message}")]
    Agent { phase: String, message: String },

    #[error("Phase {phase} was cancelled before producing terminal output")]
    Cancelled { phase: String },
}

/// Errors from the run-level scheduler and checkpoint subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Defensive check only: the dependency graph is validated at template
    /// load, so a dispatch with an unsatisfied dependency indicates a bug.
    #[error("Phase {phase} dispatched with non-completed dependency {dependency} in run {run_id}")]
    DependencyUnsatisfied {
        run_id: RunId,
        phase: String,
        dependency: String,
    },

    #[error("Checkpoint {checkpoint} belongs to run {checkpoint_run}, not run {run_id}")]
    RollbackConflict {
        run_id: RunId,
        checkpoint: CheckpointId,
        checkpoint_run: RunId,
    },

    #[error("Run {run_id} has no checkpoint {checkpoint}")]
    UnknownCheckpoint {
        run_id: RunId,
        checkpoint: CheckpointId,
    },

    #[error("Run {run_id} has no phase {phase}")]
    UnknownPhase { run_id: RunId, phase: String },

    #[error("Invalid command for run {run_id}: {message}")]
    InvalidCommand { run_id: RunId, message: String },

    #[error("Run {run_id} is no longer accepting commands")]
    RunTerminated { run_id: RunId },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckpointId, RunId};

    #[test]
    fn template_error_cycle_names_phases() {
        let err = TemplateError::DependencyCycle {
            phases: vec!["build".into(), "test".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("build"));
        assert!(msg.contains("test"));
    }

    #[test]
    fn phase_error_timeout_carries_identifiers() {
        let run_id = RunId::new();
        let err = PhaseError::Timeout {
            run_id,
            phase: "05".into(),
            timeout_seconds: 30,
        };
        let msg = err.to_string();
        assert!(msg.contains("05"));
        assert!(msg.contains("30"));
        assert!(msg.contains(&run_id.to_string()));
    }

    #[test]
    fn scheduler_error_rollback_conflict_is_matchable() {
        let run_id = RunId::new();
        let other = RunId::new();
        let err = SchedulerError::RollbackConflict {
            run_id,
            checkpoint: CheckpointId::new(),
            checkpoint_run: other,
        };
        match &err {
            SchedulerError::RollbackConflict { checkpoint_run, .. } => {
                assert_eq!(*checkpoint_run, other);
            }
            _ => panic!("Expected RollbackConflict"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&TemplateError::DuplicatePhase("01".into()));
        assert_std_error(&PhaseError::Cancelled { phase: "01".into() });
        assert_std_error(&SchedulerError::RunTerminated {
            run_id: RunId::new(),
        });
    }
}
