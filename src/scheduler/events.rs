//! Transition events emitted during a run, for UIs and logging.

use serde::{Deserialize, Serialize};

use crate::model::{CheckpointId, ExecutionId, RunId};

/// Events emitted by the scheduler as a run progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run has started executing.
    RunStarted { run_id: RunId },
    /// A phase is ready but waits for an explicit continue.
    PhaseStaged { run_id: RunId, phase: String },
    /// A phase execution has been dispatched.
    PhaseStarted {
        run_id: RunId,
        phase: String,
        execution_id: ExecutionId,
        attempt: u32,
    },
    /// A phase reached completed, by validation or by force-accept.
    PhaseCompleted {
        run_id: RunId,
        phase: String,
        execution_id: ExecutionId,
        force_accepted: bool,
    },
    /// A phase execution failed.
    PhaseFailed {
        run_id: RunId,
        phase: String,
        execution_id: ExecutionId,
        error: String,
    },
    /// A failed phase was explicitly skipped.
    PhaseSkipped { run_id: RunId, phase: String },
    /// A checkpoint was taken after a phase completion.
    CheckpointCreated {
        run_id: RunId,
        checkpoint_id: CheckpointId,
        after_phase: String,
    },
    /// Run state was restored from a checkpoint.
    RolledBack {
        run_id: RunId,
        checkpoint_id: CheckpointId,
    },
    /// Dispatch stopped. `blocked` is true when the pause came from the
    /// scheduler because no dispatchable work remains, not from a command.
    RunPaused { run_id: RunId, blocked: bool },
    /// Dispatch resumed.
    RunResumed { run_id: RunId },
    /// Forward progress halted for an entity and a human was notified.
    Escalated {
        run_id: RunId,
        entity_id: String,
        reason: String,
    },
    /// A command could not be applied to the current state.
    CommandRejected { run_id: RunId, message: String },
    /// Every phase completed or was skipped.
    RunCompleted { run_id: RunId },
    /// The run was abandoned or could no longer progress.
    RunFailed { run_id: RunId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = RunEvent::PhaseStaged {
            run_id: RunId::new(),
            phase: "05".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"phase_staged\""));
        assert!(json.contains("\"phase\":\"05\""));
    }

    #[test]
    fn test_event_roundtrip() {
        let event = RunEvent::RunPaused {
            run_id: RunId::new(),
            blocked: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        let decoded: RunEvent = serde_json::from_str(&json).unwrap();
        match decoded {
            RunEvent::RunPaused { blocked, .. } => assert!(blocked),
            other => panic!("Expected RunPaused, got {:?}", other),
        }
    }
}
