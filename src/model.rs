//! Run-level data model for the conductor engine.
//!
//! Everything a `PipelineRun` accumulates while executing lives here: the run
//! itself, per-phase executions, validated artifacts, checkpoints and the
//! append-only tool-call audit trail. Status enums serialize as snake_case
//! strings and round-trip through `FromStr` so they can be stored as plain
//! text columns by any persistence backend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::template::{ModelTier, TemplateSnapshot};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(
    /// Identity of a registered workflow template.
    TemplateId
);
entity_id!(
    /// Identity of a project that owns pipeline runs.
    ProjectId
);
entity_id!(
    /// Identity of one pipeline run.
    RunId
);
entity_id!(
    /// Identity of one phase execution attempt within a run.
    ExecutionId
);
entity_id!(
    /// Identity of a schema-validated (or force-accepted) phase output.
    ArtifactId
);
entity_id!(
    /// Identity of a restorable run snapshot.
    CheckpointId
);

/// Status of a project or pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Active status of a phase within a run.
///
/// This is the scheduler's view used for frontier computation and checkpoint
/// snapshots; individual attempts carry their own [`ExecutionStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

/// Status of one phase execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::RolledBack
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "rolled_back" => Ok(Self::RolledBack),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// A project owns pipeline runs over time. Mutated only by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub status: RunStatus,
    pub current_phase: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: &str) -> Self {
        Self {
            id: ProjectId::new(),
            name: name.to_string(),
            status: RunStatus::Idle,
            current_phase: None,
            created_at: Utc::now(),
        }
    }
}

/// One execution attempt of a project's pipeline against a frozen template
/// snapshot. Later edits to the template never affect an in-flight run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub project_id: ProjectId,
    pub snapshot: TemplateSnapshot,
    pub status: RunStatus,
    pub current_phase: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(project_id: ProjectId, snapshot: TemplateSnapshot) -> Self {
        Self {
            id: RunId::new(),
            project_id,
            snapshot,
            status: RunStatus::Idle,
            current_phase: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Resource usage accumulated by one phase execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub tool_calls: u32,
    pub duration_ms: u64,
}

/// One phase's runtime attempt within a run.
///
/// Retries append new executions with an incremented `attempt`; prior rows
/// are never mutated, so the full attempt history survives in the audit
/// trail. `sequence` is monotonic per run and orders executions against
/// checkpoint watermarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseExecution {
    pub id: ExecutionId,
    pub run_id: RunId,
    pub phase: String,
    pub sequence: u64,
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub model_tier: ModelTier,
    pub usage: ResourceUsage,
    pub checkpoint: Option<CheckpointId>,
    /// Raw agent output retained when validation fails, so a later
    /// force-accept can materialize it without re-running the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PhaseExecution {
    pub fn new(
        run_id: RunId,
        phase: &str,
        sequence: u64,
        attempt: u32,
        model_tier: ModelTier,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            run_id,
            phase: phase.to_string(),
            sequence,
            attempt,
            status: ExecutionStatus::Pending,
            model_tier,
            usage: ResourceUsage::default(),
            checkpoint: None,
            raw_output: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn begin(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, usage: ResourceUsage) {
        self.status = ExecutionStatus::Completed;
        self.usage = usage;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str, usage: ResourceUsage) {
        self.status = ExecutionStatus::Failed;
        self.usage = usage;
        self.error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }

    pub fn roll_back(&mut self) {
        self.status = ExecutionStatus::RolledBack;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

/// An immutable, schema-validated phase output.
///
/// A force-accepted artifact is flagged rather than being indistinguishable
/// from a normally-validated one; a partial artifact is salvage from a
/// timed-out agent session and never satisfies downstream dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub run_id: RunId,
    pub execution_id: ExecutionId,
    pub phase: String,
    pub schema: String,
    pub payload: Value,
    pub force_accepted: bool,
    pub partial: bool,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn validated(
        run_id: RunId,
        execution_id: ExecutionId,
        phase: &str,
        schema: &str,
        payload: Value,
    ) -> Self {
        Self {
            id: ArtifactId::new(),
            run_id,
            execution_id,
            phase: phase.to_string(),
            schema: schema.to_string(),
            payload,
            force_accepted: false,
            partial: false,
            created_at: Utc::now(),
        }
    }

    pub fn forced(
        run_id: RunId,
        execution_id: ExecutionId,
        phase: &str,
        schema: &str,
        payload: Value,
    ) -> Self {
        Self {
            force_accepted: true,
            ..Self::validated(run_id, execution_id, phase, schema, payload)
        }
    }

    pub fn partial(
        run_id: RunId,
        execution_id: ExecutionId,
        phase: &str,
        schema: &str,
        payload: Value,
    ) -> Self {
        Self {
            partial: true,
            ..Self::validated(run_id, execution_id, phase, schema, payload)
        }
    }
}

/// A restorable point-in-time snapshot of run state, taken at a
/// phase-completion boundary. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub run_id: RunId,
    pub taken_after: String,
    /// Highest execution sequence that existed when the snapshot was taken.
    /// Executions above this watermark are invalidated by a rollback.
    pub sequence_watermark: u64,
    pub phase_statuses: BTreeMap<String, PhaseStatus>,
    pub current_phase: Option<String>,
    pub artifacts: BTreeMap<String, ArtifactId>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record of one unit of builder-agent activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: Uuid,
    pub run_id: RunId,
    pub execution_id: ExecutionId,
    pub name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ToolCall {
    pub fn new(
        run_id: RunId,
        execution_id: ExecutionId,
        name: &str,
        input: Value,
        output: Option<Value>,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            execution_id,
            name: name.to_string(),
            input,
            output,
            duration_ms,
            created_at: Utc::now(),
        }
    }
}

/// The in-memory aggregate the scheduler owns for one run: the run row, the
/// active per-phase view, every execution attempt and all artifacts and
/// checkpoints created so far.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run: PipelineRun,
    pub phase_statuses: BTreeMap<String, PhaseStatus>,
    pub active_artifacts: BTreeMap<String, ArtifactId>,
    pub artifacts: BTreeMap<ArtifactId, Artifact>,
    pub executions: Vec<PhaseExecution>,
    pub checkpoints: Vec<Checkpoint>,
    next_sequence: u64,
}

impl RunState {
    pub fn new(run: PipelineRun) -> Self {
        let phase_statuses = run
            .snapshot
            .template
            .phases
            .iter()
            .map(|p| (p.id.clone(), PhaseStatus::Pending))
            .collect();
        Self {
            run,
            phase_statuses,
            active_artifacts: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            executions: Vec::new(),
            checkpoints: Vec::new(),
            next_sequence: 0,
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    pub fn highest_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn execution(&self, id: ExecutionId) -> Option<&PhaseExecution> {
        self.executions.iter().find(|e| e.id == id)
    }

    pub fn execution_mut(&mut self, id: ExecutionId) -> Option<&mut PhaseExecution> {
        self.executions.iter_mut().find(|e| e.id == id)
    }

    /// Latest execution attempt for a phase, if any.
    pub fn latest_execution(&self, phase: &str) -> Option<&PhaseExecution> {
        self.executions
            .iter()
            .filter(|e| e.phase == phase)
            .max_by_key(|e| e.sequence)
    }

    pub fn attempts_for(&self, phase: &str) -> u32 {
        self.executions.iter().filter(|e| e.phase == phase).count() as u32
    }

    pub fn checkpoint(&self, id: CheckpointId) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.id == id)
    }

    pub fn active_artifact(&self, phase: &str) -> Option<&Artifact> {
        self.active_artifacts
            .get(phase)
            .and_then(|id| self.artifacts.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for s in &["idle", "running", "paused", "completed", "failed"] {
            let parsed: RunStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_phase_status_roundtrip() {
        for s in &["pending", "running", "completed", "failed", "skipped"] {
            let parsed: PhaseStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<PhaseStatus>().is_err());
    }

    #[test]
    fn test_execution_status_roundtrip() {
        for s in &[
            "pending",
            "running",
            "completed",
            "failed",
            "skipped",
            "rolled_back",
        ] {
            let parsed: ExecutionStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_serde_produces_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::RolledBack).unwrap(),
            "\"rolled_back\""
        );
        assert_eq!(
            serde_json::to_string(&RunStatus::Paused).unwrap(),
            "\"paused\""
        );
    }

    #[test]
    fn test_status_terminality() {
        assert!(!RunStatus::Paused.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(PhaseStatus::Skipped.is_terminal());
        assert!(!PhaseStatus::Running.is_terminal());
        assert!(ExecutionStatus::RolledBack.is_terminal());
    }

    #[test]
    fn test_execution_lifecycle_helpers() {
        let mut exec = PhaseExecution::new(RunId::new(), "01", 1, 1, ModelTier::Standard);
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert!(exec.started_at.is_none());

        exec.begin();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert!(exec.started_at.is_some());

        exec.complete(ResourceUsage {
            tool_calls: 3,
            duration_ms: 1200,
        });
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.usage.tool_calls, 3);
        assert!(exec.finished_at.is_some());
    }

    #[test]
    fn test_execution_failure_keeps_error() {
        let mut exec = PhaseExecution::new(RunId::new(), "02", 1, 1, ModelTier::Fast);
        exec.begin();
        exec.fail("budget exhausted", ResourceUsage::default());
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("budget exhausted"));
    }

    #[test]
    fn test_artifact_flags() {
        let run = RunId::new();
        let exec = ExecutionId::new();
        let ok = Artifact::validated(run, exec, "01", "plan", serde_json::json!({}));
        assert!(!ok.force_accepted);
        assert!(!ok.partial);

        let forced = Artifact::forced(run, exec, "01", "plan", serde_json::json!({}));
        assert!(forced.force_accepted);
        assert!(!forced.partial);

        let partial = Artifact::partial(run, exec, "01", "plan", serde_json::json!({}));
        assert!(partial.partial);
        assert!(!partial.force_accepted);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let mut state = RunState {
            run: PipelineRun {
                id: RunId::new(),
                project_id: ProjectId::new(),
                snapshot: crate::template::TemplateSnapshot::empty_for_tests(),
                status: RunStatus::Idle,
                current_phase: None,
                started_at: Utc::now(),
                finished_at: None,
            },
            phase_statuses: BTreeMap::new(),
            active_artifacts: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            executions: Vec::new(),
            checkpoints: Vec::new(),
            next_sequence: 0,
        };
        assert_eq!(state.next_sequence(), 1);
        assert_eq!(state.next_sequence(), 2);
        assert_eq!(state.highest_sequence(), 2);
    }
}
