//! Injected persistence for run-level state.
//!
//! The engine requires durable, atomic writes per state transition but is
//! agnostic to the storage technology: the scheduler and executor write
//! through the [`RunStore`] trait and keep their own authoritative state in
//! memory. [`MemoryStore`] backs tests and ephemeral runs; the JSON file
//! store in [`json`] provides simple durable storage.

pub mod json;

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Result, bail};
use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{
    Artifact, ArtifactId, Checkpoint, CheckpointId, ExecutionId, PhaseExecution, PipelineRun,
    Project, ProjectId, RunId, ToolCall,
};

pub use json::JsonStore;

/// Durable storage for projects, runs, executions, artifacts, checkpoints
/// and the tool-call audit trail.
///
/// Saves are upserts keyed by entity id, except `append_tool_call`, which is
/// write-once: implementations must reject a second write with the same id.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_project(&self, project: &Project) -> Result<()>;
    async fn save_run(&self, run: &PipelineRun) -> Result<()>;
    async fn save_execution(&self, execution: &PhaseExecution) -> Result<()>;
    async fn save_artifact(&self, artifact: &Artifact) -> Result<()>;
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn append_tool_call(&self, call: &ToolCall) -> Result<()>;

    async fn load_project(&self, id: ProjectId) -> Result<Option<Project>>;
    async fn load_run(&self, id: RunId) -> Result<Option<PipelineRun>>;
    async fn executions_for_run(&self, run_id: RunId) -> Result<Vec<PhaseExecution>>;
    async fn artifacts_for_run(&self, run_id: RunId) -> Result<Vec<Artifact>>;
    async fn checkpoints_for_run(&self, run_id: RunId) -> Result<Vec<Checkpoint>>;
    async fn tool_calls_for_run(&self, run_id: RunId) -> Result<Vec<ToolCall>>;
    async fn tool_calls_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<ToolCall>>;
}

#[derive(Default)]
struct MemoryInner {
    projects: HashMap<ProjectId, Project>,
    runs: HashMap<RunId, PipelineRun>,
    executions: HashMap<ExecutionId, PhaseExecution>,
    artifacts: HashMap<ArtifactId, Artifact>,
    checkpoints: HashMap<CheckpointId, Checkpoint>,
    tool_calls: Vec<ToolCall>,
    tool_call_ids: std::collections::HashSet<Uuid>,
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryInner>> {
        self.inner
            .read()
            .map_err(|_| anyhow::anyhow!("Store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryInner>> {
        self.inner
            .write()
            .map_err(|_| anyhow::anyhow!("Store lock poisoned"))
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn save_project(&self, project: &Project) -> Result<()> {
        self.write()?.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<()> {
        self.write()?.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn save_execution(&self, execution: &PhaseExecution) -> Result<()> {
        self.write()?
            .executions
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn save_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.write()?.artifacts.insert(artifact.id, artifact.clone());
        Ok(())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.write()?
            .checkpoints
            .insert(checkpoint.id, checkpoint.clone());
        Ok(())
    }

    async fn append_tool_call(&self, call: &ToolCall) -> Result<()> {
        let mut inner = self.write()?;
        if !inner.tool_call_ids.insert(call.id) {
            bail!("Tool call {} already recorded; audit records are write-once", call.id);
        }
        inner.tool_calls.push(call.clone());
        Ok(())
    }

    async fn load_project(&self, id: ProjectId) -> Result<Option<Project>> {
        Ok(self.read()?.projects.get(&id).cloned())
    }

    async fn load_run(&self, id: RunId) -> Result<Option<PipelineRun>> {
        Ok(self.read()?.runs.get(&id).cloned())
    }

    async fn executions_for_run(&self, run_id: RunId) -> Result<Vec<PhaseExecution>> {
        let mut executions: Vec<PhaseExecution> = self
            .read()?
            .executions
            .values()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.sequence);
        Ok(executions)
    }

    async fn artifacts_for_run(&self, run_id: RunId) -> Result<Vec<Artifact>> {
        let mut artifacts: Vec<Artifact> = self
            .read()?
            .artifacts
            .values()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect();
        artifacts.sort_by_key(|a| a.created_at);
        Ok(artifacts)
    }

    async fn checkpoints_for_run(&self, run_id: RunId) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .read()?
            .checkpoints
            .values()
            .filter(|c| c.run_id == run_id)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|c| c.sequence_watermark);
        Ok(checkpoints)
    }

    async fn tool_calls_for_run(&self, run_id: RunId) -> Result<Vec<ToolCall>> {
        Ok(self
            .read()?
            .tool_calls
            .iter()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn tool_calls_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<ToolCall>> {
        Ok(self
            .read()?
            .tool_calls
            .iter()
            .filter(|t| t.execution_id == execution_id)
            .cloned()
            .collect())
    }
}
