//! JSON-file-backed run store.
//!
//! Lays entities out as one pretty-printed JSON file per record under a root
//! directory. Every write goes to a temporary file first and is renamed into
//! place, so each state transition lands atomically:
//!
//! ```text
//! root/
//!   projects/<project_id>.json
//!   runs/<run_id>/run.json
//!   runs/<run_id>/executions/<execution_id>.json
//!   runs/<run_id>/artifacts/<artifact_id>.json
//!   runs/<run_id>/checkpoints/<checkpoint_id>.json
//!   runs/<run_id>/tool_calls/<tool_call_id>.json
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::{
    Artifact, Checkpoint, ExecutionId, PhaseExecution, PipelineRun, Project, ProjectId, RunId,
    ToolCall,
};
use crate::store::RunStore;

/// Durable store writing one JSON file per record.
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join("runs").join(run_id.to_string())
    }

    async fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let parent = path
            .parent()
            .context("Record path has no parent directory")?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let json = serde_json::to_string_pretty(value).context("Failed to serialize record")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move record into place at {}", path.display()))?;

        Ok(())
    }

    async fn read_record<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let value = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn read_dir_records<T: DeserializeOwned>(&self, dir: &Path) -> Result<Vec<T>> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?
        {
            let path = entry.path();
            if !path.extension().map(|e| e == "json").unwrap_or(false) {
                continue;
            }
            if let Some(record) = self.read_record(&path).await? {
                records.push(record);
            }
        }

        Ok(records)
    }

    async fn run_ids(&self) -> Result<Vec<RunId>> {
        let runs_dir = self.root.join("runs");
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&runs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", runs_dir.display()));
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            if let Some(run) = self
                .read_record::<PipelineRun>(&entry.path().join("run.json"))
                .await?
            {
                ids.push(run.id);
            }
        }

        Ok(ids)
    }
}

#[async_trait]
impl RunStore for JsonStore {
    async fn save_project(&self, project: &Project) -> Result<()> {
        let path = self
            .root
            .join("projects")
            .join(format!("{}.json", project.id));
        self.write_atomic(&path, project).await
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<()> {
        let path = self.run_dir(run.id).join("run.json");
        self.write_atomic(&path, run).await
    }

    async fn save_execution(&self, execution: &PhaseExecution) -> Result<()> {
        let path = self
            .run_dir(execution.run_id)
            .join("executions")
            .join(format!("{}.json", execution.id));
        self.write_atomic(&path, execution).await
    }

    async fn save_artifact(&self, artifact: &Artifact) -> Result<()> {
        let path = self
            .run_dir(artifact.run_id)
            .join("artifacts")
            .join(format!("{}.json", artifact.id));
        self.write_atomic(&path, artifact).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self
            .run_dir(checkpoint.run_id)
            .join("checkpoints")
            .join(format!("{}.json", checkpoint.id));
        self.write_atomic(&path, checkpoint).await
    }

    async fn append_tool_call(&self, call: &ToolCall) -> Result<()> {
        let path = self
            .run_dir(call.run_id)
            .join("tool_calls")
            .join(format!("{}.json", call.id));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            bail!(
                "Tool call {} already recorded; audit records are write-once",
                call.id
            );
        }
        self.write_atomic(&path, call).await
    }

    async fn load_project(&self, id: ProjectId) -> Result<Option<Project>> {
        let path = self.root.join("projects").join(format!("{}.json", id));
        self.read_record(&path).await
    }

    async fn load_run(&self, id: RunId) -> Result<Option<PipelineRun>> {
        self.read_record(&self.run_dir(id).join("run.json")).await
    }

    async fn executions_for_run(&self, run_id: RunId) -> Result<Vec<PhaseExecution>> {
        let mut executions: Vec<PhaseExecution> = self
            .read_dir_records(&self.run_dir(run_id).join("executions"))
            .await?;
        executions.sort_by_key(|e| e.sequence);
        Ok(executions)
    }

    async fn artifacts_for_run(&self, run_id: RunId) -> Result<Vec<Artifact>> {
        let mut artifacts: Vec<Artifact> = self
            .read_dir_records(&self.run_dir(run_id).join("artifacts"))
            .await?;
        artifacts.sort_by_key(|a| a.created_at);
        Ok(artifacts)
    }

    async fn checkpoints_for_run(&self, run_id: RunId) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .read_dir_records(&self.run_dir(run_id).join("checkpoints"))
            .await?;
        checkpoints.sort_by_key(|c| c.sequence_watermark);
        Ok(checkpoints)
    }

    async fn tool_calls_for_run(&self, run_id: RunId) -> Result<Vec<ToolCall>> {
        let mut calls: Vec<ToolCall> = self
            .read_dir_records(&self.run_dir(run_id).join("tool_calls"))
            .await?;
        calls.sort_by_key(|c| c.created_at);
        Ok(calls)
    }

    async fn tool_calls_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<ToolCall>> {
        let mut matching = Vec::new();
        for run_id in self.run_ids().await? {
            let calls = self.tool_calls_for_run(run_id).await?;
            matching.extend(calls.into_iter().filter(|c| c.execution_id == execution_id));
        }
        matching.sort_by_key(|c| c.created_at);
        Ok(matching)
    }
}
