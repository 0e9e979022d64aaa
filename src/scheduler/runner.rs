//! The pipeline scheduler: top-level coordinator for one run.
//!
//! The scheduler owns all run-level state and is its single writer. It runs
//! as one spawned task that repeatedly computes the dependency-ready
//! frontier, dispatches eligible phases to executors (concurrently for
//! parallelizable phases, exclusively otherwise) and reacts to commands
//! arriving over a channel. Serializing every mutation through that one task
//! is what keeps concurrently-completing phases, pause/resume and rollback
//! from racing each other.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointManager, CheckpointPolicy};
use crate::dag::{DagBuilder, PhaseGraph};
use crate::errors::{SchedulerError, TemplateError};
use crate::escalation::{EscalationRecord, EscalationSink};
use crate::executor::{ExecutionRequest, ExecutorConfig, PhaseExecutor, PhaseOutcome};
use crate::model::{
    CheckpointId, ExecutionId, PhaseExecution, PhaseStatus, PipelineRun, Project, RunId, RunState,
    RunStatus,
};
use crate::scheduler::events::RunEvent;
use crate::store::RunStore;
use crate::template::{ModelTier, PhaseDefinition, TemplateSnapshot};
use crate::validation::ValidationGate;

/// Whether a skipped phase satisfies downstream dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// Skipping unblocks dependents; they receive no artifact payload from
    /// the skipped phase.
    #[default]
    Satisfies,
    /// Dependents of a skipped phase stay blocked.
    Blocks,
}

impl SkipPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Satisfies => "satisfies",
            Self::Blocks => "blocks",
        }
    }
}

impl fmt::Display for SkipPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SkipPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "satisfies" => Ok(Self::Satisfies),
            "blocks" => Ok(Self::Blocks),
            _ => Err(format!("Invalid skip policy: {}", s)),
        }
    }
}

/// Configuration for the pipeline scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum parallelizable phases in flight at once.
    pub max_concurrency: usize,
    pub skip_policy: SkipPolicy,
    pub checkpoint_policy: CheckpointPolicy,
    pub executor: ExecutorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            skip_policy: SkipPolicy::default(),
            checkpoint_policy: CheckpointPolicy::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_skip_policy(mut self, policy: SkipPolicy) -> Self {
        self.skip_policy = policy;
        self
    }

    pub fn with_checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint_policy = policy;
        self
    }

    pub fn with_max_repair_cycles(mut self, cycles: u32) -> Self {
        self.executor = self.executor.with_max_repair_cycles(cycles);
        self
    }
}

/// Commands accepted by a running scheduler.
///
/// `Retry`, `Skip` and `ForceAccept` are explicit human decisions on a
/// failed phase; applying one also resumes a run the scheduler had paused
/// as blocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RunCommand {
    /// Approve a staged (`auto_proceed = false`) phase for dispatch.
    Continue { phase: String },
    Pause,
    Resume,
    /// Start a new execution attempt for a failed phase, optionally on a
    /// different model tier.
    Retry {
        phase: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_tier: Option<ModelTier>,
    },
    /// Mark a failed phase as skipped.
    Skip { phase: String },
    /// Materialize a failed phase's rejected output as a flagged artifact.
    ForceAccept { phase: String },
    /// Restore run state from a checkpoint of this run.
    Rollback { checkpoint: CheckpointId },
    /// Terminate the run as failed.
    Abandon,
}

/// Handle to a running scheduler task.
pub struct SchedulerHandle {
    run_id: RunId,
    cmd_tx: mpsc::Sender<RunCommand>,
    events: Option<mpsc::UnboundedReceiver<RunEvent>>,
    join: JoinHandle<PipelineRun>,
}

impl SchedulerHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Send a command to the run loop.
    pub async fn command(&self, command: RunCommand) -> Result<(), SchedulerError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| SchedulerError::RunTerminated {
                run_id: self.run_id,
            })
    }

    /// Take the event stream. Yields every transition event in order; can
    /// be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<RunEvent>> {
        self.events.take()
    }

    /// Wait for the run to reach a terminal state and return the final run.
    pub async fn join(self) -> Result<PipelineRun, SchedulerError> {
        self.join
            .await
            .map_err(|e| SchedulerError::Other(anyhow::anyhow!("run loop panicked: {}", e)))
    }
}

/// Builds run loops: one per started run.
pub struct PipelineScheduler {
    agent: Arc<dyn crate::agent::BuilderAgent>,
    store: Arc<dyn RunStore>,
    escalation: Arc<dyn EscalationSink>,
    config: SchedulerConfig,
}

impl PipelineScheduler {
    pub fn new(
        agent: Arc<dyn crate::agent::BuilderAgent>,
        store: Arc<dyn RunStore>,
        escalation: Arc<dyn EscalationSink>,
    ) -> Self {
        Self {
            agent,
            store,
            escalation,
            config: SchedulerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Instantiate a run from a frozen template snapshot and start its loop.
    ///
    /// Revalidates the snapshot's graph and schema references defensively;
    /// registry-validated templates always pass.
    pub fn start(
        &self,
        project: Project,
        snapshot: TemplateSnapshot,
    ) -> Result<SchedulerHandle, TemplateError> {
        let graph = DagBuilder::new(snapshot.template.phases.clone()).build()?;
        for phase in &snapshot.template.phases {
            if snapshot.schema_for(phase).is_none() {
                return Err(TemplateError::UnknownSchema {
                    phase: phase.id.clone(),
                    schema: phase.output_schema.clone(),
                });
            }
        }

        let run = PipelineRun::new(project.id, snapshot);
        let run_id = run.id;

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::channel(64);

        let executor = Arc::new(PhaseExecutor::new(
            Arc::clone(&self.agent),
            Arc::clone(&self.store),
            Arc::clone(&self.escalation),
            self.config.executor,
        ));

        let run_loop = RunLoop {
            graph,
            state: RunState::new(run),
            project,
            store: Arc::clone(&self.store),
            escalation: Arc::clone(&self.escalation),
            executor,
            checkpoints: CheckpointManager::new(self.config.checkpoint_policy),
            gate: ValidationGate::new(),
            config: self.config,
            event_tx,
            result_tx,
            in_flight: HashMap::new(),
            staged: BTreeSet::new(),
            approved: BTreeSet::new(),
            retry_tier: HashMap::new(),
            exclusive_active: false,
            blocked_escalated: false,
            commands_closed: false,
            abandoned: false,
            completed_count: 0,
        };

        let join = tokio::spawn(run_loop.run(cmd_rx, result_rx));

        Ok(SchedulerHandle {
            run_id,
            cmd_tx,
            events: Some(event_rx),
            join,
        })
    }
}

struct InFlight {
    execution_id: ExecutionId,
    handle: JoinHandle<()>,
}

struct RunLoop {
    graph: PhaseGraph,
    state: RunState,
    project: Project,
    store: Arc<dyn RunStore>,
    escalation: Arc<dyn EscalationSink>,
    executor: Arc<PhaseExecutor>,
    checkpoints: CheckpointManager,
    gate: ValidationGate,
    config: SchedulerConfig,
    event_tx: mpsc::UnboundedSender<RunEvent>,
    result_tx: mpsc::Sender<(String, PhaseOutcome)>,
    in_flight: HashMap<String, InFlight>,
    /// Phases announced as ready-but-awaiting-continue.
    staged: BTreeSet<String>,
    /// Phases a human has approved for dispatch.
    approved: BTreeSet<String>,
    /// Model-tier overrides for pending retries.
    retry_tier: HashMap<String, ModelTier>,
    /// A non-parallelizable phase is in flight; nothing else dispatches.
    exclusive_active: bool,
    /// The current blocked state has already been escalated.
    blocked_escalated: bool,
    commands_closed: bool,
    abandoned: bool,
    completed_count: usize,
}

impl RunLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<RunCommand>,
        mut result_rx: mpsc::Receiver<(String, PhaseOutcome)>,
    ) -> PipelineRun {
        let run_id = self.state.run.id;
        self.state.run.status = RunStatus::Running;
        self.project.status = RunStatus::Running;
        self.persist_run().await;
        self.persist_project().await;
        self.emit(RunEvent::RunStarted { run_id });
        info!(run_id = %run_id, phases = self.graph.len(), "run started");

        loop {
            if self.state.run.status == RunStatus::Running {
                self.dispatch_ready().await;
            }

            if self.try_finish().await {
                break;
            }

            tokio::select! {
                maybe_cmd = cmd_rx.recv(), if !self.commands_closed => {
                    match maybe_cmd {
                        Some(command) => self.handle_command(command).await,
                        None => self.commands_closed = true,
                    }
                }
                Some((phase, outcome)) = result_rx.recv() => {
                    self.handle_outcome(&phase, outcome).await;
                }
            }

            if self.abandoned {
                break;
            }
        }

        self.finalize().await
    }

    // ------------------------------------------------------------------
    // Frontier computation and dispatch
    // ------------------------------------------------------------------

    fn dependency_satisfied(&self, dep: &str) -> bool {
        match self.state.phase_statuses.get(dep) {
            Some(PhaseStatus::Completed) => true,
            Some(PhaseStatus::Skipped) => self.config.skip_policy == SkipPolicy::Satisfies,
            _ => false,
        }
    }

    /// Pending phases whose dependencies are all satisfied, in dispatch
    /// order.
    fn ready_phases(&self) -> Vec<PhaseDefinition> {
        let mut ready: Vec<PhaseDefinition> = self
            .graph
            .phases()
            .iter()
            .filter(|p| {
                self.state.phase_statuses.get(&p.id) == Some(&PhaseStatus::Pending)
                    && !self.in_flight.contains_key(&p.id)
                    && p.depends_on.iter().all(|d| self.dependency_satisfied(d))
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        ready
    }

    async fn dispatch_ready(&mut self) {
        if self.exclusive_active {
            return;
        }

        for phase in self.ready_phases() {
            if !phase.auto_proceed && !self.approved.contains(&phase.id) {
                if self.staged.insert(phase.id.clone()) {
                    self.emit(RunEvent::PhaseStaged {
                        run_id: self.state.run.id,
                        phase: phase.id.clone(),
                    });
                }
                continue;
            }

            if !phase.parallelizable {
                // An exclusive phase needs a quiet scheduler and then holds
                // it; either way, dispatch stops here this round.
                if self.in_flight.is_empty() {
                    self.dispatch(phase).await;
                    self.exclusive_active = true;
                }
                break;
            }

            if self.in_flight.len() >= self.config.max_concurrency {
                break;
            }
            self.dispatch(phase).await;
        }
    }

    async fn dispatch(&mut self, phase: PhaseDefinition) {
        let run_id = self.state.run.id;

        for dep in &phase.depends_on {
            if !self.dependency_satisfied(dep) {
                let err = SchedulerError::DependencyUnsatisfied {
                    run_id,
                    phase: phase.id.clone(),
                    dependency: dep.clone(),
                };
                error!(run_id = %run_id, phase = %phase.id, "{}", err);
                self.reject(err.to_string());
                return;
            }
        }

        let Some(schema) = self.state.run.snapshot.schema_for(&phase).cloned() else {
            // Unreachable for registry-validated snapshots; refuse quietly
            // rather than dispatch an unvalidatable phase.
            let err = TemplateError::UnknownSchema {
                phase: phase.id.clone(),
                schema: phase.output_schema.clone(),
            };
            error!(run_id = %run_id, phase = %phase.id, "{}", err);
            self.reject(err.to_string());
            return;
        };

        let sequence = self.state.next_sequence();
        let attempt = self.state.attempts_for(&phase.id) + 1;
        let tier = self
            .retry_tier
            .remove(&phase.id)
            .unwrap_or(phase.model_tier);
        let execution = PhaseExecution::new(run_id, &phase.id, sequence, attempt, tier);
        let execution_id = execution.id;

        self.state.executions.push(execution.clone());
        self.state
            .phase_statuses
            .insert(phase.id.clone(), PhaseStatus::Running);
        self.state.run.current_phase = Some(phase.id.clone());
        self.project.current_phase = Some(phase.id.clone());
        self.staged.remove(&phase.id);
        self.approved.remove(&phase.id);
        self.persist_run().await;
        self.persist_project().await;

        let inputs: BTreeMap<String, Value> = phase
            .depends_on
            .iter()
            .filter_map(|dep| {
                self.state
                    .active_artifact(dep)
                    .map(|a| (dep.clone(), a.payload.clone()))
            })
            .collect();

        let request = ExecutionRequest {
            execution,
            phase: phase.clone(),
            schema,
            inputs,
        };
        let executor = Arc::clone(&self.executor);
        let result_tx = self.result_tx.clone();
        let phase_id = phase.id.clone();
        let handle = tokio::spawn(async move {
            let outcome = executor.execute(request).await;
            result_tx.send((phase_id, outcome)).await.ok();
        });

        self.in_flight.insert(
            phase.id.clone(),
            InFlight {
                execution_id,
                handle,
            },
        );

        info!(run_id = %run_id, phase = %phase.id, attempt, "phase dispatched");
        self.emit(RunEvent::PhaseStarted {
            run_id,
            phase: phase.id,
            execution_id,
            attempt,
        });
    }

    // ------------------------------------------------------------------
    // Outcome and command handling
    // ------------------------------------------------------------------

    async fn handle_outcome(&mut self, phase_id: &str, outcome: PhaseOutcome) {
        let run_id = self.state.run.id;

        let Some(in_flight) = self.in_flight.remove(phase_id) else {
            // Result from an execution already cancelled by rollback or
            // abandon; the active state has moved on without it.
            return;
        };
        if in_flight.execution_id != outcome.execution().id {
            warn!(run_id = %run_id, phase = phase_id, "stale outcome discarded");
            return;
        }
        if self
            .state
            .execution(in_flight.execution_id)
            .map(|e| e.status)
            == Some(crate::model::ExecutionStatus::RolledBack)
        {
            return;
        }

        let was_exclusive = self
            .graph
            .get_phase_by_id(phase_id)
            .is_some_and(|p| !p.parallelizable);
        if was_exclusive {
            self.exclusive_active = false;
        }

        match outcome {
            PhaseOutcome::Completed {
                execution,
                artifact,
            } => {
                let execution_id = execution.id;
                let force_accepted = artifact.force_accepted;
                self.apply_execution(execution);
                self.state
                    .phase_statuses
                    .insert(phase_id.to_string(), PhaseStatus::Completed);
                self.state
                    .active_artifacts
                    .insert(phase_id.to_string(), artifact.id);
                self.state.artifacts.insert(artifact.id, artifact);
                self.completed_count += 1;

                info!(run_id = %run_id, phase = phase_id, "phase completed");
                self.emit(RunEvent::PhaseCompleted {
                    run_id,
                    phase: phase_id.to_string(),
                    execution_id,
                    force_accepted,
                });

                self.maybe_checkpoint(phase_id, execution_id).await;
                self.persist_run().await;
            }
            PhaseOutcome::Failed { execution, error } => {
                let execution_id = execution.id;
                self.apply_execution(execution);
                self.state
                    .phase_statuses
                    .insert(phase_id.to_string(), PhaseStatus::Failed);

                warn!(run_id = %run_id, phase = phase_id, "phase failed: {}", error);
                self.emit(RunEvent::PhaseFailed {
                    run_id,
                    phase: phase_id.to_string(),
                    execution_id,
                    error: error.to_string(),
                });
                self.persist_run().await;
            }
        }
    }

    async fn handle_command(&mut self, command: RunCommand) {
        let run_id = self.state.run.id;
        match command {
            RunCommand::Pause => {
                if self.state.run.status == RunStatus::Running {
                    self.state.run.status = RunStatus::Paused;
                    self.project.status = RunStatus::Paused;
                    self.persist_run().await;
                    self.persist_project().await;
                    info!(run_id = %run_id, "run paused");
                    self.emit(RunEvent::RunPaused {
                        run_id,
                        blocked: false,
                    });
                }
            }
            RunCommand::Resume => {
                if self.state.run.status == RunStatus::Paused {
                    self.resume().await;
                }
            }
            RunCommand::Continue { phase } => {
                if self.state.phase_statuses.get(&phase) == Some(&PhaseStatus::Pending) {
                    self.staged.remove(&phase);
                    self.approved.insert(phase);
                } else {
                    self.reject(format!("phase {} is not awaiting continuation", phase));
                }
            }
            RunCommand::Retry { phase, model_tier } => {
                if self.state.phase_statuses.get(&phase) == Some(&PhaseStatus::Failed) {
                    if let Some(tier) = model_tier {
                        self.retry_tier.insert(phase.clone(), tier);
                    }
                    self.state
                        .phase_statuses
                        .insert(phase.clone(), PhaseStatus::Pending);
                    // An explicit retry supersedes any manual-continue gate.
                    self.approved.insert(phase.clone());
                    self.blocked_escalated = false;
                    info!(run_id = %run_id, phase = %phase, "phase retry requested");
                    self.resume_if_paused().await;
                } else {
                    self.reject(format!("phase {} is not failed; nothing to retry", phase));
                }
            }
            RunCommand::Skip { phase } => {
                if self.state.phase_statuses.get(&phase) == Some(&PhaseStatus::Failed) {
                    self.state
                        .phase_statuses
                        .insert(phase.clone(), PhaseStatus::Skipped);
                    self.blocked_escalated = false;
                    info!(run_id = %run_id, phase = %phase, "phase skipped");
                    self.emit(RunEvent::PhaseSkipped {
                        run_id,
                        phase: phase.clone(),
                    });
                    self.persist_run().await;
                    self.resume_if_paused().await;
                } else {
                    self.reject(format!("phase {} is not failed; nothing to skip", phase));
                }
            }
            RunCommand::ForceAccept { phase } => self.force_accept(&phase).await,
            RunCommand::Rollback { checkpoint } => self.rollback_to(checkpoint).await,
            RunCommand::Abandon => {
                info!(run_id = %run_id, "run abandoned");
                self.abandoned = true;
                self.cancel_in_flight().await;
            }
        }
    }

    /// Promote a failed phase's rejected output to a flagged artifact.
    async fn force_accept(&mut self, phase: &str) {
        let run_id = self.state.run.id;

        if self.state.phase_statuses.get(phase) != Some(&PhaseStatus::Failed) {
            self.reject(format!("phase {} is not failed; nothing to force-accept", phase));
            return;
        }
        let Some(definition) = self.graph.get_phase_by_id(phase).cloned() else {
            self.reject(
                SchedulerError::UnknownPhase {
                    run_id,
                    phase: phase.to_string(),
                }
                .to_string(),
            );
            return;
        };
        let Some((execution_id, raw)) = self
            .state
            .latest_execution(phase)
            .and_then(|e| e.raw_output.clone().map(|raw| (e.id, raw)))
        else {
            self.reject(format!(
                "phase {} has no rejected output available to force-accept",
                phase
            ));
            return;
        };

        let artifact =
            self.gate
                .force_accept(run_id, execution_id, phase, &definition.output_schema, raw);
        if let Err(e) = self.store.save_artifact(&artifact).await {
            self.reject(format!("failed to persist force-accepted artifact: {:#}", e));
            return;
        }

        let promoted = self.state.execution_mut(execution_id).map(|execution| {
            execution.status = crate::model::ExecutionStatus::Completed;
            execution.finished_at = Some(Utc::now());
            execution.clone()
        });
        if let Some(updated) = promoted {
            self.persist_execution(&updated).await;
        }

        self.state
            .phase_statuses
            .insert(phase.to_string(), PhaseStatus::Completed);
        self.state
            .active_artifacts
            .insert(phase.to_string(), artifact.id);
        self.state.artifacts.insert(artifact.id, artifact);
        self.completed_count += 1;
        self.blocked_escalated = false;

        info!(run_id = %run_id, phase, "rejected output force-accepted");
        self.emit(RunEvent::PhaseCompleted {
            run_id,
            phase: phase.to_string(),
            execution_id,
            force_accepted: true,
        });

        self.maybe_checkpoint(phase, execution_id).await;
        self.persist_run().await;
        self.resume_if_paused().await;
    }

    /// Restore run state from a checkpoint. In-flight sessions invalidated
    /// by the restore are cancelled first; the single-task loop guarantees
    /// no dispatch happens mid-rollback.
    async fn rollback_to(&mut self, checkpoint_id: CheckpointId) {
        let run_id = self.state.run.id;

        let Some(checkpoint) = self.state.checkpoint(checkpoint_id).cloned() else {
            self.reject(
                SchedulerError::UnknownCheckpoint {
                    run_id,
                    checkpoint: checkpoint_id,
                }
                .to_string(),
            );
            return;
        };

        let drained: Vec<(String, InFlight)> = self.in_flight.drain().collect();
        for (_, in_flight) in &drained {
            in_flight.handle.abort();
            if let Some(execution) = self.state.execution_mut(in_flight.execution_id) {
                execution.roll_back();
            }
        }
        self.exclusive_active = false;

        match self.checkpoints.rollback(&mut self.state, &checkpoint) {
            Ok(_restored) => {
                let rolled_back: Vec<PhaseExecution> = self
                    .state
                    .executions
                    .iter()
                    .filter(|e| e.status == crate::model::ExecutionStatus::RolledBack)
                    .cloned()
                    .collect();
                for execution in &rolled_back {
                    self.persist_execution(execution).await;
                }

                self.staged.clear();
                self.approved.clear();
                self.retry_tier.clear();
                self.blocked_escalated = false;
                self.project.current_phase = self.state.run.current_phase.clone();
                self.persist_run().await;
                self.persist_project().await;

                info!(run_id = %run_id, checkpoint = %checkpoint_id, "run rolled back");
                self.emit(RunEvent::RolledBack {
                    run_id,
                    checkpoint_id,
                });
                // A rollback is a human recovery decision; a run the
                // scheduler had paused as blocked picks back up from the
                // restored frontier.
                self.resume_if_paused().await;
            }
            Err(e) => self.reject(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Progress accounting
    // ------------------------------------------------------------------

    /// Check for a terminal state. Returns true when the loop should stop.
    async fn try_finish(&mut self) -> bool {
        if !self.in_flight.is_empty() {
            return false;
        }

        let all_done = self
            .state
            .phase_statuses
            .values()
            .all(|s| matches!(s, PhaseStatus::Completed | PhaseStatus::Skipped));
        if all_done {
            self.state.run.status = RunStatus::Completed;
            return true;
        }

        if self.state.run.status == RunStatus::Running {
            // Remaining ready work at this point is ready-but-unapproved;
            // auto-proceed phases were dispatched before this check.
            let awaiting_approval = !self.ready_phases().is_empty() || !self.staged.is_empty();
            if awaiting_approval && !self.commands_closed {
                return false;
            }
            if !awaiting_approval {
                // No in-flight work, no dispatchable work, not complete:
                // the run is blocked on a human decision.
                self.report_blocked().await;
            }
        }

        // Paused or awaiting approval: a closed command channel means
        // nobody can ever unblock the run.
        if self.commands_closed {
            self.state.run.status = RunStatus::Failed;
            return true;
        }
        false
    }

    async fn report_blocked(&mut self) {
        let run_id = self.state.run.id;

        self.state.run.status = RunStatus::Paused;
        self.project.status = RunStatus::Paused;
        self.persist_run().await;
        self.persist_project().await;

        if self.blocked_escalated {
            return;
        }
        self.blocked_escalated = true;

        let failed: Vec<String> = self
            .state
            .phase_statuses
            .iter()
            .filter(|(_, s)| **s == PhaseStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        let reason = if failed.is_empty() {
            "no dispatchable phases remain; remaining work has unsatisfiable dependencies"
                .to_string()
        } else {
            format!("failed phases block the remaining work: {:?}", failed)
        };
        let attempts: Vec<String> = failed
            .iter()
            .filter_map(|phase| {
                self.state
                    .latest_execution(phase)
                    .and_then(|e| e.error.clone())
                    .map(|err| format!("{}: {}", phase, err))
            })
            .collect();

        warn!(run_id = %run_id, "run blocked: {}", reason);
        self.escalation
            .escalate(
                EscalationRecord::new(
                    &run_id.to_string(),
                    &reason,
                    "retry, skip, force-accept or roll back a failed phase, or abandon the run",
                )
                .with_run(run_id)
                .with_attempts(attempts),
            )
            .await;
        self.emit(RunEvent::Escalated {
            run_id,
            entity_id: run_id.to_string(),
            reason,
        });
        self.emit(RunEvent::RunPaused {
            run_id,
            blocked: true,
        });
    }

    async fn resume(&mut self) {
        self.state.run.status = RunStatus::Running;
        self.project.status = RunStatus::Running;
        self.blocked_escalated = false;
        self.persist_run().await;
        self.persist_project().await;
        info!(run_id = %self.state.run.id, "run resumed");
        self.emit(RunEvent::RunResumed {
            run_id: self.state.run.id,
        });
    }

    async fn resume_if_paused(&mut self) {
        if self.state.run.status == RunStatus::Paused {
            self.resume().await;
        }
    }

    async fn maybe_checkpoint(&mut self, phase_id: &str, execution_id: ExecutionId) {
        if !self.checkpoints.should_checkpoint(self.completed_count) {
            return;
        }

        let checkpoint = self.checkpoints.create(&self.state, phase_id);
        let updated = self.state.execution_mut(execution_id).map(|execution| {
            execution.checkpoint = Some(checkpoint.id);
            execution.clone()
        });
        if let Some(updated) = updated {
            self.persist_execution(&updated).await;
        }
        if let Err(e) = self.store.save_checkpoint(&checkpoint).await {
            warn!(
                run_id = %self.state.run.id,
                "failed to persist checkpoint: {:#}", e
            );
        }
        self.emit(RunEvent::CheckpointCreated {
            run_id: self.state.run.id,
            checkpoint_id: checkpoint.id,
            after_phase: phase_id.to_string(),
        });
        self.state.checkpoints.push(checkpoint);
    }

    async fn cancel_in_flight(&mut self) {
        let drained: Vec<(String, InFlight)> = self.in_flight.drain().collect();
        for (phase_id, in_flight) in drained {
            in_flight.handle.abort();
            let updated = self.state.execution_mut(in_flight.execution_id).map(|execution| {
                let usage = execution.usage;
                execution.fail("run abandoned", usage);
                execution.clone()
            });
            if let Some(updated) = updated {
                self.persist_execution(&updated).await;
            }
            self.state
                .phase_statuses
                .insert(phase_id, PhaseStatus::Failed);
        }
        self.exclusive_active = false;
    }

    async fn finalize(mut self) -> PipelineRun {
        if self.abandoned {
            self.state.run.status = RunStatus::Failed;
        }
        self.state.run.finished_at = Some(Utc::now());
        self.project.status = self.state.run.status;
        self.persist_run().await;
        self.persist_project().await;

        let run_id = self.state.run.id;
        match self.state.run.status {
            RunStatus::Completed => {
                info!(run_id = %run_id, "run completed");
                self.emit(RunEvent::RunCompleted { run_id });
            }
            RunStatus::Failed => {
                warn!(run_id = %run_id, "run failed");
                self.emit(RunEvent::RunFailed { run_id });
            }
            _ => {}
        }

        self.state.run.clone()
    }

    // ------------------------------------------------------------------
    // Small helpers
    // ------------------------------------------------------------------

    fn apply_execution(&mut self, updated: PhaseExecution) {
        if let Some(slot) = self.state.execution_mut(updated.id) {
            *slot = updated;
        } else {
            self.state.executions.push(updated);
        }
    }

    fn emit(&self, event: RunEvent) {
        self.event_tx.send(event).ok();
    }

    fn reject(&self, message: String) {
        warn!(run_id = %self.state.run.id, "command rejected: {}", message);
        self.emit(RunEvent::CommandRejected {
            run_id: self.state.run.id,
            message,
        });
    }

    async fn persist_run(&self) {
        if let Err(e) = self.store.save_run(&self.state.run).await {
            warn!(run_id = %self.state.run.id, "failed to persist run: {:#}", e);
        }
    }

    async fn persist_project(&self) {
        if let Err(e) = self.store.save_project(&self.project).await {
            warn!(project = %self.project.id, "failed to persist project: {:#}", e);
        }
    }

    async fn persist_execution(&self, execution: &PhaseExecution) {
        if let Err(e) = self.store.save_execution(execution).await {
            warn!(
                run_id = %execution.run_id,
                execution = %execution.id,
                "failed to persist execution: {:#}", e
            );
        }
    }
}
