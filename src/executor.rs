//! Phase executor: drives one `PhaseExecution` through its lifecycle.
//!
//! The executor starts a builder session, streams its tool calls into the
//! audit trail, enforces the phase's wall-clock timeout and routes terminal
//! output through the validation gate. Rejected output enters the bounded
//! repair loop; exhaustion escalates with the full attempt history. Every
//! state transition is persisted through the injected store before the
//! outcome is reported to the scheduler.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::agent::{AgentEvent, BuilderAgent, PhaseContext, RepairDirective};
use crate::cycle::{CycleController, CycleOutcome, CycleVerdict};
use crate::errors::PhaseError;
use crate::escalation::{EscalationRecord, EscalationSink};
use crate::model::{Artifact, PhaseExecution, ResourceUsage, ToolCall};
use crate::store::RunStore;
use crate::template::{OutputSchema, PhaseDefinition};
use crate::validation::{ValidationFailure, ValidationGate};

/// Configuration for phase execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Maximum validation-repair cycles before escalation.
    pub max_repair_cycles: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_repair_cycles: 2,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_repair_cycles(mut self, cycles: u32) -> Self {
        self.max_repair_cycles = cycles;
        self
    }
}

/// One dispatch handed to the executor by the scheduler.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub execution: PhaseExecution,
    pub phase: PhaseDefinition,
    pub schema: OutputSchema,
    /// Artifact payloads of direct dependencies, keyed by phase id.
    pub inputs: BTreeMap<String, Value>,
}

/// Terminal result of one dispatch.
#[derive(Debug)]
pub enum PhaseOutcome {
    Completed {
        execution: PhaseExecution,
        artifact: Artifact,
    },
    Failed {
        execution: PhaseExecution,
        error: PhaseError,
    },
}

impl PhaseOutcome {
    pub fn execution(&self) -> &PhaseExecution {
        match self {
            Self::Completed { execution, .. } | Self::Failed { execution, .. } => execution,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Result of one builder session within the repair loop.
enum SessionResult {
    Output(Value),
    TimedOut,
    AgentFailed(String),
}

/// Cross-attempt scratch shared with the repair-loop closure.
#[derive(Default)]
struct AttemptSlots {
    artifact: Mutex<Option<Artifact>>,
    last_failure: Mutex<Option<ValidationFailure>>,
    hard_error: Mutex<Option<PhaseError>>,
    partial_payload: Mutex<Option<Value>>,
    tool_calls: Mutex<u32>,
}

/// Drives one phase execution from dispatch to terminal state.
pub struct PhaseExecutor {
    agent: Arc<dyn BuilderAgent>,
    store: Arc<dyn RunStore>,
    escalation: Arc<dyn EscalationSink>,
    gate: ValidationGate,
    config: ExecutorConfig,
}

impl PhaseExecutor {
    pub fn new(
        agent: Arc<dyn BuilderAgent>,
        store: Arc<dyn RunStore>,
        escalation: Arc<dyn EscalationSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            agent,
            store,
            escalation,
            gate: ValidationGate::new(),
            config,
        }
    }

    /// Execute one dispatch to its terminal state.
    pub async fn execute(&self, request: ExecutionRequest) -> PhaseOutcome {
        let ExecutionRequest {
            mut execution,
            phase,
            schema,
            inputs,
        } = request;
        let run_id = execution.run_id;

        execution.begin();
        if let Err(e) = self.store.save_execution(&execution).await {
            let message = format!("storage error at dispatch: {:#}", e);
            execution.fail(&message, ResourceUsage::default());
            return PhaseOutcome::Failed {
                execution,
                error: PhaseError::Agent {
                    phase: phase.id.clone(),
                    message,
                },
            };
        }

        debug!(
            run_id = %run_id,
            phase = %phase.id,
            attempt = execution.attempt,
            timeout_seconds = phase.timeout_seconds,
            "builder session starting"
        );

        let started = Instant::now();
        let slots = AttemptSlots::default();
        let controller = CycleController::new(self.config.max_repair_cycles);

        let outcome = controller
            .run(|_cycle| self.attempt(&execution, &phase, &schema, &inputs, &slots))
            .await;

        let usage = ResourceUsage {
            tool_calls: *slots.tool_calls.lock().unwrap_or_else(|e| e.into_inner()),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match outcome {
            CycleOutcome::Passed { cycles_used } => {
                let artifact = slots
                    .artifact
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                match artifact {
                    Some(artifact) => {
                        execution.complete(usage);
                        self.persist_execution(&execution).await;
                        debug!(
                            run_id = %run_id,
                            phase = %phase.id,
                            cycles_used,
                            "phase completed"
                        );
                        PhaseOutcome::Completed {
                            execution,
                            artifact,
                        }
                    }
                    None => {
                        // A pass without an artifact would be a gate bypass;
                        // fail loudly instead of fabricating completion.
                        let error = PhaseError::Agent {
                            phase: phase.id.clone(),
                            message: "pass verdict without validated artifact".into(),
                        };
                        execution.fail(&error.to_string(), usage);
                        self.persist_execution(&execution).await;
                        PhaseOutcome::Failed { execution, error }
                    }
                }
            }
            CycleOutcome::Blocked { reason, .. } => {
                let error = slots
                    .hard_error
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                    .unwrap_or(PhaseError::Agent {
                        phase: phase.id.clone(),
                        message: reason,
                    });
                execution.fail(&error.to_string(), usage);
                self.persist_execution(&execution).await;
                PhaseOutcome::Failed { execution, error }
            }
            CycleOutcome::Exhausted { history } => {
                if let Some(failure) = slots
                    .last_failure
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                {
                    execution.raw_output = Some(failure.raw_output);
                }

                let error = PhaseError::RepairExhausted {
                    run_id,
                    phase: phase.id.clone(),
                    cycles: self.config.max_repair_cycles,
                };
                execution.fail(&error.to_string(), usage);
                self.persist_execution(&execution).await;

                let attempts = history
                    .iter()
                    .map(|attempt| match &attempt.verdict {
                        CycleVerdict::Concern { detail } => {
                            format!("cycle {}: {}", attempt.cycle, detail)
                        }
                        CycleVerdict::Block { reason } => {
                            format!("cycle {}: blocked: {}", attempt.cycle, reason)
                        }
                        CycleVerdict::Pass => format!("cycle {}: pass", attempt.cycle),
                    })
                    .collect();

                self.escalation
                    .escalate(
                        EscalationRecord::new(
                            &format!("{}/{}", run_id, phase.id),
                            &error.to_string(),
                            "retry with a different model, force-accept the output, \
                             skip the phase, or roll back to a checkpoint",
                        )
                        .with_run(run_id)
                        .with_attempts(attempts),
                    )
                    .await;

                PhaseOutcome::Failed { execution, error }
            }
        }
    }

    /// One repair-loop attempt: run a builder session, then validate.
    async fn attempt(
        &self,
        execution: &PhaseExecution,
        phase: &PhaseDefinition,
        schema: &OutputSchema,
        inputs: &BTreeMap<String, Value>,
        slots: &AttemptSlots,
    ) -> CycleVerdict {
        let repair = slots
            .last_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|failure| RepairDirective {
                violations: failure.violations,
                previous_output: failure.raw_output,
            });

        let ctx = PhaseContext {
            run_id: execution.run_id,
            execution_id: execution.id,
            phase: phase.clone(),
            attempt: execution.attempt,
            model_tier: execution.model_tier,
            inputs: inputs.clone(),
            repair,
        };

        match self.run_session(ctx, phase, execution, slots).await {
            SessionResult::Output(payload) => {
                match self
                    .gate
                    .validate(execution.run_id, execution.id, &phase.id, payload, schema)
                {
                    Ok(artifact) => {
                        if let Err(e) = self.store.save_artifact(&artifact).await {
                            let error = PhaseError::Agent {
                                phase: phase.id.clone(),
                                message: format!("failed to persist artifact: {:#}", e),
                            };
                            let reason = error.to_string();
                            *slots.hard_error.lock().unwrap_or_else(|e| e.into_inner()) =
                                Some(error);
                            return CycleVerdict::Block { reason };
                        }
                        *slots.artifact.lock().unwrap_or_else(|e| e.into_inner()) = Some(artifact);
                        CycleVerdict::Pass
                    }
                    Err(failure) => {
                        let detail = failure.summary();
                        debug!(
                            run_id = %execution.run_id,
                            phase = %phase.id,
                            violations = failure.violations.len(),
                            "output rejected by validation gate"
                        );
                        *slots.last_failure.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(failure);
                        CycleVerdict::Concern { detail }
                    }
                }
            }
            SessionResult::TimedOut => {
                let error = PhaseError::Timeout {
                    run_id: execution.run_id,
                    phase: phase.id.clone(),
                    timeout_seconds: phase.timeout_seconds,
                };
                let reason = error.to_string();
                *slots.hard_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
                CycleVerdict::Block { reason }
            }
            SessionResult::AgentFailed(message) => {
                let error = PhaseError::Agent {
                    phase: phase.id.clone(),
                    message,
                };
                let reason = error.to_string();
                *slots.hard_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
                CycleVerdict::Block { reason }
            }
        }
    }

    /// Run one cancelable builder session under the phase's timeout budget,
    /// streaming events into the audit trail as they arrive.
    async fn run_session(
        &self,
        ctx: PhaseContext,
        phase: &PhaseDefinition,
        execution: &PhaseExecution,
        slots: &AttemptSlots,
    ) -> SessionResult {
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
        let agent = Arc::clone(&self.agent);
        let mut session = tokio::spawn(async move { agent.execute(ctx, tx).await });
        let deadline = Instant::now() + Duration::from_secs(phase.timeout_seconds);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.record_event(execution, event, slots).await {
                            session.abort();
                            return SessionResult::AgentFailed(format!(
                                "audit write failed: {:#}",
                                e
                            ));
                        }
                    }
                    // Sender dropped: the session is about to yield its
                    // terminal result.
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    session.abort();
                    // Salvage events that were already queued before the
                    // cancellation; nothing new arrives after the abort.
                    while let Ok(event) = rx.try_recv() {
                        if let Err(e) = self.record_event(execution, event, slots).await {
                            warn!(
                                run_id = %execution.run_id,
                                phase = %phase.id,
                                "failed to salvage event after timeout: {:#}", e
                            );
                        }
                    }
                    self.salvage_partial(execution, phase, slots).await;
                    return SessionResult::TimedOut;
                }
            }
        }

        match tokio::time::timeout_at(deadline, &mut session).await {
            Ok(Ok(Ok(output))) => SessionResult::Output(output.payload),
            Ok(Ok(Err(e))) => SessionResult::AgentFailed(e.to_string()),
            Ok(Err(_)) => SessionResult::AgentFailed("builder task aborted or panicked".into()),
            Err(_) => {
                session.abort();
                self.salvage_partial(execution, phase, slots).await;
                SessionResult::TimedOut
            }
        }
    }

    async fn record_event(
        &self,
        execution: &PhaseExecution,
        event: AgentEvent,
        slots: &AttemptSlots,
    ) -> anyhow::Result<()> {
        match event {
            AgentEvent::ToolCall {
                name,
                input,
                output,
                duration_ms,
            } => {
                let call = ToolCall::new(
                    execution.run_id,
                    execution.id,
                    &name,
                    input,
                    output,
                    duration_ms,
                );
                self.store.append_tool_call(&call).await?;
                *slots.tool_calls.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            }
            AgentEvent::PartialOutput { payload } => {
                *slots
                    .partial_payload
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(payload);
            }
        }
        Ok(())
    }

    /// Store the latest partial output from a timed-out session, flagged as
    /// partial so it never satisfies downstream dependencies.
    async fn salvage_partial(
        &self,
        execution: &PhaseExecution,
        phase: &PhaseDefinition,
        slots: &AttemptSlots,
    ) {
        let payload = slots
            .partial_payload
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(payload) = payload {
            let artifact = Artifact::partial(
                execution.run_id,
                execution.id,
                &phase.id,
                &phase.output_schema,
                payload,
            );
            if let Err(e) = self.store.save_artifact(&artifact).await {
                warn!(
                    run_id = %execution.run_id,
                    phase = %phase.id,
                    "failed to store partial artifact: {:#}", e
                );
            }
        }
    }

    async fn persist_execution(&self, execution: &PhaseExecution) {
        if let Err(e) = self.store.save_execution(execution).await {
            warn!(
                run_id = %execution.run_id,
                execution = %execution.id,
                "failed to persist execution transition: {:#}", e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentError, AgentOutput, BuilderAgent};
    use crate::escalation::{ChannelSink, NullSink};
    use crate::model::{ExecutionStatus, RunId};
    use crate::store::{MemoryStore, RunStore};
    use crate::template::ModelTier;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;

    enum Step {
        Output(Value),
        EventsThenOutput(Vec<AgentEvent>, Value),
        EventsThenHang(Vec<AgentEvent>),
        Fail(String),
    }

    struct ScriptedAgent {
        steps: Mutex<VecDeque<Step>>,
        saw_repair: Mutex<Vec<bool>>,
    }

    impl ScriptedAgent {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                saw_repair: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BuilderAgent for ScriptedAgent {
        async fn execute(
            &self,
            ctx: PhaseContext,
            events: mpsc::Sender<AgentEvent>,
        ) -> Result<AgentOutput, AgentError> {
            self.saw_repair.lock().unwrap().push(ctx.repair.is_some());
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Output(payload)) => Ok(AgentOutput::new(payload)),
                Some(Step::EventsThenOutput(to_send, payload)) => {
                    for event in to_send {
                        events.send(event).await.ok();
                    }
                    Ok(AgentOutput::new(payload))
                }
                Some(Step::EventsThenHang(to_send)) => {
                    for event in to_send {
                        events.send(event).await.ok();
                    }
                    std::future::pending().await
                }
                Some(Step::Fail(message)) => Err(AgentError::Session(message)),
                None => Err(AgentError::NoOutput),
            }
        }
    }

    fn schema() -> OutputSchema {
        OutputSchema::new(
            "report",
            json!({
                "type": "object",
                "properties": { "summary": { "type": "string" } },
                "required": ["summary"]
            }),
        )
    }

    fn request(run_id: RunId, timeout_seconds: u64) -> ExecutionRequest {
        let phase = PhaseDefinition::new("05", "Build", "report").timeout_seconds(timeout_seconds);
        ExecutionRequest {
            execution: PhaseExecution::new(run_id, "05", 1, 1, ModelTier::Standard),
            phase,
            schema: schema(),
            inputs: BTreeMap::new(),
        }
    }

    fn executor(agent: Arc<dyn BuilderAgent>, store: Arc<MemoryStore>) -> PhaseExecutor {
        PhaseExecutor::new(
            agent,
            store,
            Arc::new(NullSink),
            ExecutorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_valid_output_completes_execution() {
        let store = Arc::new(MemoryStore::new());
        let agent = Arc::new(ScriptedAgent::new(vec![Step::EventsThenOutput(
            vec![AgentEvent::ToolCall {
                name: "read_file".into(),
                input: json!({}),
                output: None,
                duration_ms: 3,
            }],
            json!({ "summary": "done" }),
        )]));

        let run_id = RunId::new();
        let outcome = executor(agent, Arc::clone(&store))
            .execute(request(run_id, 60))
            .await;

        match outcome {
            PhaseOutcome::Completed {
                execution,
                artifact,
            } => {
                assert_eq!(execution.status, ExecutionStatus::Completed);
                assert_eq!(execution.usage.tool_calls, 1);
                assert!(!artifact.force_accepted);
                assert_eq!(artifact.payload["summary"], "done");
            }
            other => panic!("Expected Completed, got {:?}", other),
        }

        assert_eq!(store.tool_calls_for_run(run_id).await.unwrap().len(), 1);
        assert_eq!(store.artifacts_for_run(run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_output_repairs_and_passes() {
        let store = Arc::new(MemoryStore::new());
        let agent = Arc::new(ScriptedAgent::new(vec![
            Step::Output(json!({ "wrong": true })),
            Step::Output(json!({ "summary": "repaired" })),
        ]));

        let outcome = executor(Arc::clone(&agent) as Arc<dyn BuilderAgent>, store)
            .execute(request(RunId::new(), 60))
            .await;

        assert!(outcome.is_success());
        // First invocation fresh, second carried the repair directive.
        assert_eq!(*agent.saw_repair.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_repair_exhaustion_escalates_with_history() {
        let store = Arc::new(MemoryStore::new());
        let agent = Arc::new(ScriptedAgent::new(vec![
            Step::Output(json!({ "wrong": 1 })),
            Step::Output(json!({ "wrong": 2 })),
            Step::Output(json!({ "summary": "never reached" })),
        ]));
        let (tx, mut rx) = mpsc::channel(4);

        let executor = PhaseExecutor::new(
            Arc::clone(&agent) as Arc<dyn BuilderAgent>,
            store,
            Arc::new(ChannelSink::new(tx)),
            ExecutorConfig::default().with_max_repair_cycles(2),
        );

        let run_id = RunId::new();
        let outcome = executor.execute(request(run_id, 60)).await;

        match outcome {
            PhaseOutcome::Failed { execution, error } => {
                assert!(matches!(error, PhaseError::RepairExhausted { cycles: 2, .. }));
                assert_eq!(execution.status, ExecutionStatus::Failed);
                // Raw output retained for a later force-accept.
                assert_eq!(execution.raw_output, Some(json!({ "wrong": 2 })));
            }
            other => panic!("Expected Failed, got {:?}", other),
        }

        // Exactly two attempts, never a third.
        assert_eq!(agent.saw_repair.lock().unwrap().len(), 2);

        let record = rx.recv().await.unwrap();
        assert_eq!(record.run_id, Some(run_id));
        assert_eq!(record.attempted_approaches.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_session_and_salvages() {
        let store = Arc::new(MemoryStore::new());
        let agent = Arc::new(ScriptedAgent::new(vec![Step::EventsThenHang(vec![
            AgentEvent::ToolCall {
                name: "bash".into(),
                input: json!({ "cmd": "sleep" }),
                output: None,
                duration_ms: 10,
            },
            AgentEvent::ToolCall {
                name: "grep".into(),
                input: json!({}),
                output: None,
                duration_ms: 2,
            },
            AgentEvent::PartialOutput {
                payload: json!({ "summary": "half" }),
            },
        ])]));

        let run_id = RunId::new();
        let outcome = executor(agent, Arc::clone(&store))
            .execute(request(run_id, 30))
            .await;

        match outcome {
            PhaseOutcome::Failed { error, .. } => {
                assert!(matches!(
                    error,
                    PhaseError::Timeout {
                        timeout_seconds: 30,
                        ..
                    }
                ));
            }
            other => panic!("Expected timeout failure, got {:?}", other),
        }

        // Partial tool-call records survive the cancellation.
        assert_eq!(store.tool_calls_for_run(run_id).await.unwrap().len(), 2);
        // The last partial output is stored, flagged as partial.
        let artifacts = store.artifacts_for_run(run_id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].partial);
        assert_eq!(artifacts[0].payload["summary"], "half");
    }

    #[tokio::test]
    async fn test_agent_failure_is_terminal_without_retry() {
        let store = Arc::new(MemoryStore::new());
        let agent = Arc::new(ScriptedAgent::new(vec![Step::Fail("model refused".into())]));

        let outcome = executor(Arc::clone(&agent) as Arc<dyn BuilderAgent>, store)
            .execute(request(RunId::new(), 60))
            .await;

        match outcome {
            PhaseOutcome::Failed { error, .. } => match error {
                PhaseError::Agent { message, .. } => assert!(message.contains("model refused")),
                other => panic!("Expected Agent error, got {:?}", other),
            },
            other => panic!("Expected Failed, got {:?}", other),
        }

        // A hard failure never consumes further repair attempts.
        assert_eq!(agent.saw_repair.lock().unwrap().len(), 1);
    }
}
