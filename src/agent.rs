//! Builder agent seam.
//!
//! The engine treats the builder (an LLM session with tool access) as an
//! opaque async collaborator: it can be started with a [`PhaseContext`],
//! streams [`AgentEvent`]s while it works, produces one terminal result and
//! can be cancelled by aborting its task. Events are delivered in order per
//! phase over the channel, and none are observed after cancellation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{ExecutionId, RunId};
use crate::template::{ModelTier, PhaseDefinition};
use crate::validation::FieldViolation;

/// Feedback handed to the builder when re-invoking it to repair rejected
/// output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairDirective {
    pub violations: Vec<FieldViolation>,
    pub previous_output: Value,
}

/// Everything the builder needs to perform one phase attempt.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub run_id: RunId,
    pub execution_id: ExecutionId,
    pub phase: PhaseDefinition,
    pub attempt: u32,
    pub model_tier: ModelTier,
    /// Artifact payloads of direct dependencies, keyed by phase id.
    pub inputs: BTreeMap<String, Value>,
    /// Present when this invocation repairs a rejected output.
    pub repair: Option<RepairDirective>,
}

/// Incremental activity streamed by a builder session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// One unit of tool activity; recorded verbatim in the audit trail.
    ToolCall {
        name: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        duration_ms: u64,
    },
    /// Work-in-progress output. The latest one is salvaged as a partial
    /// artifact if the session times out.
    PartialOutput { payload: Value },
}

/// Terminal output of a builder session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub payload: Value,
}

impl AgentOutput {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

/// Terminal failure of a builder session.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("Builder session failed: {0}")]
    Session(String),

    #[error("Builder produced no terminal output")]
    NoOutput,
}

/// The external entity that performs the actual work of a phase.
#[async_trait]
pub trait BuilderAgent: Send + Sync {
    /// Run one builder session for the given context.
    ///
    /// Implementations stream tool calls and partial output through
    /// `events` as they happen and return the terminal result. The engine
    /// may abort the task driving this future at any time (timeout,
    /// rollback, abandon); implementations must not rely on running to
    /// completion.
    async fn execute(
        &self,
        ctx: PhaseContext,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<AgentOutput, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_event_serialization() {
        let event = AgentEvent::ToolCall {
            name: "read_file".into(),
            input: json!({ "path": "src/main.rs" }),
            output: None,
            duration_ms: 12,
        };

        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"type\":\"tool_call\""));
        assert!(encoded.contains("read_file"));
        // Absent output is omitted entirely.
        assert!(!encoded.contains("output"));
    }

    #[test]
    fn test_partial_output_roundtrip() {
        let event = AgentEvent::PartialOutput {
            payload: json!({ "summary": "half done" }),
        };
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: AgentEvent = serde_json::from_str(&encoded).unwrap();
        match decoded {
            AgentEvent::PartialOutput { payload } => {
                assert_eq!(payload["summary"], "half done");
            }
            other => panic!("Expected PartialOutput, got {:?}", other),
        }
    }
}
