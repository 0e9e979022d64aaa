//! Schema validation gate for builder-agent output.
//!
//! Raw agent output becomes an [`Artifact`] only by passing its phase's
//! declared JSON Schema, or through the explicit force-accept path, which
//! flags the artifact as unvalidated-by-override. A rejection always carries
//! the raw output, the schema id and field-level violations, never a bare
//! message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{Artifact, ExecutionId, RunId};
use crate::template::OutputSchema;

/// One field-level schema violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// JSON pointer into the raw output ("" for document-level violations).
    pub path: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(path: &str, message: &str) -> Self {
        Self {
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}

/// A structured validation rejection.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Output for phase {phase} failed schema {schema} with {} violation(s)", violations.len())]
pub struct ValidationFailure {
    pub phase: String,
    pub schema: String,
    pub raw_output: Value,
    pub violations: Vec<FieldViolation>,
}

impl ValidationFailure {
    /// One-line summary of the violations, used as repair feedback.
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| {
                if v.path.is_empty() {
                    v.message.clone()
                } else {
                    format!("{}: {}", v.path, v.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validates raw phase output against the phase's declared schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationGate;

impl ValidationGate {
    pub fn new() -> Self {
        Self
    }

    /// Validate raw output, producing an artifact on success.
    ///
    /// Runs synchronously relative to the owning execution's transition to
    /// completed: no artifact exists without either a passing validation or
    /// an explicit override flag.
    pub fn validate(
        &self,
        run_id: RunId,
        execution_id: ExecutionId,
        phase: &str,
        raw: Value,
        schema: &OutputSchema,
    ) -> Result<Artifact, ValidationFailure> {
        let compiled = match jsonschema::JSONSchema::compile(&schema.schema) {
            Ok(compiled) => compiled,
            Err(e) => {
                return Err(ValidationFailure {
                    phase: phase.to_string(),
                    schema: schema.id.clone(),
                    raw_output: raw,
                    violations: vec![FieldViolation::new(
                        "",
                        &format!("schema failed to compile: {}", e),
                    )],
                });
            }
        };

        let violations: Vec<FieldViolation> = match compiled.validate(&raw) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| FieldViolation {
                    path: e.instance_path.to_string(),
                    message: e.to_string(),
                })
                .collect(),
        };

        if !violations.is_empty() {
            return Err(ValidationFailure {
                phase: phase.to_string(),
                schema: schema.id.clone(),
                raw_output: raw,
                violations,
            });
        }

        Ok(Artifact::validated(
            run_id,
            execution_id,
            phase,
            &schema.id,
            raw,
        ))
    }

    /// Materialize non-conforming output as an artifact anyway.
    ///
    /// The only path that produces an artifact without a passing validation;
    /// the result carries the force-accepted flag.
    pub fn force_accept(
        &self,
        run_id: RunId,
        execution_id: ExecutionId,
        phase: &str,
        schema_id: &str,
        raw: Value,
    ) -> Artifact {
        Artifact::forced(run_id, execution_id, phase, schema_id, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> OutputSchema {
        OutputSchema::new(
            "report",
            json!({
                "type": "object",
                "properties": {
                    "summary": { "type": "string" },
                    "score": { "type": "integer", "minimum": 0 }
                },
                "required": ["summary", "score"]
            }),
        )
    }

    #[test]
    fn test_conforming_output_produces_artifact() {
        let gate = ValidationGate::new();
        let raw = json!({ "summary": "done", "score": 3 });

        let artifact = gate
            .validate(RunId::new(), ExecutionId::new(), "05", raw.clone(), &schema())
            .unwrap();

        assert_eq!(artifact.phase, "05");
        assert_eq!(artifact.schema, "report");
        assert_eq!(artifact.payload, raw);
        assert!(!artifact.force_accepted);
        assert!(!artifact.partial);
    }

    #[test]
    fn test_rejection_carries_field_level_violations() {
        let gate = ValidationGate::new();
        let raw = json!({ "summary": 42 });

        let failure = gate
            .validate(RunId::new(), ExecutionId::new(), "05", raw.clone(), &schema())
            .unwrap_err();

        assert_eq!(failure.phase, "05");
        assert_eq!(failure.schema, "report");
        assert_eq!(failure.raw_output, raw);
        // Wrong type on /summary and missing required "score".
        assert_eq!(failure.violations.len(), 2);
        assert!(failure
            .violations
            .iter()
            .any(|v| v.path == "/summary"));
        assert!(!failure.summary().is_empty());
    }

    #[test]
    fn test_uncompilable_schema_is_a_document_level_violation() {
        let gate = ValidationGate::new();
        let bad = OutputSchema::new("bad", json!({ "type": "not-a-type" }));

        let failure = gate
            .validate(RunId::new(), ExecutionId::new(), "05", json!({}), &bad)
            .unwrap_err();

        assert_eq!(failure.violations.len(), 1);
        assert_eq!(failure.violations[0].path, "");
        assert!(failure.violations[0].message.contains("compile"));
    }

    #[test]
    fn test_force_accept_flags_artifact() {
        let gate = ValidationGate::new();
        let raw = json!({ "not": "conforming" });

        let artifact = gate.force_accept(
            RunId::new(),
            ExecutionId::new(),
            "05",
            "report",
            raw.clone(),
        );

        assert!(artifact.force_accepted);
        assert!(!artifact.partial);
        assert_eq!(artifact.payload, raw);
    }

    #[test]
    fn test_failure_display_counts_violations() {
        let gate = ValidationGate::new();
        let failure = gate
            .validate(RunId::new(), ExecutionId::new(), "05", json!({}), &schema())
            .unwrap_err();
        assert!(failure.to_string().contains("violation"));
    }
}
