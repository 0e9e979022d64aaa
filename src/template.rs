//! Workflow template definitions, JSON loading and the template registry.
//!
//! This module provides:
//! - `PhaseDefinition` and `WorkflowTemplate`, the static phase-graph config
//! - `TemplateFile`, the on-disk JSON format with load/save helpers
//! - `TemplateRegistry`, which validates templates on registration and hands
//!   out frozen `TemplateSnapshot`s at run start

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::dag::DagBuilder;
use crate::errors::TemplateError;
use crate::model::TemplateId;

/// How a phase interacts with the humans around the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    /// Requires human input while the phase runs.
    Interactive,
    /// Runs entirely through the builder agent.
    #[default]
    Automated,
    /// The builder iterates internally until its own convergence criterion.
    Loop,
}

impl PhaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Automated => "automated",
            Self::Loop => "loop",
        }
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(Self::Interactive),
            "automated" => Ok(Self::Automated),
            "loop" => Ok(Self::Loop),
            _ => Err(format!("Invalid phase type: {}", s)),
        }
    }
}

/// Resource hint for the builder model backing a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    #[default]
    Standard,
    Advanced,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Advanced => "advanced",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Self::Fast),
            "standard" => Ok(Self::Standard),
            "advanced" => Ok(Self::Advanced),
            _ => Err(format!("Invalid model tier: {}", s)),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    600
}

fn default_auto_proceed() -> bool {
    true
}

/// One step's static configuration within a template.
///
/// The field set is closed: per-phase behavior is expressed through these
/// recognized fields, never a free-form dictionary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    /// Phase id, unique within the template (e.g., "01", "plan").
    pub id: String,
    /// Human-readable name of the phase.
    pub name: String,
    #[serde(default)]
    pub phase_type: PhaseType,
    /// Execution order hint used to break ties in the ready frontier.
    #[serde(default)]
    pub order: u32,
    /// Ids of phases that must complete before this one may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whether this phase may run concurrently with other ready phases.
    #[serde(default)]
    pub parallelizable: bool,
    #[serde(default)]
    pub model_tier: ModelTier,
    /// Wall-clock budget for one builder session.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// When false, the scheduler stages the phase until an explicit continue.
    #[serde(default = "default_auto_proceed")]
    pub auto_proceed: bool,
    /// Reference to the output schema this phase's artifact must satisfy.
    pub output_schema: String,
}

impl PhaseDefinition {
    pub fn new(id: &str, name: &str, output_schema: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            phase_type: PhaseType::default(),
            order: 0,
            depends_on: Vec::new(),
            parallelizable: false,
            model_tier: ModelTier::default(),
            timeout_seconds: default_timeout_seconds(),
            auto_proceed: true,
            output_schema: output_schema.to_string(),
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn parallelizable(mut self, parallelizable: bool) -> Self {
        self.parallelizable = parallelizable;
        self
    }

    pub fn auto_proceed(mut self, auto_proceed: bool) -> Self {
        self.auto_proceed = auto_proceed;
        self
    }

    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn model_tier(mut self, tier: ModelTier) -> Self {
        self.model_tier = tier;
        self
    }

    pub fn phase_type(mut self, phase_type: PhaseType) -> Self {
        self.phase_type = phase_type;
        self
    }

    pub fn order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }
}

/// A named JSON Schema a phase output must conform to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputSchema {
    pub id: String,
    pub schema: Value,
}

impl OutputSchema {
    pub fn new(id: &str, schema: Value) -> Self {
        Self {
            id: id.to_string(),
            schema,
        }
    }
}

/// Reusable, versioned definition of a phase graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: TemplateId,
    pub name: String,
    pub phases: Vec<PhaseDefinition>,
    /// Lineage only: the template this one was cloned from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloned_from: Option<TemplateId>,
}

impl WorkflowTemplate {
    pub fn new(name: &str, phases: Vec<PhaseDefinition>) -> Self {
        Self {
            id: TemplateId::new(),
            name: name.to_string(),
            phases,
            cloned_from: None,
        }
    }

    pub fn get_phase(&self, id: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.id == id)
    }
}

/// On-disk JSON form of a template plus the schemas it references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateFile {
    pub name: String,
    pub phases: Vec<PhaseDefinition>,
    #[serde(default)]
    pub schemas: Vec<OutputSchema>,
}

impl TemplateFile {
    /// Load a template file from JSON on disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template file: {}", path.display()))?;

        let file: TemplateFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse template JSON: {}", path.display()))?;

        Ok(file)
    }

    /// Save the template file as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize template to JSON")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write template file: {}", path.display()))?;

        Ok(())
    }
}

/// A frozen deep copy of a template and its resolved schemas, taken once at
/// run start. Registry edits after the snapshot never reach the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSnapshot {
    pub template: WorkflowTemplate,
    pub schemas: BTreeMap<String, OutputSchema>,
    pub snapshot_at: DateTime<Utc>,
}

impl TemplateSnapshot {
    /// Schema for a phase. The registry guarantees the reference resolves,
    /// so a miss here indicates a template that bypassed validation.
    pub fn schema_for(&self, phase: &PhaseDefinition) -> Option<&OutputSchema> {
        self.schemas.get(&phase.output_schema)
    }

    #[cfg(test)]
    pub(crate) fn empty_for_tests() -> Self {
        Self {
            template: WorkflowTemplate::new("test", Vec::new()),
            schemas: BTreeMap::new(),
            snapshot_at: Utc::now(),
        }
    }
}

/// Registry of validated templates and the output schemas they reference.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: HashMap<TemplateId, WorkflowTemplate>,
    schemas: HashMap<String, OutputSchema>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an output schema, replacing any previous schema with the
    /// same id. Rejects schemas that do not compile.
    pub fn register_schema(&mut self, schema: OutputSchema) -> Result<(), TemplateError> {
        jsonschema::JSONSchema::compile(&schema.schema).map_err(|e| {
            TemplateError::InvalidSchema {
                schema: schema.id.clone(),
                message: e.to_string(),
            }
        })?;
        self.schemas.insert(schema.id.clone(), schema);
        Ok(())
    }

    /// Validate and register a template.
    ///
    /// Rejects duplicate phase ids, dependencies on unknown phases,
    /// dependency cycles and unresolved output-schema references.
    pub fn register(&mut self, template: WorkflowTemplate) -> Result<TemplateId, TemplateError> {
        DagBuilder::new(template.phases.clone()).build()?;

        for phase in &template.phases {
            if !self.schemas.contains_key(&phase.output_schema) {
                return Err(TemplateError::UnknownSchema {
                    phase: phase.id.clone(),
                    schema: phase.output_schema.clone(),
                });
            }
        }

        let id = template.id;
        self.templates.insert(id, template);
        Ok(id)
    }

    /// Register every schema and the template from a loaded template file.
    pub fn register_file(&mut self, file: TemplateFile) -> Result<TemplateId, TemplateError> {
        for schema in file.schemas {
            self.register_schema(schema)?;
        }
        self.register(WorkflowTemplate::new(&file.name, file.phases))
    }

    pub fn resolve(&self, id: &TemplateId) -> Result<&WorkflowTemplate, TemplateError> {
        self.templates.get(id).ok_or(TemplateError::NotFound(*id))
    }

    /// Clone a registered template under a new name, recording lineage.
    pub fn clone_template(
        &mut self,
        id: &TemplateId,
        name: &str,
    ) -> Result<TemplateId, TemplateError> {
        let source = self.resolve(id)?;
        let mut cloned = WorkflowTemplate::new(name, source.phases.clone());
        cloned.cloned_from = Some(*id);
        let new_id = cloned.id;
        self.templates.insert(new_id, cloned);
        Ok(new_id)
    }

    /// Produce the frozen snapshot used by a new run. Called once per run
    /// start; the copy is deep, so later registry edits never affect it.
    pub fn snapshot(&self, id: &TemplateId) -> Result<TemplateSnapshot, TemplateError> {
        let template = self.resolve(id)?.clone();
        let schemas = template
            .phases
            .iter()
            .filter_map(|p| self.schemas.get(&p.output_schema))
            .map(|s| (s.id.clone(), s.clone()))
            .collect();

        Ok(TemplateSnapshot {
            template,
            schemas,
            snapshot_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object_schema(id: &str) -> OutputSchema {
        OutputSchema::new(
            id,
            json!({
                "type": "object",
                "properties": { "summary": { "type": "string" } },
                "required": ["summary"]
            }),
        )
    }

    fn registry_with_schema(id: &str) -> TemplateRegistry {
        let mut registry = TemplateRegistry::new();
        registry.register_schema(object_schema(id)).unwrap();
        registry
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = registry_with_schema("plan");
        let template = WorkflowTemplate::new(
            "basic",
            vec![PhaseDefinition::new("01", "Plan", "plan")],
        );
        let id = registry.register(template).unwrap();
        assert_eq!(registry.resolve(&id).unwrap().name, "basic");
    }

    #[test]
    fn test_register_rejects_unknown_schema() {
        let mut registry = TemplateRegistry::new();
        let template = WorkflowTemplate::new(
            "basic",
            vec![PhaseDefinition::new("01", "Plan", "missing")],
        );
        let err = registry.register(template).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownSchema { .. }));
    }

    #[test]
    fn test_register_rejects_cycles() {
        let mut registry = registry_with_schema("plan");
        let template = WorkflowTemplate::new(
            "cyclic",
            vec![
                PhaseDefinition::new("01", "A", "plan").depends_on(&["02"]),
                PhaseDefinition::new("02", "B", "plan").depends_on(&["01"]),
            ],
        );
        let err = registry.register(template).unwrap_err();
        assert!(matches!(err, TemplateError::DependencyCycle { .. }));
    }

    #[test]
    fn test_register_schema_rejects_invalid_schema() {
        let mut registry = TemplateRegistry::new();
        let bad = OutputSchema::new("bad", json!({ "type": "not-a-type" }));
        let err = registry.register_schema(bad).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidSchema { .. }));
    }

    #[test]
    fn test_resolve_unknown_template() {
        let registry = TemplateRegistry::new();
        let err = registry.resolve(&TemplateId::new()).unwrap_err();
        assert!(matches!(err, TemplateError::NotFound(_)));
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let mut registry = registry_with_schema("plan");
        let template = WorkflowTemplate::new(
            "basic",
            vec![PhaseDefinition::new("01", "Plan", "plan")],
        );
        let id = registry.register(template).unwrap();
        let snapshot = registry.snapshot(&id).unwrap();

        // Replace the schema after the snapshot; the snapshot keeps the
        // original body.
        registry
            .register_schema(OutputSchema::new("plan", json!({ "type": "array" })))
            .unwrap();

        let frozen = snapshot
            .schema_for(snapshot.template.get_phase("01").unwrap())
            .unwrap();
        assert_eq!(frozen.schema["type"], "object");
    }

    #[test]
    fn test_clone_records_lineage() {
        let mut registry = registry_with_schema("plan");
        let template = WorkflowTemplate::new(
            "basic",
            vec![PhaseDefinition::new("01", "Plan", "plan")],
        );
        let id = registry.register(template).unwrap();
        let clone_id = registry.clone_template(&id, "basic-v2").unwrap();

        let cloned = registry.resolve(&clone_id).unwrap();
        assert_eq!(cloned.cloned_from, Some(id));
        assert_ne!(cloned.id, id);
        assert_eq!(cloned.phases.len(), 1);
    }

    #[test]
    fn test_template_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.json");

        let file = TemplateFile {
            name: "basic".into(),
            phases: vec![
                PhaseDefinition::new("01", "Plan", "plan"),
                PhaseDefinition::new("02", "Build", "plan")
                    .depends_on(&["01"])
                    .parallelizable(true)
                    .timeout_seconds(120),
            ],
            schemas: vec![object_schema("plan")],
        };
        file.save(&path).unwrap();

        let loaded = TemplateFile::load(&path).unwrap();
        assert_eq!(loaded.name, "basic");
        assert_eq!(loaded.phases, file.phases);
        assert_eq!(loaded.schemas.len(), 1);
    }

    #[test]
    fn test_phase_definition_defaults() {
        let json = r#"{ "id": "01", "name": "Plan", "output_schema": "plan" }"#;
        let phase: PhaseDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(phase.phase_type, PhaseType::Automated);
        assert!(!phase.parallelizable);
        assert!(phase.auto_proceed);
        assert_eq!(phase.timeout_seconds, 600);
        assert_eq!(phase.model_tier, ModelTier::Standard);
    }

    #[test]
    fn test_phase_type_and_tier_roundtrip() {
        for s in &["interactive", "automated", "loop"] {
            let parsed: PhaseType = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        for s in &["fast", "standard", "advanced"] {
            let parsed: ModelTier = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<PhaseType>().is_err());
        assert!("invalid".parse::<ModelTier>().is_err());
    }
}
