//! Workflow definition data model.
//!
//! A definition is an immutable, versioned DAG of steps. Once published it is
//! never mutated; changing a workflow means publishing a new version.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;
use super::schema::Schema;

/// A complete workflow definition parsed from YAML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub description: String,
    /// Fields the caller must supply when creating an instance.
    #[serde(default)]
    pub input_schema: Schema,
    pub steps: Vec<StepSpec>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn reference(&self) -> DefinitionRef {
        DefinitionRef {
            id: self.id.clone(),
            version: self.version,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.id.as_str())
    }
}

/// Identity of one published definition version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub id: String,
    pub version: u32,
}

impl fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.id, self.version)
    }
}

/// One node of the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub kind: StepKind,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub input_schema: Schema,
    #[serde(default)]
    pub output_schema: Schema,
    /// Overrides the orchestrator's default retry policy.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Overrides the orchestrator's default per-attempt timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// A failed optional step does not fail the instance, and its dependents
    /// still run.
    #[serde(default)]
    pub optional: bool,
}

impl StepSpec {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn is_human_review(&self) -> bool {
        matches!(self.kind, StepKind::HumanReview { .. })
    }
}

/// What a step does. The set is closed; each kind is handled by the step
/// registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Runs a handler registered under `handler` in the step registry.
    Deterministic {
        handler: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Invokes an AI model through the agent client.
    AiAgent {
        provider: String,
        #[serde(default)]
        model: Option<String>,
        /// Prompt template; may reference `{{ inputs.x }}` and
        /// `{{ steps.dep.field }}` of direct dependencies.
        prompt: String,
        /// Tried once when the primary provider exhausts its retries on
        /// transient errors.
        #[serde(default)]
        fallback_provider: Option<String>,
    },
    /// Suspends the instance until a reviewer resumes it.
    HumanReview {
        instructions: String,
        #[serde(default)]
        assignee: Option<String>,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Deterministic { .. } => "deterministic",
            StepKind::AiAgent { .. } => "ai_agent",
            StepKind::HumanReview { .. } => "human_review",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_yaml_tagging() {
        let yaml = r#"
id: summarize
kind:
  type: ai_agent
  provider: primary
  prompt: "Summarize {{ inputs.note }}"
depends_on: [intake]
"#;
        let step: StepSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.kind.name(), "ai_agent");
        assert!(step.depends_on.contains("intake"));
        assert!(!step.optional);
        assert!(step.retry.is_none());
    }

    #[test]
    fn test_definition_reference_display() {
        let def = WorkflowDefinition {
            id: "intake".into(),
            version: 3,
            description: String::new(),
            input_schema: Schema::new(),
            steps: vec![],
        };
        assert_eq!(def.reference().to_string(), "intake@v3");
    }
}
