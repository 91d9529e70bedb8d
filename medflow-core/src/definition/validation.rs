//! Structural validation of workflow definitions.

use std::collections::{HashMap, HashSet};

use crate::error::ValidationError;

use super::model::{StepKind, StepSpec, WorkflowDefinition};
use super::templates::{TemplateRef, extract_references, has_unclosed_expression};

/// Validate a definition for structural correctness.
///
/// Checks, in order:
/// - at least one step exists
/// - step IDs are unique
/// - every dependency names a step of this definition
/// - the dependency graph is acyclic
/// - retry policies are well formed
/// - every input field a step declares is produced, with a compatible type,
///   by a direct dependency or by the workflow input
/// - prompt templates only reference workflow input and direct dependencies
pub fn validate(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    if definition.steps.is_empty() {
        return Err(ValidationError::EmptyDefinition {
            definition: definition.id.clone(),
        });
    }

    let mut by_id: HashMap<&str, &StepSpec> = HashMap::new();
    for step in &definition.steps {
        if by_id.insert(step.id.as_str(), step).is_some() {
            return Err(ValidationError::DuplicateStepId {
                step_id: step.id.clone(),
            });
        }
    }

    for step in &definition.steps {
        for dep in &step.depends_on {
            if !by_id.contains_key(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    step_id: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(path) = find_cycle(definition, &by_id) {
        return Err(ValidationError::CyclicDependency { path });
    }

    for step in &definition.steps {
        if let Some(policy) = &step.retry {
            policy
                .check()
                .map_err(|reason| ValidationError::InvalidRetryPolicy {
                    step_id: step.id.clone(),
                    reason,
                })?;
        }
    }

    for step in &definition.steps {
        check_input_schema(definition, step, &by_id)?;
        check_prompt_references(definition, step)?;
    }

    Ok(())
}

/// Depth-first search over `depends_on` edges. Returns the cycle as a path
/// that starts and ends on the same step.
fn find_cycle(
    definition: &WorkflowDefinition,
    by_id: &HashMap<&str, &StepSpec>,
) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a StepSpec>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(id.to_string());
                return Some(path);
            }
            None => {}
        }
        marks.insert(id, Mark::InProgress);
        stack.push(id);
        if let Some(step) = by_id.get(id) {
            for dep in &step.depends_on {
                if let Some(cycle) = visit(dep.as_str(), by_id, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    definition
        .steps
        .iter()
        .find_map(|step| visit(step.id.as_str(), by_id, &mut marks, &mut stack))
}

fn check_input_schema(
    definition: &WorkflowDefinition,
    step: &StepSpec,
    by_id: &HashMap<&str, &StepSpec>,
) -> Result<(), ValidationError> {
    for (field, expected) in step.input_schema.fields() {
        let mut declared = Vec::new();
        if let Some(t) = definition.input_schema.field(field) {
            declared.push(("workflow input".to_string(), t));
        }
        for dep in &step.depends_on {
            if let Some(t) = by_id.get(dep.as_str()).and_then(|d| d.output_schema.field(field)) {
                declared.push((format!("step '{dep}'"), t));
            }
        }

        if declared.iter().any(|(_, t)| expected.accepts(*t)) {
            continue;
        }
        let reason = match declared.first() {
            Some((source, actual)) => format!("expected {expected}, but {source} declares {actual}"),
            None => "not produced by any dependency or the workflow input".to_string(),
        };
        return Err(ValidationError::SchemaMismatch {
            step_id: step.id.clone(),
            field: field.to_string(),
            reason,
        });
    }
    Ok(())
}

fn check_prompt_references(
    definition: &WorkflowDefinition,
    step: &StepSpec,
) -> Result<(), ValidationError> {
    let StepKind::AiAgent { prompt, .. } = &step.kind else {
        return Ok(());
    };
    let invalid = |reason: String| ValidationError::InvalidTemplateReference {
        step_id: step.id.clone(),
        reason,
    };

    if has_unclosed_expression(prompt) {
        return Err(invalid("unclosed '{{' in prompt".into()));
    }
    for reference in extract_references(prompt) {
        match reference {
            TemplateRef::Input { field } => {
                if !definition.input_schema.is_empty()
                    && definition.input_schema.field(&field).is_none()
                {
                    return Err(invalid(format!("input '{field}' is not declared")));
                }
            }
            TemplateRef::Step { step_id } => {
                if !step.depends_on.contains(&step_id) {
                    return Err(invalid(format!(
                        "'{step_id}' is not a direct dependency"
                    )));
                }
            }
            TemplateRef::Unknown { expression } => {
                return Err(invalid(format!("unknown expression '{expression}'")));
            }
        }
    }
    Ok(())
}

/// Steps in a dependency-respecting order. Ties keep definition order.
///
/// Assumes the definition already passed [`validate`].
pub fn topological_order(definition: &WorkflowDefinition) -> Vec<&str> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(definition.steps.len());
    let mut remaining: Vec<&StepSpec> = definition.steps.iter().collect();

    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|step| {
            let ready = step.depends_on.iter().all(|d| placed.contains(d.as_str()));
            if ready {
                placed.insert(step.id.as_str());
                order.push(step.id.as_str());
            }
            !ready
        });
        if remaining.len() == before {
            break;
        }
    }
    order
}
