//! Prompt template expressions.
//!
//! Supports `{{ inputs.field }}` for workflow input and
//! `{{ steps.step_id.field }}` (or `{{ steps.step_id }}` for the whole
//! output) for outputs of direct dependencies. A literal `output` segment
//! after the step id is accepted and skipped, so
//! `{{ steps.triage.output.acuity }}` works too.

use std::collections::BTreeMap;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TemplateError {
    pub message: String,
}

impl TemplateError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Values available while rendering a prompt.
pub struct TemplateContext<'a> {
    pub inputs: &'a Value,
    pub steps: &'a BTreeMap<String, Value>,
}

/// A parsed `{{ ... }}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef {
    Input { field: String },
    Step { step_id: String },
    Unknown { expression: String },
}

/// Render every `{{ ... }}` expression in `template`.
pub fn render_string(template: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    let mut result = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or_else(|| TemplateError::new("unclosed template expression"))?;
        let expr = after_open[..end].trim();
        let value = resolve_expression(expr, ctx)?;
        result.push_str(&value_to_string(&value));
        rest = &after_open[end + 2..];
    }
    result.push_str(rest);

    Ok(result)
}

fn resolve_expression(expr: &str, ctx: &TemplateContext<'_>) -> Result<Value, TemplateError> {
    let mut parts = expr.split('.');
    match parts.next() {
        Some("inputs") => {
            let path: Vec<&str> = parts.collect();
            if path.is_empty() {
                return Err(TemplateError::new(format!("invalid input reference '{expr}'")));
            }
            navigate(ctx.inputs, &path)
                .cloned()
                .ok_or_else(|| TemplateError::new(format!("input '{}' not found", path.join("."))))
        }
        Some("steps") => {
            let step_id = parts
                .next()
                .ok_or_else(|| TemplateError::new(format!("invalid step reference '{expr}'")))?;
            let output = ctx
                .steps
                .get(step_id)
                .ok_or_else(|| TemplateError::new(format!("output of step '{step_id}' not available")))?;
            let mut path: Vec<&str> = parts.collect();
            if path.first() == Some(&"output") {
                path.remove(0);
            }
            navigate(output, &path).cloned().ok_or_else(|| {
                TemplateError::new(format!(
                    "field '{}' not found in output of step '{step_id}'",
                    path.join(".")
                ))
            })
        }
        _ => Err(TemplateError::new(format!("unknown template variable '{expr}'"))),
    }
}

fn navigate<'v>(root: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(root, |current, key| current.get(*key))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// List the references in a template without resolving them.
pub fn extract_references(template: &str) -> Vec<TemplateRef> {
    let mut refs = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            break;
        };
        let expr = after_open[..end].trim();
        let mut parts = expr.split('.');
        let reference = match (parts.next(), parts.next()) {
            (Some("inputs"), Some(field)) if !field.is_empty() => TemplateRef::Input {
                field: field.to_string(),
            },
            (Some("steps"), Some(step_id)) if !step_id.is_empty() => TemplateRef::Step {
                step_id: step_id.to_string(),
            },
            _ => TemplateRef::Unknown {
                expression: expr.to_string(),
            },
        };
        refs.push(reference);
        rest = &after_open[end + 2..];
    }

    refs
}

/// Whether the template has an unterminated `{{`.
pub fn has_unclosed_expression(template: &str) -> bool {
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => rest = &after_open[end + 2..],
            None => return true,
        }
    }
    false
}
