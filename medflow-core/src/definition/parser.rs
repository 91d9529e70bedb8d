//! YAML / JSON loading of workflow definitions.

use std::path::Path;

use crate::error::ValidationError;

use super::model::WorkflowDefinition;

/// Parse a workflow definition from a YAML string.
pub fn parse_definition(yaml: &str) -> Result<WorkflowDefinition, ValidationError> {
    serde_yaml::from_str::<WorkflowDefinition>(yaml).map_err(|e| ValidationError::ParseError {
        message: e.to_string(),
    })
}

/// Parse a workflow definition from a JSON string.
pub fn parse_definition_json(json: &str) -> Result<WorkflowDefinition, ValidationError> {
    serde_json::from_str::<WorkflowDefinition>(json).map_err(|e| ValidationError::ParseError {
        message: e.to_string(),
    })
}

/// Read a definition file, choosing the format from its extension.
/// Anything other than `.json` is read as YAML.
pub async fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, ValidationError> {
    let content =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ValidationError::ParseError {
                message: format!("cannot read {}: {e}", path.display()),
            })?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_definition_json(&content),
        _ => parse_definition(&content),
    }
}
