//! Built-in clinical workflow definitions.
//!
//! Each workflow is a YAML constant parsed on demand. They reference the
//! built-in deterministic handlers and the provider names `primary` and
//! `secondary`, which the default configuration maps to mock providers.

use super::model::WorkflowDefinition;
use super::parser::parse_definition;

pub fn list_builtin_names() -> Vec<&'static str> {
    vec!["clinical_intake", "discharge_summary", "lab_result_triage"]
}

/// Load a built-in workflow by name.
pub fn get_builtin(name: &str) -> Option<WorkflowDefinition> {
    let yaml = match name {
        "clinical_intake" => CLINICAL_INTAKE_WORKFLOW,
        "discharge_summary" => DISCHARGE_SUMMARY_WORKFLOW,
        "lab_result_triage" => LAB_RESULT_TRIAGE_WORKFLOW,
        _ => return None,
    };
    parse_definition(yaml).ok()
}

pub fn all_builtins() -> Vec<WorkflowDefinition> {
    list_builtin_names()
        .into_iter()
        .filter_map(get_builtin)
        .collect()
}

const CLINICAL_INTAKE_WORKFLOW: &str = r#"
id: clinical_intake
version: 1
description: Validate an intake note, summarize it, suggest codes, and route to a clinician
input_schema:
  patient_ref: string
  note: string
steps:
  - id: validate_intake
    kind:
      type: deterministic
      handler: require_fields
      params: { fields: [patient_ref, note] }
    output_schema: { patient_ref: string, note: string }
  - id: summarize
    depends_on: [validate_intake]
    timeout_secs: 60
    kind:
      type: ai_agent
      provider: primary
      fallback_provider: secondary
      prompt: "Summarize this intake note for clinician review: {{ steps.validate_intake.note }}"
  - id: suggest_codes
    depends_on: [validate_intake]
    optional: true
    kind:
      type: ai_agent
      provider: primary
      prompt: "Suggest ICD-10 codes for: {{ steps.validate_intake.note }}"
  - id: clinician_review
    depends_on: [summarize, suggest_codes]
    kind:
      type: human_review
      instructions: Confirm the summary and suggested codes before they enter the chart
      assignee: attending
    output_schema: { approved: boolean }
  - id: finalize
    depends_on: [clinician_review]
    kind:
      type: deterministic
      handler: collect
"#;

const DISCHARGE_SUMMARY_WORKFLOW: &str = r#"
id: discharge_summary
version: 1
description: Draft a discharge summary and have the attending sign it
input_schema:
  encounter_id: string
  course: string
steps:
  - id: gather
    kind:
      type: deterministic
      handler: passthrough
    output_schema: { encounter_id: string, course: string }
  - id: draft
    depends_on: [gather]
    timeout_secs: 90
    retry:
      max_attempts: 3
      backoff: { strategy: exponential, initial_ms: 500, multiplier: 2.0, max_ms: 5000 }
    kind:
      type: ai_agent
      provider: primary
      fallback_provider: secondary
      prompt: "Draft a discharge summary for encounter {{ steps.gather.encounter_id }}. Hospital course: {{ steps.gather.course }}"
  - id: sign_off
    depends_on: [draft]
    kind:
      type: human_review
      instructions: Attending reviews and signs the drafted summary
      assignee: attending
    output_schema: { approved: boolean }
  - id: archive
    depends_on: [sign_off]
    kind:
      type: deterministic
      handler: collect
"#;

const LAB_RESULT_TRIAGE_WORKFLOW: &str = r#"
id: lab_result_triage
version: 1
description: Flag abnormal lab results for follow-up
input_schema:
  panel: string
  results: string
steps:
  - id: normalize
    kind:
      type: deterministic
      handler: require_fields
      params: { fields: [panel, results] }
    output_schema: { panel: string, results: string }
  - id: flag
    depends_on: [normalize]
    retry:
      max_attempts: 4
      backoff: { strategy: fixed, delay_ms: 250 }
    kind:
      type: ai_agent
      provider: primary
      prompt: "Identify abnormal values in the {{ steps.normalize.panel }} panel: {{ steps.normalize.results }}"
  - id: route
    depends_on: [flag]
    kind:
      type: deterministic
      handler: collect
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::validation::validate;

    #[test]
    fn test_all_builtins_parse_and_validate() {
        let names = list_builtin_names();
        let builtins = all_builtins();
        assert_eq!(builtins.len(), names.len());
        for def in &builtins {
            assert!(validate(def).is_ok(), "builtin {} failed validation", def.id);
        }
    }

    #[test]
    fn test_builtin_ids_match_names() {
        for name in list_builtin_names() {
            let def = get_builtin(name).unwrap();
            assert_eq!(def.id, name);
        }
    }

    #[test]
    fn test_unknown_builtin() {
        assert!(get_builtin("nonexistent").is_none());
    }
}
