//! CLI subcommand handlers.

use std::path::{Path, PathBuf};

use medflow_core::audit::{AuditExporter, ExportFormat, JsonlAuditLog, verify_jsonl};
use medflow_core::config::user_config_path;
use medflow_core::definition::builtins::{get_builtin, list_builtin_names};
use medflow_core::definition::{load_definition_file, topological_order, validate};
use medflow_core::merkle::ChainVerification;
use medflow_core::persistence::write_atomic;
use medflow_core::{
    Actor, AuditQuery, HumanInput, InstanceId, InstanceStatus, MedflowConfig, Orchestrator,
    StepStatus, WorkflowDefinition, WorkflowInstance,
};
use serde_json::{Map, Value};
use tracing::warn;

use crate::AuditAction;
use crate::BuiltinsAction;
use crate::Commands;
use crate::ConfigAction;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config_file: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Validate { file } => {
            let definition = validate_file(&file).await?;
            println!(
                "Definition '{}' v{} is valid ({} steps)",
                definition.id,
                definition.version,
                definition.steps.len()
            );
            println!("Execution order: {}", topological_order(&definition).join(" -> "));
            Ok(())
        }
        Commands::Run {
            file,
            builtin,
            input,
            input_json,
            actor,
            auto_approve,
            approve_output,
        } => {
            let config = load_config(config_file)?;
            let definition = match (file, builtin) {
                (Some(path), _) => load_definition_file(&path).await?,
                (None, Some(name)) => get_builtin(&name)
                    .ok_or_else(|| anyhow::anyhow!("Workflow '{}' not found", name))?,
                (None, None) => anyhow::bail!("either --file or --builtin is required"),
            };
            let input = parse_input(&input, input_json.as_deref())?;
            let approve_with = if auto_approve {
                Some(serde_json::from_str::<Value>(&approve_output).map_err(|e| {
                    anyhow::anyhow!("--approve-output is not valid JSON: {}", e)
                })?)
            } else {
                None
            };
            let instance =
                run_workflow(definition, input, &Actor::new(actor), approve_with, &config).await?;
            print_summary(&instance);
            Ok(())
        }
        Commands::Audit { action } => handle_audit(action, config_file).await,
        Commands::Builtins { action } => handle_builtins(action),
        Commands::Config { action } => handle_config(action, config_file),
    }
}

fn load_config(config_file: Option<&Path>) -> anyhow::Result<MedflowConfig> {
    medflow_core::load_config(config_file, None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

/// Parse a definition file and check it the way publishing would.
async fn validate_file(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let definition = load_definition_file(path)
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
    validate(&definition).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
    Ok(definition)
}

/// Build the instance input: the `--input-json` object, then each
/// `key=value` pair on top as a string field.
fn parse_input(pairs: &[String], json: Option<&str>) -> anyhow::Result<Value> {
    let mut fields = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => anyhow::bail!("--input-json must be a JSON object"),
        },
        None => Map::new(),
    };
    for kv in pairs {
        let Some((key, value)) = kv.split_once('=') else {
            anyhow::bail!("Invalid input format '{}', expected key=value", kv);
        };
        fields.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(Value::Object(fields))
}

/// Publish `definition`, start an instance, and drive it. Review steps are
/// approved with `approve_with` when given; otherwise the run stops while
/// the instance waits. Ctrl-C cancels the instance.
async fn run_workflow(
    definition: WorkflowDefinition,
    input: Value,
    actor: &Actor,
    approve_with: Option<Value>,
    config: &MedflowConfig,
) -> anyhow::Result<WorkflowInstance> {
    let orchestrator = Orchestrator::from_config(config).await?;
    let reference = orchestrator.publish_definition(definition).await?;
    let id = orchestrator
        .create_instance(actor, &reference.id, reference.version, input)
        .await?;
    println!("Started instance {} of {}", id, reference);

    let mut status = drive_until_interrupted(&orchestrator, actor, id).await?;
    while status == InstanceStatus::WaitingOnStep {
        let Some(output) = &approve_with else {
            break;
        };
        let waiting = orchestrator.get_instance(id).await?.awaiting_input;
        if waiting.is_empty() {
            break;
        }
        for step_id in waiting {
            if status.is_terminal() {
                break;
            }
            println!("Auto-approving review step '{}'", step_id);
            status = orchestrator
                .resume(actor, id, HumanInput::approve(step_id, output.clone()))
                .await?;
        }
        if !status.is_terminal() {
            status = drive_until_interrupted(&orchestrator, actor, id).await?;
        }
    }
    Ok(orchestrator.get_instance(id).await?)
}

async fn drive_until_interrupted(
    orchestrator: &Orchestrator,
    actor: &Actor,
    id: InstanceId,
) -> anyhow::Result<InstanceStatus> {
    tokio::select! {
        status = orchestrator.drive(actor, id) => Ok(status?),
        _ = tokio::signal::ctrl_c() => {
            warn!(instance_id = %id, "Interrupted, cancelling instance");
            orchestrator.cancel(actor, id, "interrupted by operator").await?;
            Ok(InstanceStatus::Cancelled)
        }
    }
}

fn print_summary(instance: &WorkflowInstance) {
    println!("\nInstance {} is {}", instance.id, instance.status);
    if let Some(reason) = &instance.status_reason {
        println!("Reason: {}", reason);
    }
    for (step_id, result) in &instance.step_results {
        let marker = match result.status {
            StepStatus::Succeeded => "ok",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "skipped",
        };
        let mut line = format!("  {:<20} {:<8} attempts={}", step_id, marker, result.attempts);
        if result.fallback_used {
            line.push_str(" (fallback)");
        }
        if let Some(error) = &result.error {
            line.push_str(&format!(" [{}]", error.kind));
        }
        println!("{}", line);
    }
    for step_id in &instance.awaiting_input {
        println!("  {:<20} awaiting review", step_id);
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

async fn handle_audit(action: AuditAction, config_file: Option<&Path>) -> anyhow::Result<()> {
    match action {
        AuditAction::Export {
            path,
            instance,
            format,
            output,
        } => {
            let path = audit_path(path, config_file)?;
            let format: ExportFormat = format.parse()?;
            let count = export_audit(&path, instance, format, output.as_deref()).await?;
            if output.is_some() {
                println!("Exported {} audit entries", count);
            }
            Ok(())
        }
        AuditAction::Verify { path } => {
            let path = audit_path(path, config_file)?;
            let verification = verify_audit(&path).await?;
            println!(
                "Audit log {} is intact ({} entries)",
                path.display(),
                verification.checked_links
            );
            Ok(())
        }
    }
}

fn audit_path(explicit: Option<PathBuf>, config_file: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    load_config(config_file)?
        .audit
        .path
        .ok_or_else(|| anyhow::anyhow!("no audit log given; pass --path or set audit.path"))
}

/// Render entries from a JSONL log. Returns how many were exported.
async fn export_audit(
    path: &Path,
    instance: Option<InstanceId>,
    format: ExportFormat,
    output: Option<&Path>,
) -> anyhow::Result<usize> {
    let log = JsonlAuditLog::open(path).await?;
    let entries = log.read_all().await?;
    let mut query = AuditQuery::new();
    if let Some(id) = instance {
        query = query.for_instance(id);
    }
    let selected = query.apply(&entries);
    let rendered = AuditExporter::export(&selected, format)?;
    match output {
        Some(target) => write_atomic(target, rendered.as_bytes()).await?,
        None => println!("{}", rendered),
    }
    Ok(selected.len())
}

async fn verify_audit(path: &Path) -> anyhow::Result<ChainVerification> {
    let verification = verify_jsonl(path).await?;
    if !verification.is_valid {
        anyhow::bail!(
            "Audit log {} failed verification at entry {}",
            path.display(),
            verification.first_invalid.unwrap_or_default()
        );
    }
    Ok(verification)
}

// ---------------------------------------------------------------------------
// Builtins and config
// ---------------------------------------------------------------------------

fn handle_builtins(action: BuiltinsAction) -> anyhow::Result<()> {
    match action {
        BuiltinsAction::List => {
            println!("Built-in workflows:");
            for name in list_builtin_names() {
                if let Some(definition) = get_builtin(name) {
                    println!("  {} - {}", name, definition.description);
                }
            }
            Ok(())
        }
        BuiltinsAction::Show { name } => {
            let definition = get_builtin(&name)
                .ok_or_else(|| anyhow::anyhow!("Workflow '{}' not found", name))?;
            println!("Workflow: {} v{}", definition.id, definition.version);
            println!("Description: {}", definition.description);
            println!("\nSteps:");
            for (i, step_id) in topological_order(&definition).into_iter().enumerate() {
                let Some(step) = definition.step(step_id) else {
                    continue;
                };
                let optional = if step.optional { " [optional]" } else { "" };
                let deps = if step.depends_on.is_empty() {
                    String::new()
                } else {
                    let names: Vec<&str> = step.depends_on.iter().map(String::as_str).collect();
                    format!(" after {}", names.join(", "))
                };
                println!("  {}. {} ({}){}{}", i + 1, step.id, step.kind.name(), deps, optional);
            }
            Ok(())
        }
    }
}

fn handle_config(action: ConfigAction, config_file: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_file)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigAction::Path => {
            match user_config_path() {
                Some(path) => println!("{}", path.display()),
                None => println!("No home directory; pass --config explicitly"),
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medflow_core::config::{AuditBackend, AuditConfig};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    const TRIAGE: &str = r#"
id: triage
input_schema: { note: string }
steps:
  - id: check
    kind:
      type: deterministic
      handler: require_fields
      params: { fields: [note] }
  - id: summarize
    depends_on: [check]
    kind:
      type: ai_agent
      provider: primary
      prompt: "Summarize: {{ inputs.note }}"
"#;

    #[test]
    fn test_parse_input_overlays_pairs_on_json() {
        let input = parse_input(
            &["note=chest pain".to_string(), "mrn=A-1".to_string()],
            Some(r#"{"note": "old", "age": 54}"#),
        )
        .unwrap();
        assert_eq!(input, json!({"note": "chest pain", "mrn": "A-1", "age": 54}));
    }

    #[test]
    fn test_parse_input_rejects_bad_pairs() {
        assert!(parse_input(&["note".to_string()], None).is_err());
        assert!(parse_input(&[], Some("[1, 2]")).is_err());
    }

    #[tokio::test]
    async fn test_validate_file_accepts_and_rejects() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("triage.yaml");
        std::fs::write(&good, TRIAGE).unwrap();
        assert_eq!(validate_file(&good).await.unwrap().id, "triage");

        let cyclic = dir.path().join("cyclic.yaml");
        std::fs::write(
            &cyclic,
            r#"
id: cyclic
steps:
  - id: a
    depends_on: [b]
    kind: { type: deterministic, handler: passthrough }
  - id: b
    depends_on: [a]
    kind: { type: deterministic, handler: passthrough }
"#,
        )
        .unwrap();
        assert!(validate_file(&cyclic).await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_at_review_without_auto_approve() {
        let instance = run_workflow(
            get_builtin("clinical_intake").unwrap(),
            json!({"patient_ref": "pt-7", "note": "Follow-up visit"}),
            &Actor::new("cli"),
            None,
            &MedflowConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(instance.status, InstanceStatus::WaitingOnStep);
        assert!(instance.awaiting_input.contains("clinician_review"));
    }

    #[tokio::test]
    async fn test_run_with_jsonl_audit_then_export_and_verify() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("audit.jsonl");
        let config = MedflowConfig {
            audit: AuditConfig {
                backend: AuditBackend::Jsonl,
                path: Some(log_path.clone()),
                hash_chain: true,
            },
            ..MedflowConfig::default()
        };

        let instance = run_workflow(
            get_builtin("clinical_intake").unwrap(),
            json!({"patient_ref": "pt-7", "note": "Follow-up visit"}),
            &Actor::new("cli"),
            Some(json!({"approved": true})),
            &config,
        )
        .await
        .unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);

        let verification = verify_audit(&log_path).await.unwrap();
        assert!(verification.checked_links > 0);

        let out = dir.path().join("trail.csv");
        let count = export_audit(&log_path, Some(instance.id), ExportFormat::Csv, Some(&out))
            .await
            .unwrap();
        assert_eq!(count, verification.checked_links);
        let csv = std::fs::read_to_string(&out).unwrap();
        assert!(csv.contains(&instance.id.to_string()));
        assert!(!csv.contains("Follow-up visit"));

        // Rewriting history must break verification.
        let content = std::fs::read_to_string(&log_path).unwrap();
        std::fs::write(&log_path, content.replacen("\"cli\"", "\"mallory\"", 1)).unwrap();
        assert!(verify_audit(&log_path).await.is_err());
    }

    #[test]
    fn test_builtins_show_unknown_fails() {
        let result = handle_builtins(BuiltinsAction::Show {
            name: "nonexistent".into(),
        });
        assert!(result.is_err());
        assert!(handle_builtins(BuiltinsAction::List).is_ok());
    }
}
