//! Mapping from committed instance events to audit entries.

use serde_json::{Value, json};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditEventKind};
use crate::definition::{StepKind, WorkflowDefinition};
use crate::instance::{EventRecord, InstanceEvent, InstanceStatus, StepStatus};
use crate::redact::Redactor;

/// The audit entry that must be durable before `record` is committed.
///
/// Payloads are represented by digests only. Free-text reasons and error
/// messages pass through `redactor` first.
pub fn entry_for_event(
    instance_id: Uuid,
    record: &EventRecord,
    status_after: InstanceStatus,
    definition: &WorkflowDefinition,
    redactor: &dyn Redactor,
) -> AuditEntry {
    let kind = match &record.event {
        InstanceEvent::Created { .. } => AuditEventKind::InstanceCreated,
        InstanceEvent::Started => AuditEventKind::InstanceStarted,
        InstanceEvent::StepDispatched { .. } => AuditEventKind::StepDispatched,
        InstanceEvent::StepAwaitingInput { .. } => AuditEventKind::StepAwaitingInput,
        InstanceEvent::StepReleased { .. } => AuditEventKind::StepReleased,
        InstanceEvent::StepRecorded { result } => match result.status {
            StepStatus::Succeeded => AuditEventKind::StepSucceeded,
            StepStatus::Failed => AuditEventKind::StepFailed,
            StepStatus::Skipped => AuditEventKind::StepSkipped,
        },
        InstanceEvent::Waiting => AuditEventKind::InstanceWaiting,
        InstanceEvent::Resumed { .. } => AuditEventKind::InstanceResumed,
        InstanceEvent::Completed => AuditEventKind::InstanceCompleted,
        InstanceEvent::Failed { .. } => AuditEventKind::InstanceFailed,
        InstanceEvent::Cancelled { .. } => AuditEventKind::InstanceCancelled,
    };

    let mut entry = AuditEntry::new(instance_id, kind, record.actor.clone())
        .at(record.at)
        .meta("event_sequence", record.sequence)
        .meta("status", status_after.to_string());
    if let Some(step_id) = record.event.step_id() {
        entry = entry.step(step_id);
    }

    match &record.event {
        InstanceEvent::Created {
            definition: reference,
            input,
            ..
        } => {
            entry = entry
                .digest_of(input)
                .meta("definition_id", reference.id.clone())
                .meta("definition_version", reference.version);
        }
        InstanceEvent::StepDispatched { step_id } => {
            if let Some(spec) = definition.step(step_id) {
                entry = entry.meta("step_kind", spec.kind.name());
            }
        }
        InstanceEvent::StepAwaitingInput { step_id } => {
            if let Some(StepKind::HumanReview {
                assignee: Some(assignee),
                ..
            }) = definition.step(step_id).map(|s| &s.kind)
            {
                entry = entry.meta("assignee", assignee.clone());
            }
        }
        InstanceEvent::StepRecorded { result } => {
            if let Some(output) = &result.output {
                entry = entry.digest_of(output);
            }
            entry = entry
                .meta("attempts", result.attempts)
                .meta("duration_ms", result.duration_ms())
                .meta("fallback_used", result.fallback_used);
            if let Some(error) = &result.error {
                entry = entry
                    .meta("error_kind", error.kind.clone())
                    .meta("error", redactor.redact(&error.message));
            }
            if let Some(usage) = &result.usage {
                entry = entry.meta("usage", usage_meta(usage));
            }
            if let Some(reviewer) = &result.completed_by {
                entry = entry.meta("completed_by", reviewer.as_str());
            }
        }
        InstanceEvent::Failed { reason } | InstanceEvent::Cancelled { reason } => {
            entry = entry.meta("reason", redactor.redact(reason));
        }
        _ => {}
    }
    entry
}

pub fn usage_meta(usage: &crate::agent::AgentUsage) -> Value {
    json!({
        "provider": usage.provider,
        "model": usage.model,
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "cost_usd": usage.cost_usd,
    })
}
