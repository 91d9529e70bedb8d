//! Workflow instance state, kept as an append-only event history plus the
//! projection of that history.
//!
//! Every mutation goes through [`WorkflowInstance::apply`], which validates
//! the event against the lifecycle graph, appends it, and updates the
//! projected fields. [`WorkflowInstance::replay`] rebuilds the same
//! projection from the history alone.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::AgentUsage;
use crate::definition::DefinitionRef;
use crate::error::{OrchestratorError, StepError};
use crate::types::Actor;

use super::status::{InstanceStatus, StepStatus};

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Why a step failed, in a form that survives serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: String,
    pub message: String,
    pub transient: bool,
}

impl From<&StepError> for StepFailure {
    fn from(e: &StepError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            transient: e.is_transient(),
        }
    }
}

/// Recorded outcome of one step. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<StepFailure>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub fallback_used: bool,
    /// Token and cost counters of the invocation that produced the output.
    #[serde(default)]
    pub usage: Option<AgentUsage>,
    /// Reviewer who supplied the result of a human review step.
    #[serde(default)]
    pub completed_by: Option<Actor>,
}

impl StepResult {
    pub fn succeeded(step_id: impl Into<String>, output: Value, started_at: DateTime<Utc>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Succeeded,
            output: Some(output),
            error: None,
            attempts: 1,
            started_at,
            ended_at: Utc::now(),
            fallback_used: false,
            usage: None,
            completed_by: None,
        }
    }

    pub fn failed(step_id: impl Into<String>, error: &StepError, started_at: DateTime<Utc>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            attempts: 1,
            started_at,
            ended_at: Utc::now(),
            fallback_used: false,
            usage: None,
            completed_by: None,
        }
    }

    pub fn skipped(step_id: impl Into<String>, blocked_by: &str) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output: None,
            error: Some(StepFailure {
                kind: "upstream_failed".into(),
                message: format!("required step '{blocked_by}' did not succeed"),
                transient: false,
            }),
            attempts: 0,
            started_at: now,
            ended_at: now,
            fallback_used: false,
            usage: None,
            completed_by: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_fallback_used(mut self, used: bool) -> Self {
        self.fallback_used = used;
        self
    }

    pub fn with_usage(mut self, usage: Option<AgentUsage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn completed_by(mut self, actor: Actor) -> Self {
        self.completed_by = Some(actor);
        self
    }

    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A state change of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceEvent {
    Created {
        instance_id: Uuid,
        definition: DefinitionRef,
        input: Value,
    },
    Started,
    /// The step was claimed for execution.
    StepDispatched { step_id: String },
    /// A human review step is ready and waiting for a reviewer.
    StepAwaitingInput { step_id: String },
    /// An in-flight claim was dropped without a result, so the step can be
    /// dispatched again.
    StepReleased { step_id: String },
    StepRecorded { result: StepResult },
    Waiting,
    Resumed { step_id: String },
    Completed,
    Failed { reason: String },
    Cancelled { reason: String },
}

impl InstanceEvent {
    /// Status this event moves the instance to, if it changes status.
    pub fn target_status(&self) -> Option<InstanceStatus> {
        match self {
            InstanceEvent::Started | InstanceEvent::Resumed { .. } => Some(InstanceStatus::Running),
            InstanceEvent::Waiting => Some(InstanceStatus::WaitingOnStep),
            InstanceEvent::Completed => Some(InstanceStatus::Completed),
            InstanceEvent::Failed { .. } => Some(InstanceStatus::Failed),
            InstanceEvent::Cancelled { .. } => Some(InstanceStatus::Cancelled),
            _ => None,
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            InstanceEvent::StepDispatched { step_id }
            | InstanceEvent::StepAwaitingInput { step_id }
            | InstanceEvent::StepReleased { step_id }
            | InstanceEvent::Resumed { step_id } => Some(step_id),
            InstanceEvent::StepRecorded { result } => Some(&result.step_id),
            _ => None,
        }
    }
}

/// An event as committed to an instance's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// 0-based position in the history.
    pub sequence: u64,
    pub at: DateTime<Utc>,
    pub actor: Actor,
    pub event: InstanceEvent,
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition: DefinitionRef,
    pub input: Value,
    pub owner: Actor,
    pub status: InstanceStatus,
    /// Reason given for the terminal failure or cancellation.
    pub status_reason: Option<String>,
    pub step_results: BTreeMap<String, StepResult>,
    /// Steps claimed for execution whose result is not recorded yet.
    pub in_flight: BTreeSet<String>,
    /// Human review steps waiting for a reviewer.
    pub awaiting_input: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Store revision this copy was loaded at. Managed by the instance store.
    pub revision: u64,
    pub events: Vec<EventRecord>,
}

impl WorkflowInstance {
    pub fn new(definition: DefinitionRef, input: Value, owner: Actor) -> Self {
        Self::with_id(Uuid::new_v4(), definition, input, owner, Utc::now())
    }

    pub fn with_id(
        id: Uuid,
        definition: DefinitionRef,
        input: Value,
        owner: Actor,
        at: DateTime<Utc>,
    ) -> Self {
        let created = EventRecord {
            sequence: 0,
            at,
            actor: owner.clone(),
            event: InstanceEvent::Created {
                instance_id: id,
                definition: definition.clone(),
                input: input.clone(),
            },
        };
        Self {
            id,
            definition,
            input,
            owner,
            status: InstanceStatus::Pending,
            status_reason: None,
            step_results: BTreeMap::new(),
            in_flight: BTreeSet::new(),
            awaiting_input: BTreeSet::new(),
            created_at: at,
            updated_at: at,
            revision: 0,
            events: vec![created],
        }
    }

    /// Rebuild an instance from its event history.
    pub fn replay(records: &[EventRecord]) -> Result<Self, OrchestratorError> {
        let (first, rest) = records
            .split_first()
            .ok_or_else(|| OrchestratorError::InvalidInput {
                message: "event history is empty".into(),
            })?;
        let InstanceEvent::Created {
            instance_id,
            definition,
            input,
        } = &first.event
        else {
            return Err(OrchestratorError::InvalidInput {
                message: "event history must start with a creation event".into(),
            });
        };
        let mut instance = Self::with_id(
            *instance_id,
            definition.clone(),
            input.clone(),
            first.actor.clone(),
            first.at,
        );
        for record in rest {
            instance.apply(&record.actor, record.event.clone(), record.at)?;
        }
        Ok(instance)
    }

    /// Validate and append an event, updating the projection.
    pub fn apply(
        &mut self,
        actor: &Actor,
        event: InstanceEvent,
        at: DateTime<Utc>,
    ) -> Result<&EventRecord, OrchestratorError> {
        if self.status.is_terminal() {
            return Err(OrchestratorError::InstanceTerminated {
                instance_id: self.id,
                status: self.status,
            });
        }
        if let Some(next) = event.target_status() {
            if next != self.status && !self.status.can_transition_to(next) {
                return Err(OrchestratorError::InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
        }

        match &event {
            InstanceEvent::Created { .. } => {
                return Err(OrchestratorError::InvalidTransition {
                    from: self.status,
                    to: InstanceStatus::Pending,
                });
            }
            InstanceEvent::Started => self.status = InstanceStatus::Running,
            InstanceEvent::StepDispatched { step_id } => {
                self.ensure_unrecorded(step_id)?;
                self.in_flight.insert(step_id.clone());
            }
            InstanceEvent::StepAwaitingInput { step_id } => {
                self.ensure_unrecorded(step_id)?;
                self.awaiting_input.insert(step_id.clone());
            }
            InstanceEvent::StepReleased { step_id } => {
                self.in_flight.remove(step_id);
            }
            InstanceEvent::StepRecorded { result } => {
                self.ensure_unrecorded(&result.step_id)?;
                self.in_flight.remove(&result.step_id);
                self.awaiting_input.remove(&result.step_id);
                self.step_results
                    .insert(result.step_id.clone(), result.clone());
            }
            InstanceEvent::Waiting => self.status = InstanceStatus::WaitingOnStep,
            InstanceEvent::Resumed { .. } => self.status = InstanceStatus::Running,
            InstanceEvent::Completed => self.status = InstanceStatus::Completed,
            InstanceEvent::Failed { reason } => {
                self.status = InstanceStatus::Failed;
                self.status_reason = Some(reason.clone());
            }
            InstanceEvent::Cancelled { reason } => {
                self.status = InstanceStatus::Cancelled;
                self.status_reason = Some(reason.clone());
                self.awaiting_input.clear();
            }
        }

        self.updated_at = at;
        self.events.push(EventRecord {
            sequence: self.events.len() as u64,
            at,
            actor: actor.clone(),
            event,
        });
        Ok(&self.events[self.events.len() - 1])
    }

    fn ensure_unrecorded(&self, step_id: &str) -> Result<(), OrchestratorError> {
        if self.step_results.contains_key(step_id) {
            return Err(OrchestratorError::InvalidInput {
                message: format!("step '{step_id}' already has a recorded result"),
            });
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.step_results.get(step_id).and_then(|r| r.output.as_ref())
    }

    /// Whether a step has been recorded, claimed, or is awaiting a reviewer.
    pub fn is_settled_or_claimed(&self, step_id: &str) -> bool {
        self.step_results.contains_key(step_id)
            || self.in_flight.contains(step_id)
            || self.awaiting_input.contains(step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(
            DefinitionRef {
                id: "intake".into(),
                version: 1,
            },
            json!({"note": "n"}),
            Actor::new("nurse.kim"),
        )
    }

    #[test]
    fn test_new_instance_is_pending_with_creation_event() {
        let inst = instance();
        assert_eq!(inst.status, InstanceStatus::Pending);
        assert_eq!(inst.events.len(), 1);
        assert!(matches!(inst.events[0].event, InstanceEvent::Created { .. }));
    }

    #[test]
    fn test_step_lifecycle_projection() {
        let mut inst = instance();
        let actor = Actor::system();
        inst.apply(&actor, InstanceEvent::Started, Utc::now()).unwrap();
        inst.apply(
            &actor,
            InstanceEvent::StepDispatched {
                step_id: "a".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(inst.in_flight.contains("a"));

        let result = StepResult::succeeded("a", json!({"ok": true}), Utc::now());
        inst.apply(&actor, InstanceEvent::StepRecorded { result }, Utc::now())
            .unwrap();
        assert!(inst.in_flight.is_empty());
        assert_eq!(inst.output("a"), Some(&json!({"ok": true})));
        assert_eq!(inst.events.last().unwrap().sequence, 3);
    }

    #[test]
    fn test_recorded_result_is_immutable() {
        let mut inst = instance();
        let actor = Actor::system();
        inst.apply(&actor, InstanceEvent::Started, Utc::now()).unwrap();
        let result = StepResult::succeeded("a", json!(1), Utc::now());
        inst.apply(
            &actor,
            InstanceEvent::StepRecorded {
                result: result.clone(),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(
            inst.apply(&actor, InstanceEvent::StepRecorded { result }, Utc::now())
                .is_err()
        );
    }

    #[test]
    fn test_terminal_instance_rejects_events() {
        let mut inst = instance();
        let actor = Actor::system();
        inst.apply(
            &actor,
            InstanceEvent::Cancelled {
                reason: "duplicate order".into(),
            },
            Utc::now(),
        )
        .unwrap();
        let before = inst.clone();
        let err = inst
            .apply(&actor, InstanceEvent::Started, Utc::now())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InstanceTerminated { .. }));
        assert_eq!(inst, before);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut inst = instance();
        let err = inst
            .apply(&Actor::system(), InstanceEvent::Completed, Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::InvalidTransition {
                from: InstanceStatus::Pending,
                to: InstanceStatus::Completed
            }
        );
    }

    #[test]
    fn test_replay_reproduces_projection() {
        let mut inst = instance();
        let actor = Actor::system();
        inst.apply(&actor, InstanceEvent::Started, Utc::now()).unwrap();
        inst.apply(
            &actor,
            InstanceEvent::StepAwaitingInput {
                step_id: "review".into(),
            },
            Utc::now(),
        )
        .unwrap();
        inst.apply(&actor, InstanceEvent::Waiting, Utc::now()).unwrap();

        let replayed = WorkflowInstance::replay(&inst.events).unwrap();
        assert_eq!(replayed, inst);
    }

    #[test]
    fn test_skipped_result_names_blocker() {
        let result = StepResult::skipped("finalize", "review");
        assert_eq!(result.status, StepStatus::Skipped);
        assert_eq!(result.attempts, 0);
        assert!(result.error.unwrap().message.contains("review"));
    }
}
