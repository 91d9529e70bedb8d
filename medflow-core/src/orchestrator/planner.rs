//! Eligibility planning: which steps to skip, dispatch, or hand to a
//! reviewer next, and which status the instance settles into.

use std::collections::BTreeMap;

use crate::definition::{WorkflowDefinition, topological_order};
use crate::instance::{InstanceEvent, InstanceStatus, StepStatus, WorkflowInstance};

/// The next batch of work for one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// `(step_id, blocking_dependency)` pairs to record as skipped.
    pub skip: Vec<(String, String)>,
    /// Deterministic and AI steps to claim and execute.
    pub dispatch: Vec<String>,
    /// Human review steps to park until `resume`.
    pub await_input: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.skip.is_empty() && self.dispatch.is_empty() && self.await_input.is_empty()
    }
}

/// Compute the next plan.
///
/// Walking in dependency order lets a skip propagate through a whole chain
/// in one pass: a step is skipped when a required (non-optional) dependency
/// failed or was skipped, including skips decided earlier in the same walk.
/// A step is eligible once every dependency has succeeded, or is optional
/// and has any result.
pub fn plan(definition: &WorkflowDefinition, instance: &WorkflowInstance) -> Plan {
    let mut known: BTreeMap<&str, StepStatus> = instance
        .step_results
        .iter()
        .map(|(id, r)| (id.as_str(), r.status))
        .collect();
    let mut next = Plan::default();

    for step_id in topological_order(definition) {
        if instance.is_settled_or_claimed(step_id) {
            continue;
        }
        let Some(spec) = definition.step(step_id) else {
            continue;
        };

        let blocker = spec.depends_on.iter().find(|dep| {
            let required = definition.step(dep).is_some_and(|d| !d.optional);
            required
                && matches!(
                    known.get(dep.as_str()),
                    Some(StepStatus::Failed | StepStatus::Skipped)
                )
        });
        if let Some(blocker) = blocker {
            next.skip.push((step_id.to_string(), blocker.clone()));
            known.insert(step_id, StepStatus::Skipped);
            continue;
        }

        let ready = spec.depends_on.iter().all(|dep| match known.get(dep.as_str()) {
            Some(StepStatus::Succeeded) => true,
            Some(_) => definition.step(dep).is_some_and(|d| d.optional),
            None => false,
        });
        if !ready {
            continue;
        }
        if spec.is_human_review() {
            next.await_input.push(step_id.to_string());
        } else {
            next.dispatch.push(step_id.to_string());
        }
    }
    next
}

/// The status event the instance should take now, if any.
///
/// Once every step has a result the instance completes, or fails when a
/// required step did not succeed. With nothing in flight and nothing
/// eligible, outstanding reviews put it in `waiting_on_step`.
pub fn settle(definition: &WorkflowDefinition, instance: &WorkflowInstance) -> Option<InstanceEvent> {
    if instance.is_terminal() || instance.status == InstanceStatus::Pending {
        return None;
    }

    let all_recorded = definition
        .step_ids()
        .all(|id| instance.step_results.contains_key(id));
    if all_recorded {
        let failed = definition
            .steps
            .iter()
            .filter(|s| !s.optional)
            .find(|s| instance.result(&s.id).is_some_and(|r| !r.is_success()));
        return Some(match failed {
            Some(step) => InstanceEvent::Failed {
                reason: format!("required step '{}' did not succeed", step.id),
            },
            None => InstanceEvent::Completed,
        });
    }

    let idle = instance.in_flight.is_empty() && plan(definition, instance).is_empty();
    if idle && !instance.awaiting_input.is_empty() && instance.status == InstanceStatus::Running {
        return Some(InstanceEvent::Waiting);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse_definition;
    use crate::error::StepError;
    use crate::instance::StepResult;
    use crate::types::Actor;
    use chrono::Utc;
    use serde_json::json;

    const DIAMOND: &str = r#"
id: diamond
steps:
  - id: a
    kind: { type: deterministic, handler: passthrough }
  - id: b
    depends_on: [a]
    kind: { type: deterministic, handler: passthrough }
  - id: c
    depends_on: [a]
    optional: true
    kind: { type: deterministic, handler: passthrough }
  - id: review
    depends_on: [b, c]
    kind: { type: human_review, instructions: check }
"#;

    fn started(def: &WorkflowDefinition) -> WorkflowInstance {
        let mut inst = WorkflowInstance::new(def.reference(), json!({}), Actor::new("u"));
        inst.apply(&Actor::system(), InstanceEvent::Started, Utc::now())
            .unwrap();
        inst
    }

    fn record(inst: &mut WorkflowInstance, result: StepResult) {
        inst.apply(&Actor::system(), InstanceEvent::StepRecorded { result }, Utc::now())
            .unwrap();
    }

    fn failure() -> StepError {
        StepError::HandlerFailed {
            handler: "h".into(),
            message: "boom".into(),
            transient: false,
        }
    }

    #[test]
    fn test_roots_dispatch_first() {
        let def = parse_definition(DIAMOND).unwrap();
        let p = plan(&def, &started(&def));
        assert_eq!(p.dispatch, vec!["a"]);
        assert!(p.skip.is_empty());
    }

    #[test]
    fn test_optional_failure_does_not_block() {
        let def = parse_definition(DIAMOND).unwrap();
        let mut inst = started(&def);
        record(&mut inst, StepResult::succeeded("a", json!({}), Utc::now()));
        record(&mut inst, StepResult::succeeded("b", json!({}), Utc::now()));
        record(&mut inst, StepResult::failed("c", &failure(), Utc::now()));
        let p = plan(&def, &inst);
        assert_eq!(p.await_input, vec!["review"]);
        assert!(p.skip.is_empty());
    }

    #[test]
    fn test_required_failure_skips_transitively() {
        let def = parse_definition(DIAMOND).unwrap();
        let mut inst = started(&def);
        record(&mut inst, StepResult::failed("a", &failure(), Utc::now()));
        let p = plan(&def, &inst);
        let skipped: Vec<&str> = p.skip.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(skipped, vec!["b", "c", "review"]);
        assert!(p.dispatch.is_empty());
    }

    #[test]
    fn test_settle_waits_then_completes() {
        let def = parse_definition(DIAMOND).unwrap();
        let mut inst = started(&def);
        for id in ["a", "b", "c"] {
            record(&mut inst, StepResult::succeeded(id, json!({}), Utc::now()));
        }
        inst.apply(
            &Actor::system(),
            InstanceEvent::StepAwaitingInput {
                step_id: "review".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(settle(&def, &inst), Some(InstanceEvent::Waiting));

        record(&mut inst, StepResult::succeeded("review", json!({}), Utc::now()));
        assert_eq!(settle(&def, &inst), Some(InstanceEvent::Completed));
    }

    #[test]
    fn test_settle_fails_on_required_failure() {
        let def = parse_definition(DIAMOND).unwrap();
        let mut inst = started(&def);
        record(&mut inst, StepResult::failed("a", &failure(), Utc::now()));
        for (id, _) in plan(&def, &inst).skip {
            record(&mut inst, StepResult::skipped(id, "a"));
        }
        assert!(matches!(settle(&def, &inst), Some(InstanceEvent::Failed { .. })));
    }

    #[test]
    fn test_nothing_to_settle_while_in_flight() {
        let def = parse_definition(DIAMOND).unwrap();
        let mut inst = started(&def);
        inst.apply(
            &Actor::system(),
            InstanceEvent::StepDispatched {
                step_id: "a".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(plan(&def, &inst).is_empty());
        assert_eq!(settle(&def, &inst), None);
    }
}
