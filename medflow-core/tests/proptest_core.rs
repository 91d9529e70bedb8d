//! Property-based tests for core components using proptest.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use medflow_core::definition::{WorkflowDefinition, topological_order, validate};
use medflow_core::error::{OrchestratorError, StepError, ValidationError};
use medflow_core::instance::{InstanceEvent, InstanceStatus, StepResult, WorkflowInstance};
use medflow_core::merkle::AuditChain;
use medflow_core::redact::{PhiRedactor, Redactor};
use medflow_core::types::Actor;

fn definition(deps: &[Vec<usize>]) -> WorkflowDefinition {
    let steps: Vec<_> = deps
        .iter()
        .enumerate()
        .map(|(i, on)| {
            json!({
                "id": format!("s{i}"),
                "depends_on": on.iter().map(|d| format!("s{d}")).collect::<Vec<_>>(),
                "kind": { "type": "deterministic", "handler": "passthrough" },
            })
        })
        .collect();
    serde_json::from_value(json!({ "id": "generated", "steps": steps })).unwrap()
}

/// Each step `i` depends on an arbitrary subset of the steps before it.
fn acyclic_deps() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..10).prop_flat_map(|n| {
        (0..n)
            .map(|i| prop::collection::vec(0..i.max(1), 0..=i.min(3)))
            .collect::<Vec<_>>()
    })
}

// --- Definition graph properties ---

proptest! {
    #[test]
    fn dependency_ring_is_rejected(len in 2usize..8) {
        let deps: Vec<Vec<usize>> = (0..len).map(|i| vec![(i + 1) % len]).collect();
        let err = validate(&definition(&deps)).unwrap_err();
        match err {
            ValidationError::CyclicDependency { path } => {
                prop_assert!(path.len() >= 3);
                prop_assert_eq!(path.first(), path.last());
            }
            other => prop_assert!(false, "unexpected error: {other}"),
        }
    }

    #[test]
    fn backward_edges_always_validate(deps in acyclic_deps()) {
        prop_assert!(validate(&definition(&deps)).is_ok());
    }

    #[test]
    fn topological_order_places_dependencies_first(deps in acyclic_deps()) {
        let def = definition(&deps);
        let order = topological_order(&def);
        prop_assert_eq!(order.len(), deps.len());
        let position = |id: &str| order.iter().position(|s| *s == id).unwrap();
        for step in &def.steps {
            for dep in &step.depends_on {
                prop_assert!(position(dep.as_str()) < position(step.id.as_str()));
            }
        }
    }
}

// --- Instance state machine properties ---

#[derive(Debug, Clone)]
enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        Just(Outcome::Succeeded),
        Just(Outcome::Failed),
        Just(Outcome::Skipped),
    ]
}

fn failure() -> StepError {
    StepError::HandlerFailed {
        handler: "h".into(),
        message: "boom".into(),
        transient: false,
    }
}

/// An instance driven through dispatch and recording of each outcome,
/// ending in `finish` when given.
fn history(outcomes: &[Outcome], finish: Option<InstanceEvent>) -> WorkflowInstance {
    let def = definition(&vec![Vec::new(); outcomes.len().max(1)]);
    let base = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    let actor = Actor::new("nurse.ito");
    let mut instance = WorkflowInstance::with_id(
        uuid::Uuid::new_v4(),
        def.reference(),
        json!({"note": "n"}),
        actor.clone(),
        base,
    );
    let mut tick = 0;
    let mut at = || {
        tick += 1;
        base + Duration::seconds(tick)
    };
    instance.apply(&actor, InstanceEvent::Started, at()).unwrap();
    for (i, outcome) in outcomes.iter().enumerate() {
        let step_id = format!("s{i}");
        instance
            .apply(
                &actor,
                InstanceEvent::StepDispatched {
                    step_id: step_id.clone(),
                },
                at(),
            )
            .unwrap();
        let result = match outcome {
            Outcome::Succeeded => StepResult::succeeded(&step_id, json!({"i": i}), base),
            Outcome::Failed => StepResult::failed(&step_id, &failure(), base),
            Outcome::Skipped => StepResult::skipped(&step_id, "s0"),
        };
        instance
            .apply(&actor, InstanceEvent::StepRecorded { result }, at())
            .unwrap();
    }
    if let Some(event) = finish {
        instance.apply(&actor, event, at()).unwrap();
    }
    instance
}

fn finish() -> impl Strategy<Value = Option<InstanceEvent>> {
    prop_oneof![
        Just(None),
        Just(Some(InstanceEvent::Completed)),
        Just(Some(InstanceEvent::Failed {
            reason: "required step failed".into()
        })),
        Just(Some(InstanceEvent::Cancelled {
            reason: "withdrawn".into()
        })),
    ]
}

proptest! {
    #[test]
    fn replay_rebuilds_identical_instance(
        outcomes in prop::collection::vec(outcome(), 0..8),
        end in finish(),
    ) {
        let instance = history(&outcomes, end);
        let rebuilt = WorkflowInstance::replay(&instance.events).unwrap();
        prop_assert_eq!(rebuilt, instance);
    }

    #[test]
    fn instance_survives_serde(
        outcomes in prop::collection::vec(outcome(), 0..8),
        end in finish(),
    ) {
        let instance = history(&outcomes, end);
        let encoded = serde_json::to_string(&instance).unwrap();
        let decoded: WorkflowInstance = serde_json::from_str(&encoded).unwrap();
        prop_assert_eq!(decoded, instance);
    }

    #[test]
    fn event_sequences_are_dense(outcomes in prop::collection::vec(outcome(), 0..8)) {
        let instance = history(&outcomes, None);
        for (i, record) in instance.events.iter().enumerate() {
            prop_assert_eq!(record.sequence, i as u64);
        }
        prop_assert!(instance.in_flight.is_empty());
        prop_assert_eq!(instance.step_results.len(), outcomes.len());
    }

    #[test]
    fn terminal_instances_reject_every_event(
        outcomes in prop::collection::vec(outcome(), 0..4),
        end in prop_oneof![
            Just(InstanceEvent::Completed),
            Just(InstanceEvent::Cancelled { reason: "withdrawn".into() }),
        ],
        next in prop_oneof![
            Just(InstanceEvent::Started),
            Just(InstanceEvent::Waiting),
            Just(InstanceEvent::Completed),
            Just(InstanceEvent::Cancelled { reason: "again".into() }),
            Just(InstanceEvent::StepDispatched { step_id: "late".into() }),
        ],
    ) {
        let mut instance = history(&outcomes, Some(end));
        let frozen = instance.clone();
        let err = instance.apply(&Actor::system(), next, Utc::now()).unwrap_err();
        let is_terminated = matches!(err, OrchestratorError::InstanceTerminated { .. });
        prop_assert!(is_terminated);
        prop_assert_eq!(instance, frozen);
    }

    #[test]
    fn recorded_steps_cannot_be_recorded_again(outcomes in prop::collection::vec(outcome(), 1..6)) {
        let mut instance = history(&outcomes, None);
        let again = StepResult::succeeded("s0", json!({}), Utc::now());
        let result = instance.apply(
            &Actor::system(),
            InstanceEvent::StepRecorded { result: again },
            Utc::now(),
        );
        prop_assert!(result.is_err());
        prop_assert_eq!(instance.status, InstanceStatus::Running);
    }
}

// --- Audit chain properties ---

proptest! {
    #[test]
    fn audit_chain_verifies_after_appends(
        entries in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..40)
    ) {
        let mut chain = AuditChain::new();
        for (i, bytes) in entries.iter().enumerate() {
            chain.append(i as u64 + 1, bytes);
        }
        let result = chain.verify();
        prop_assert!(result.is_valid);
        prop_assert_eq!(result.checked_links, entries.len());

        let replayed = entries
            .iter()
            .enumerate()
            .map(|(i, b)| (i as u64 + 1, b.as_slice()));
        prop_assert!(chain.verify_against(replayed).is_valid);
    }

    #[test]
    fn audit_chain_detects_altered_entry(
        entries in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 2..20),
        victim in any::<prop::sample::Index>(),
    ) {
        let mut chain = AuditChain::new();
        for (i, bytes) in entries.iter().enumerate() {
            chain.append(i as u64 + 1, bytes);
        }
        let target = victim.index(entries.len());
        let mut altered = entries.clone();
        altered[target].push(0xff);
        let replayed = altered
            .iter()
            .enumerate()
            .map(|(i, b)| (i as u64 + 1, b.as_slice()));
        let result = chain.verify_against(replayed);
        prop_assert!(!result.is_valid);
        prop_assert_eq!(result.first_invalid, Some(target));
    }
}

// --- Redaction properties ---

proptest! {
    #[test]
    fn ssn_never_survives_redaction(
        area in 100u32..900,
        group in 10u32..100,
        serial in 1000u32..10000,
        prefix in "[a-zA-Z ]{0,20}",
    ) {
        let ssn = format!("{area}-{group}-{serial}");
        let text = format!("{prefix} SSN {ssn} on file");
        let redacted = PhiRedactor::new().redact(&text);
        prop_assert!(!redacted.contains(&ssn));
        prop_assert!(redacted.contains("[REDACTED:SSN]"));
    }

    #[test]
    fn email_never_survives_redaction(
        user in "[a-z]{1,12}",
        domain in "[a-z]{2,12}",
    ) {
        let email = format!("{user}@{domain}.org");
        let redacted = PhiRedactor::new().redact(&format!("contact {email} for results"));
        prop_assert!(!redacted.contains(&email));
    }
}
