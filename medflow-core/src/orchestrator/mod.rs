//! Orchestrator: drives workflow instances through their lifecycle.
//!
//! Every state change follows the same commit discipline: events are
//! applied to a copy of the instance, each new event's audit entry is
//! appended, and only then is the copy saved with an optimistic revision
//! check. An audit failure aborts the commit, so nothing reaches the
//! instance store unaudited.
//!
//! `advance` runs in three phases. Under the per-instance lock it plans
//! and claims eligible steps. Without the lock it executes the claimed
//! steps concurrently, retrying transient failures with backoff. Back
//! under the lock it records each result. A result arriving after the
//! instance became terminal is written to the audit log only.

pub mod planner;
pub mod trail;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentUsage, client_from_config};
use crate::audit::{AuditEntry, AuditEventKind, AuditLog, open_audit_log};
use crate::config::{MedflowConfig, OrchestratorConfig, StorageBackend};
use crate::definition::{
    DefinitionRef, DefinitionStore, InMemoryDefinitionStore, StepKind, StepSpec, WorkflowDefinition,
    publish,
};
use crate::error::{ConfigError, MedflowError, OrchestratorError, StepError, StoreError};
use crate::instance::{
    FileInstanceStore, InMemoryInstanceStore, InstanceEvent, InstanceStatus, InstanceStore,
    StepResult, WorkflowInstance,
};
use crate::redact::{SharedRedactor, create_noop_redactor, create_phi_redactor};
use crate::registry::{StepContext, StepOutcome, StepRegistry};
use crate::types::{Actor, InstanceId};

pub use planner::{Plan, plan, settle};

/// A reviewer's answer to a human review step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInput {
    pub step_id: String,
    pub decision: ReviewDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Accept the step with `output` as its result.
    Approve { output: Value },
    /// Fail the step permanently.
    Reject { reason: String },
}

impl ReviewDecision {
    pub fn label(&self) -> &'static str {
        match self {
            ReviewDecision::Approve { .. } => "approve",
            ReviewDecision::Reject { .. } => "reject",
        }
    }
}

impl HumanInput {
    pub fn approve(step_id: impl Into<String>, output: Value) -> Self {
        Self {
            step_id: step_id.into(),
            decision: ReviewDecision::Approve { output },
        }
    }

    pub fn reject(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            decision: ReviewDecision::Reject {
                reason: reason.into(),
            },
        }
    }
}

/// The workflow engine service. Construct once and share behind an `Arc`.
pub struct Orchestrator {
    definitions: Arc<dyn DefinitionStore>,
    instances: Arc<dyn InstanceStore>,
    audit: Arc<dyn AuditLog>,
    registry: Arc<StepRegistry>,
    redactor: SharedRedactor,
    config: OrchestratorConfig,
    permits: Arc<Semaphore>,
    locks: StdMutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
    tokens: StdMutex<HashMap<InstanceId, CancellationToken>>,
    active: StdMutex<HashMap<InstanceId, HashSet<String>>>,
    backing_off: StdMutex<HashMap<InstanceId, HashSet<String>>>,
}

impl Orchestrator {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        instances: Arc<dyn InstanceStore>,
        audit: Arc<dyn AuditLog>,
        registry: StepRegistry,
    ) -> Self {
        let config = OrchestratorConfig::default();
        Self {
            definitions,
            instances,
            audit,
            registry: Arc::new(registry),
            redactor: create_phi_redactor(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_steps)),
            config,
            locks: StdMutex::new(HashMap::new()),
            tokens: StdMutex::new(HashMap::new()),
            active: StdMutex::new(HashMap::new()),
            backing_off: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.permits = Arc::new(Semaphore::new(config.max_concurrent_steps.max(1)));
        self.config = config.clone();
        self
    }

    /// Redactor applied to free text (errors, reasons) before it is
    /// written to audit metadata.
    pub fn with_redactor(mut self, redactor: SharedRedactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Build an orchestrator with the stores, audit log, and providers
    /// described by `config`.
    pub async fn from_config(config: &MedflowConfig) -> Result<Self, MedflowError> {
        let agent = client_from_config(&config.providers, &config.redaction)?;
        let audit = open_audit_log(&config.audit).await?;
        let instances: Arc<dyn InstanceStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(InMemoryInstanceStore::new()),
            StorageBackend::File => {
                let dir = config
                    .storage
                    .path
                    .clone()
                    .ok_or_else(|| ConfigError::MissingField {
                        field: "storage.path".into(),
                    })?;
                Arc::new(FileInstanceStore::new(dir))
            }
        };
        let redactor = if config.redaction.enabled {
            create_phi_redactor()
        } else {
            create_noop_redactor()
        };
        Ok(Self::new(
            Arc::new(InMemoryDefinitionStore::new()),
            instances,
            audit,
            StepRegistry::new(agent),
        )
        .with_config(&config.orchestrator)
        .with_redactor(redactor))
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionStore> {
        &self.definitions
    }

    pub fn audit_log(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Validate and freeze a definition version.
    pub async fn publish_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<DefinitionRef, MedflowError> {
        publish(self.definitions.as_ref(), definition).await
    }

    /// Create a `pending` instance of a published definition. The creation
    /// is audited before the instance is stored.
    pub async fn create_instance(
        &self,
        actor: &Actor,
        definition_id: &str,
        version: u32,
        input: Value,
    ) -> Result<InstanceId, MedflowError> {
        let definition = self
            .load_definition(&DefinitionRef {
                id: definition_id.to_string(),
                version,
            })
            .await?;
        definition
            .input_schema
            .check(&input)
            .map_err(|reason| OrchestratorError::InvalidInput {
                message: format!("instance input: {reason}"),
            })?;

        let instance = WorkflowInstance::new(definition.reference(), input, actor.clone());
        let entry = trail::entry_for_event(
            instance.id,
            &instance.events[0],
            instance.status,
            &definition,
            self.redactor.as_ref(),
        );
        self.append_audit(entry).await?;
        self.instances.insert(&instance).await?;
        info!(
            instance_id = %instance.id,
            definition = %instance.definition,
            actor = %actor,
            "Created workflow instance"
        );
        Ok(instance.id)
    }

    /// Dispatch every eligible step, wait for them, and record the results.
    ///
    /// With nothing eligible and nothing to settle this changes nothing and
    /// returns the current status.
    pub async fn advance(&self, actor: &Actor, id: InstanceId) -> Result<InstanceStatus, MedflowError> {
        let lock = self.lock_for(id);
        let guard = lock.lock().await;
        let committed = self
            .commit(id, |inst, def| {
                if inst.is_terminal() {
                    return Err(OrchestratorError::InstanceTerminated {
                        instance_id: inst.id,
                        status: inst.status,
                    }
                    .into());
                }
                let next = planner::plan(def, inst);
                let now = Utc::now();
                if !next.is_empty() {
                    if inst.status == InstanceStatus::Pending {
                        inst.apply(actor, InstanceEvent::Started, now)?;
                    }
                    for (step_id, blocker) in &next.skip {
                        let result = StepResult::skipped(step_id, blocker);
                        inst.apply(actor, InstanceEvent::StepRecorded { result }, now)?;
                    }
                    for step_id in &next.await_input {
                        let event = InstanceEvent::StepAwaitingInput {
                            step_id: step_id.clone(),
                        };
                        inst.apply(actor, event, now)?;
                    }
                    for step_id in &next.dispatch {
                        let event = InstanceEvent::StepDispatched {
                            step_id: step_id.clone(),
                        };
                        inst.apply(actor, event, now)?;
                    }
                }
                if let Some(event) = planner::settle(def, inst) {
                    inst.apply(actor, event, now)?;
                }
                Ok(next.dispatch)
            })
            .await;
        let (claimed, instance) = match committed {
            Ok(committed) => committed,
            Err(e) => {
                drop(guard);
                if is_terminated(&e) {
                    self.forget(id, lock);
                }
                return Err(e);
            }
        };
        let token = if claimed.is_empty() {
            None
        } else {
            self.mark_active(id, &claimed);
            Some(self.token_for(id))
        };
        drop(guard);

        let Some(token) = token else {
            if instance.is_terminal() {
                self.forget(id, lock);
            }
            debug!(instance_id = %id, status = %instance.status, "Nothing to dispatch");
            return Ok(instance.status);
        };
        drop(lock);

        let definition = self.load_definition(&instance.definition).await?;
        debug!(instance_id = %id, steps = ?claimed, "Dispatching steps");
        let runs = claimed
            .iter()
            .map(|step_id| self.run_step(actor, &instance, &definition, step_id, token.clone()));
        let outcomes = join_all(runs).await;
        self.clear_active(id, &claimed);

        let mut status = instance.status;
        let mut first_error = None;
        for outcome in outcomes {
            let recorded = match outcome {
                Ok(result) => self.record_result(actor, id, result).await,
                Err(e) => Err(e),
            };
            match recorded {
                Ok(s) => status = s,
                Err(e) => {
                    error!(instance_id = %id, error = %e, "Step outcome could not be committed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        info!(instance_id = %id, status = %status, "Advanced workflow instance");
        Ok(status)
    }

    /// Cancel a live instance. In-flight steps are asked to stop; whatever
    /// they return later only reaches the audit log.
    pub async fn cancel(&self, actor: &Actor, id: InstanceId, reason: &str) -> Result<(), MedflowError> {
        let lock = self.lock_for(id);
        let guard = lock.lock().await;
        let committed = self
            .commit(id, |inst, _| match inst.status {
                InstanceStatus::Cancelled => Ok(true),
                status if status.is_terminal() => Err(OrchestratorError::InstanceTerminated {
                    instance_id: inst.id,
                    status,
                }
                .into()),
                _ => {
                    let event = InstanceEvent::Cancelled {
                        reason: reason.to_string(),
                    };
                    inst.apply(actor, event, Utc::now())?;
                    Ok(false)
                }
            })
            .await;
        let already_cancelled = match committed {
            Ok((already_cancelled, _)) => already_cancelled,
            Err(e) => {
                drop(guard);
                if is_terminated(&e) {
                    self.forget(id, lock);
                }
                return Err(e);
            }
        };
        if let Some(token) = self.take_token(id) {
            token.cancel();
        }
        drop(guard);
        self.forget(id, lock);
        if !already_cancelled {
            info!(instance_id = %id, actor = %actor, "Cancelled workflow instance");
        }
        Ok(())
    }

    /// Supply the result of a human review step, then continue as
    /// [`advance`](Self::advance).
    pub async fn resume(
        &self,
        actor: &Actor,
        id: InstanceId,
        input: HumanInput,
    ) -> Result<InstanceStatus, MedflowError> {
        let lock = self.lock_for(id);
        let guard = lock.lock().await;
        let recorded = self.record_review(actor, id, &input).await;
        drop(guard);
        match recorded {
            Ok(instance) if instance.is_terminal() => {
                self.forget(id, lock);
                return Ok(instance.status);
            }
            Ok(_) => drop(lock),
            Err(e) => {
                if is_terminated(&e) {
                    self.forget(id, lock);
                }
                return Err(e);
            }
        }
        self.advance(actor, id).await
    }

    /// Apply a reviewer's decision under the instance lock.
    async fn record_review(
        &self,
        actor: &Actor,
        id: InstanceId,
        input: &HumanInput,
    ) -> Result<WorkflowInstance, MedflowError> {
        let current = self.load_instance(id).await?;
        let definition = self.load_definition(&current.definition).await?;
        check_resumable(&current, &definition, input)?;

        let payload = match &input.decision {
            ReviewDecision::Approve { output } => output.clone(),
            ReviewDecision::Reject { reason } => json!({ "reason": reason }),
        };
        let received = AuditEntry::new(id, AuditEventKind::HumanInputReceived, actor.clone())
            .step(input.step_id.clone())
            .digest_of(&payload)
            .meta("decision", input.decision.label());
        self.append_audit(received).await?;

        let (_, instance) = self
            .commit(id, |inst, def| {
                check_resumable(inst, def, input)?;
                let step_id = input.step_id.as_str();
                let now = Utc::now();
                if inst.status == InstanceStatus::WaitingOnStep {
                    let event = InstanceEvent::Resumed {
                        step_id: step_id.to_string(),
                    };
                    inst.apply(actor, event, now)?;
                }
                let started_at = awaiting_since(inst, step_id).unwrap_or(now);
                let result = match &input.decision {
                    ReviewDecision::Approve { output } => {
                        StepResult::succeeded(step_id, output.clone(), started_at)
                    }
                    ReviewDecision::Reject { reason } => {
                        let rejection = StepError::ReviewRejected {
                            step_id: step_id.to_string(),
                            reviewer: actor.to_string(),
                            reason: reason.clone(),
                        };
                        StepResult::failed(step_id, &rejection, started_at)
                    }
                }
                .completed_by(actor.clone());
                inst.apply(actor, InstanceEvent::StepRecorded { result }, now)?;
                if let Some(event) = planner::settle(def, inst) {
                    inst.apply(actor, event, now)?;
                }
                Ok(())
            })
            .await?;

        info!(
            instance_id = %id,
            step_id = %input.step_id,
            decision = input.decision.label(),
            actor = %actor,
            "Recorded human review"
        );
        Ok(instance)
    }

    /// Advance repeatedly until the instance is terminal, waits on a
    /// reviewer, or stops making progress.
    pub async fn drive(&self, actor: &Actor, id: InstanceId) -> Result<InstanceStatus, MedflowError> {
        loop {
            let before = self.load_instance(id).await?.revision;
            let status = self.advance(actor, id).await?;
            if status.is_terminal() || status == InstanceStatus::WaitingOnStep {
                return Ok(status);
            }
            if self.load_instance(id).await?.revision == before {
                return Ok(status);
            }
        }
    }

    /// Current status. A running instance with a step sleeping out a retry
    /// backoff in this process reports `waiting_on_step`; the stored status
    /// stays `running`.
    pub async fn get_status(&self, id: InstanceId) -> Result<InstanceStatus, MedflowError> {
        let status = self.load_instance(id).await?.status;
        if status == InstanceStatus::Running && self.is_backing_off(id) {
            return Ok(InstanceStatus::WaitingOnStep);
        }
        Ok(status)
    }

    pub async fn get_instance(&self, id: InstanceId) -> Result<WorkflowInstance, MedflowError> {
        self.load_instance(id).await
    }

    /// Audit entries of one instance, ordered by timestamp then append order.
    pub async fn get_audit_trail(&self, id: InstanceId) -> Result<Vec<AuditEntry>, MedflowError> {
        Ok(self.audit.query(id).await?)
    }

    /// Release claims on steps that are marked in flight but not executing
    /// in this process, typically after a restart. Released steps are
    /// dispatched again by the next `advance`.
    pub async fn release_stalled(&self, actor: &Actor, id: InstanceId) -> Result<Vec<String>, MedflowError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let running = self.active_steps(id);
        let (released, _) = self
            .commit(id, |inst, _| {
                if inst.is_terminal() {
                    return Ok(Vec::new());
                }
                let stalled: Vec<String> = inst
                    .in_flight
                    .iter()
                    .filter(|s| !running.contains(*s))
                    .cloned()
                    .collect();
                let now = Utc::now();
                for step_id in &stalled {
                    let event = InstanceEvent::StepReleased {
                        step_id: step_id.clone(),
                    };
                    inst.apply(actor, event, now)?;
                }
                Ok(stalled)
            })
            .await?;
        if !released.is_empty() {
            warn!(instance_id = %id, steps = ?released, "Released stalled step claims");
        }
        Ok(released)
    }

    /// Release stalled claims on every live instance. Returns the instances
    /// that had any.
    pub async fn recover(&self, actor: &Actor) -> Result<Vec<InstanceId>, MedflowError> {
        let mut recovered = Vec::new();
        for id in self.instances.list().await? {
            if self.load_instance(id).await?.is_terminal() {
                continue;
            }
            if !self.release_stalled(actor, id).await?.is_empty() {
                recovered.push(id);
            }
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Step execution
    // -----------------------------------------------------------------------

    async fn run_step(
        &self,
        actor: &Actor,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        step_id: &str,
        token: CancellationToken,
    ) -> Result<StepResult, MedflowError> {
        let spec = definition
            .step(step_id)
            .ok_or_else(|| OrchestratorError::UnknownStep {
                step_id: step_id.to_string(),
            })?;
        let policy = spec
            .retry
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let timeout = spec
            .timeout()
            .unwrap_or_else(|| self.config.default_step_timeout());
        let dependency_outputs: BTreeMap<String, Value> = spec
            .depends_on
            .iter()
            .filter_map(|dep| instance.output(dep).map(|o| (dep.clone(), o.clone())))
            .collect();
        let context = |attempt: u32| StepContext {
            instance_id: instance.id,
            step_id: step_id.to_string(),
            attempt,
            inputs: instance.input.clone(),
            dependency_outputs: dependency_outputs.clone(),
            params: Value::Null,
            cancel: token.clone(),
        };

        let started_at = Utc::now();
        let mut attempt = 0;
        let error = loop {
            attempt += 1;
            let error = match self.attempt_once(spec, context(attempt), timeout, None).await? {
                Ok((output, usage)) => {
                    self.audit_success(actor, instance.id, spec, attempt, None, usage.as_ref())
                        .await?;
                    return Ok(StepResult::succeeded(step_id, output, started_at)
                        .with_attempts(attempt)
                        .with_usage(usage));
                }
                Err(e) => e,
            };

            let will_retry =
                error.is_transient() && policy.allows_retry(attempt) && !token.is_cancelled();
            let backoff = policy.delay_for_error(attempt, &error);
            self.audit_failure(
                actor,
                instance.id,
                spec,
                attempt,
                None,
                &error,
                will_retry.then_some(backoff),
            )
            .await?;
            if !will_retry {
                break error;
            }

            warn!(
                instance_id = %instance.id,
                step_id,
                attempt,
                kind = error.kind(),
                backoff_ms = backoff.as_millis() as u64,
                "Transient step failure, retrying"
            );
            self.set_backing_off(instance.id, step_id, true);
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(backoff) => false,
                _ = token.cancelled() => true,
            };
            self.set_backing_off(instance.id, step_id, false);
            if cancelled {
                break error;
            }
        };

        if let StepKind::AiAgent {
            fallback_provider: Some(fallback),
            ..
        } = &spec.kind
        {
            let fallback = fallback.as_str();
            if error.is_transient() && !token.is_cancelled() {
                attempt += 1;
                info!(instance_id = %instance.id, step_id, fallback = %fallback, "Trying fallback provider");
                let result = match self
                    .attempt_once(spec, context(attempt), timeout, Some(fallback))
                    .await?
                {
                    Ok((output, usage)) => {
                        self.audit_success(
                            actor,
                            instance.id,
                            spec,
                            attempt,
                            Some(fallback),
                            usage.as_ref(),
                        )
                        .await?;
                        StepResult::succeeded(step_id, output, started_at).with_usage(usage)
                    }
                    Err(e) => {
                        self.audit_failure(actor, instance.id, spec, attempt, Some(fallback), &e, None)
                            .await?;
                        StepResult::failed(step_id, &e, started_at)
                    }
                };
                return Ok(result.with_attempts(attempt).with_fallback_used(true));
            }
        }

        warn!(
            instance_id = %instance.id,
            step_id,
            attempts = attempt,
            kind = error.kind(),
            "Step failed"
        );
        Ok(StepResult::failed(step_id, &error, started_at).with_attempts(attempt))
    }

    /// One execution attempt under a global concurrency permit. The outer
    /// error is infrastructure; the inner one is the step's own failure.
    async fn attempt_once(
        &self,
        spec: &StepSpec,
        ctx: StepContext,
        timeout: Duration,
        provider: Option<&str>,
    ) -> Result<Result<(Value, Option<AgentUsage>), StepError>, MedflowError> {
        // The semaphore is never closed, so acquisition only waits.
        let _permit = self.permits.acquire().await.ok();
        match self.registry.execute(spec, ctx, timeout, provider).await {
            Ok(StepOutcome::Completed { output, usage }) => Ok(Ok((output, usage))),
            Ok(StepOutcome::AwaitingInput) => Err(OrchestratorError::InvalidInput {
                message: format!("step '{}' needs a reviewer and cannot be dispatched", spec.id),
            }
            .into()),
            Err(e) => Ok(Err(e)),
        }
    }

    async fn record_result(
        &self,
        actor: &Actor,
        id: InstanceId,
        result: StepResult,
    ) -> Result<InstanceStatus, MedflowError> {
        let lock = self.lock_for(id);
        let guard = lock.lock().await;
        let (late, instance) = self
            .commit(id, |inst, def| {
                if inst.is_terminal() {
                    return Ok(true);
                }
                let now = Utc::now();
                let event = InstanceEvent::StepRecorded {
                    result: result.clone(),
                };
                inst.apply(actor, event, now)?;
                for (step_id, blocker) in planner::plan(def, inst).skip {
                    let result = StepResult::skipped(step_id, &blocker);
                    inst.apply(actor, InstanceEvent::StepRecorded { result }, now)?;
                }
                if let Some(event) = planner::settle(def, inst) {
                    inst.apply(actor, event, now)?;
                }
                Ok(false)
            })
            .await?;

        if late {
            let mut entry = AuditEntry::new(id, AuditEventKind::LateResultRecorded, actor.clone())
                .step(result.step_id.clone())
                .meta("result_status", result.status.to_string())
                .meta("attempts", result.attempts)
                .meta("instance_status", instance.status.to_string());
            if let Some(output) = &result.output {
                entry = entry.digest_of(output);
            }
            self.append_audit(entry).await?;
            info!(
                instance_id = %id,
                step_id = %result.step_id,
                status = %instance.status,
                "Recorded late step result for audit only"
            );
        }
        drop(guard);
        if instance.is_terminal() {
            self.forget(id, lock);
        }
        Ok(instance.status)
    }

    // -----------------------------------------------------------------------
    // Auditing
    // -----------------------------------------------------------------------

    async fn append_audit(&self, entry: AuditEntry) -> Result<AuditEntry, MedflowError> {
        self.audit.append(entry).await.map_err(|e| {
            error!(error = %e, "Audit append failed; refusing to commit");
            MedflowError::Audit(e)
        })
    }

    async fn audit_success(
        &self,
        actor: &Actor,
        id: InstanceId,
        spec: &StepSpec,
        attempt: u32,
        provider_override: Option<&str>,
        usage: Option<&AgentUsage>,
    ) -> Result<(), MedflowError> {
        let StepKind::AiAgent { provider, .. } = &spec.kind else {
            return Ok(());
        };
        let mut entry = AuditEntry::new(id, AuditEventKind::AgentInvocationSucceeded, actor.clone())
            .step(spec.id.clone())
            .meta("attempt", attempt)
            .meta("provider", provider_override.unwrap_or(provider))
            .meta("fallback", provider_override.is_some());
        if let Some(usage) = usage {
            entry = entry.meta("usage", trail::usage_meta(usage));
        }
        self.append_audit(entry).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit_failure(
        &self,
        actor: &Actor,
        id: InstanceId,
        spec: &StepSpec,
        attempt: u32,
        provider_override: Option<&str>,
        error: &StepError,
        retry_in: Option<Duration>,
    ) -> Result<(), MedflowError> {
        let kind = match &spec.kind {
            StepKind::AiAgent { .. } => AuditEventKind::AgentInvocationFailed,
            _ => AuditEventKind::StepAttemptFailed,
        };
        let mut entry = AuditEntry::new(id, kind, actor.clone())
            .step(spec.id.clone())
            .meta("attempt", attempt)
            .meta("transient", error.is_transient())
            .meta("will_retry", retry_in.is_some())
            .meta("error_kind", error.kind())
            .meta("error", self.redactor.redact(&error.to_string()));
        if let Some(delay) = retry_in {
            entry = entry.meta("backoff_ms", delay.as_millis() as u64);
        }
        if let StepKind::AiAgent { provider, .. } = &spec.kind {
            entry = entry
                .meta("provider", provider_override.unwrap_or(provider))
                .meta("fallback", provider_override.is_some());
        }
        self.append_audit(entry).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Load, mutate, audit, save. A stale write reloads and re-runs
    /// `change` up to `max_commit_attempts` times before surfacing.
    async fn commit<T, F>(&self, id: InstanceId, mut change: F) -> Result<(T, WorkflowInstance), MedflowError>
    where
        F: FnMut(&mut WorkflowInstance, &WorkflowDefinition) -> Result<T, MedflowError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load_instance(id).await?;
            let definition = self.load_definition(&current.definition).await?;
            let mut working = current.clone();
            let value = change(&mut working, &*definition)?;

            let new_records = &working.events[current.events.len()..];
            if new_records.is_empty() {
                return Ok((value, current));
            }

            let mut status = current.status;
            for record in new_records {
                if let Some(next) = record.event.target_status() {
                    status = next;
                }
                let entry =
                    trail::entry_for_event(id, record, status, &*definition, self.redactor.as_ref());
                self.append_audit(entry).await?;
            }

            match self.instances.save(&working).await {
                Ok(revision) => {
                    working.revision = revision;
                    return Ok((value, working));
                }
                Err(StoreError::StaleWrite { expected, actual, .. })
                    if attempt < self.config.max_commit_attempts =>
                {
                    warn!(instance_id = %id, expected, actual, attempt, "Stale write, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn load_instance(&self, id: InstanceId) -> Result<WorkflowInstance, MedflowError> {
        self.instances.load(id).await.map_err(|e| match e {
            StoreError::NotFound { .. } => OrchestratorError::InstanceNotFound { instance_id: id }.into(),
            other => other.into(),
        })
    }

    async fn load_definition(
        &self,
        reference: &DefinitionRef,
    ) -> Result<Arc<WorkflowDefinition>, MedflowError> {
        self.definitions
            .load(&reference.id, reference.version)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => OrchestratorError::DefinitionNotFound {
                    definition_id: reference.id.clone(),
                    version: reference.version,
                }
                .into(),
                other => other.into(),
            })
    }

    // -----------------------------------------------------------------------
    // Per-instance bookkeeping
    // -----------------------------------------------------------------------

    fn lock_for(&self, id: InstanceId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone()
    }

    fn token_for(&self, id: InstanceId) -> CancellationToken {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone()
    }

    fn take_token(&self, id: InstanceId) -> Option<CancellationToken> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Drop bookkeeping for an instance that reached a terminal state.
    /// Takes the caller's lock handle, released by now; the lock entry goes
    /// only when nobody else holds or waits on it.
    fn forget(&self, id: InstanceId, lock: Arc<Mutex<()>>) {
        self.take_token(id);
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&id);
        }
    }

    fn set_backing_off(&self, id: InstanceId, step_id: &str, waiting: bool) {
        let mut backing_off = self.backing_off.lock().unwrap_or_else(PoisonError::into_inner);
        if waiting {
            backing_off.entry(id).or_default().insert(step_id.to_string());
        } else if let Some(steps) = backing_off.get_mut(&id) {
            steps.remove(step_id);
            if steps.is_empty() {
                backing_off.remove(&id);
            }
        }
    }

    fn is_backing_off(&self, id: InstanceId) -> bool {
        self.backing_off
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    fn mark_active(&self, id: InstanceId, steps: &[String]) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .extend(steps.iter().cloned());
    }

    fn clear_active(&self, id: InstanceId, steps: &[String]) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = active.get_mut(&id) {
            for step in steps {
                running.remove(step);
            }
            if running.is_empty() {
                active.remove(&id);
            }
        }
    }

    fn active_steps(&self, id: InstanceId) -> HashSet<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Errors after which the instance needs no more per-instance bookkeeping.
fn is_terminated(e: &MedflowError) -> bool {
    matches!(
        e,
        MedflowError::Orchestrator(
            OrchestratorError::InstanceTerminated { .. } | OrchestratorError::InstanceNotFound { .. }
        )
    )
}

fn check_resumable(
    instance: &WorkflowInstance,
    definition: &WorkflowDefinition,
    input: &HumanInput,
) -> Result<(), MedflowError> {
    if instance.is_terminal() {
        return Err(OrchestratorError::InstanceTerminated {
            instance_id: instance.id,
            status: instance.status,
        }
        .into());
    }
    let spec = definition
        .step(&input.step_id)
        .ok_or_else(|| OrchestratorError::UnknownStep {
            step_id: input.step_id.clone(),
        })?;
    if !instance.awaiting_input.contains(&input.step_id) {
        return Err(OrchestratorError::NotWaiting {
            instance_id: instance.id,
            step_id: input.step_id.clone(),
        }
        .into());
    }
    if let ReviewDecision::Approve { output } = &input.decision {
        spec.output_schema
            .check(output)
            .map_err(|reason| OrchestratorError::InvalidInput {
                message: format!("review output for '{}': {reason}", spec.id),
            })?;
    }
    Ok(())
}

/// When the step was parked for review.
fn awaiting_since(instance: &WorkflowInstance, step_id: &str) -> Option<DateTime<Utc>> {
    instance.events.iter().rev().find_map(|record| match &record.event {
        InstanceEvent::StepAwaitingInput { step_id: s } if s == step_id => Some(record.at),
        _ => None,
    })
}
