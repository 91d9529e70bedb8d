//! Step Registry: executes one step attempt according to its kind.
//!
//! Deterministic steps run a handler looked up by name, AI steps render
//! their prompt and go through the [`AgentClient`], and human review steps
//! never execute here; they report [`StepOutcome::AwaitingInput`] and wait
//! for `resume`. The registry runs exactly one attempt per call. Retries,
//! fallback, and auditing are the orchestrator's job.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::agent::{AgentClient, AgentRequest, AgentUsage};
use crate::definition::templates::{TemplateContext, render_string};
use crate::definition::{StepKind, StepSpec};
use crate::error::StepError;

/// Everything a handler may read while executing one attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub instance_id: Uuid,
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The instance input.
    pub inputs: Value,
    /// Outputs of the step's direct dependencies, by step id.
    pub dependency_outputs: BTreeMap<String, Value>,
    pub params: Value,
    /// Fired when the instance is cancelled. Handlers should stop early.
    pub cancel: CancellationToken,
}

impl StepContext {
    /// Instance input fields overlaid with dependency output fields, in
    /// dependency id order.
    pub fn merged_input(&self) -> Value {
        let mut merged = Map::new();
        if let Value::Object(fields) = &self.inputs {
            merged.extend(fields.clone());
        }
        for output in self.dependency_outputs.values() {
            if let Value::Object(fields) = output {
                merged.extend(fields.clone());
            }
        }
        Value::Object(merged)
    }
}

/// A deterministic step implementation.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, ctx: StepContext) -> Result<Value, StepError>;
}

/// Adapts a plain function into a [`StepHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> StepHandler for FnHandler<F>
where
    F: Fn(&StepContext) -> Result<Value, StepError> + Send + Sync,
{
    async fn execute(&self, ctx: StepContext) -> Result<Value, StepError> {
        (self.0)(&ctx)
    }
}

/// Result of one successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed {
        output: Value,
        usage: Option<AgentUsage>,
    },
    /// The step needs a reviewer; nothing was executed.
    AwaitingInput,
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Returns the merged input unchanged.
struct Passthrough;

#[async_trait]
impl StepHandler for Passthrough {
    async fn execute(&self, ctx: StepContext) -> Result<Value, StepError> {
        Ok(ctx.merged_input())
    }
}

/// Fails permanently unless every field named in `params.fields` is present
/// and non-null in the merged input.
struct RequireFields;

#[async_trait]
impl StepHandler for RequireFields {
    async fn execute(&self, ctx: StepContext) -> Result<Value, StepError> {
        let input = ctx.merged_input();
        let fields = ctx
            .params
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| StepError::HandlerFailed {
                handler: "require_fields".into(),
                message: "params.fields must be a list of field names".into(),
                transient: false,
            })?;
        let missing: Vec<&str> = fields
            .iter()
            .filter_map(Value::as_str)
            .filter(|f| input.get(*f).is_none_or(Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(StepError::HandlerFailed {
                handler: "require_fields".into(),
                message: format!("missing required fields: {}", missing.join(", ")),
                transient: false,
            });
        }
        Ok(input)
    }
}

/// Gathers dependency outputs into one object keyed by step id.
struct Collect;

#[async_trait]
impl StepHandler for Collect {
    async fn execute(&self, ctx: StepContext) -> Result<Value, StepError> {
        Ok(json!(ctx.dependency_outputs))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    agent: Arc<dyn AgentClient>,
}

impl StepRegistry {
    /// A registry with the built-in handlers `passthrough`,
    /// `require_fields`, and `collect`.
    pub fn new(agent: Arc<dyn AgentClient>) -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
            agent,
        };
        registry.register("passthrough", Arc::new(Passthrough));
        registry.register("require_fields", Arc::new(RequireFields));
        registry.register("collect", Arc::new(Collect));
        registry
    }

    /// Register (or replace) a handler.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let name = name.into();
        debug!(handler = %name, "Registering step handler");
        self.handlers.insert(name, handler);
    }

    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.register(name, handler);
        self
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn handler_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run one attempt of `spec`. `provider_override` replaces the AI
    /// step's provider (used for the fallback attempt).
    pub async fn execute(
        &self,
        spec: &StepSpec,
        ctx: StepContext,
        timeout: Duration,
        provider_override: Option<&str>,
    ) -> Result<StepOutcome, StepError> {
        match &spec.kind {
            StepKind::Deterministic { handler, params } => {
                let implementation =
                    self.handlers
                        .get(handler)
                        .cloned()
                        .ok_or_else(|| StepError::UnknownHandler {
                            handler: handler.clone(),
                        })?;
                let ctx = StepContext {
                    params: params.clone(),
                    ..ctx
                };
                let output = tokio::time::timeout(timeout, implementation.execute(ctx))
                    .await
                    .map_err(|_| StepError::Timeout {
                        step_id: spec.id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })??;
                check_output(spec, &output)?;
                Ok(StepOutcome::Completed {
                    output,
                    usage: None,
                })
            }
            StepKind::AiAgent {
                provider,
                model,
                prompt,
                ..
            } => {
                let template_ctx = TemplateContext {
                    inputs: &ctx.inputs,
                    steps: &ctx.dependency_outputs,
                };
                let rendered =
                    render_string(prompt, &template_ctx).map_err(|e| StepError::Template {
                        step_id: spec.id.clone(),
                        message: e.message,
                    })?;
                let request = AgentRequest {
                    provider: provider_override.unwrap_or(provider).to_string(),
                    model: model.clone(),
                    prompt: rendered,
                    context: json!({
                        "inputs": ctx.inputs,
                        "steps": ctx.dependency_outputs,
                    }),
                    timeout,
                };
                let response = self.agent.invoke(request).await?;
                let output = response.output();
                check_output(spec, &output)?;
                Ok(StepOutcome::Completed {
                    output,
                    usage: Some(response.usage),
                })
            }
            StepKind::HumanReview { .. } => Ok(StepOutcome::AwaitingInput),
        }
    }
}

/// Check a produced output against the step's declared output schema.
pub fn check_output(spec: &StepSpec, output: &Value) -> Result<(), StepError> {
    spec.output_schema
        .check(output)
        .map_err(|reason| StepError::OutputSchemaViolation {
            step_id: spec.id.clone(),
            reason,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MockProvider, MockReply, ProviderRouter};
    use crate::definition::{FieldType, Schema};
    use crate::error::AgentError;
    use crate::agent::mock::MockFailure;

    fn ctx(inputs: Value) -> StepContext {
        StepContext {
            instance_id: Uuid::nil(),
            step_id: "s".into(),
            attempt: 1,
            inputs,
            dependency_outputs: BTreeMap::new(),
            params: Value::Null,
            cancel: CancellationToken::new(),
        }
    }

    fn deterministic(id: &str, handler: &str, params: Value) -> StepSpec {
        StepSpec {
            id: id.into(),
            kind: StepKind::Deterministic {
                handler: handler.into(),
                params,
            },
            depends_on: Default::default(),
            input_schema: Schema::new(),
            output_schema: Schema::new(),
            retry: None,
            timeout_secs: None,
            optional: false,
        }
    }

    fn ai(id: &str, prompt: &str) -> StepSpec {
        StepSpec {
            kind: StepKind::AiAgent {
                provider: "primary".into(),
                model: None,
                prompt: prompt.into(),
                fallback_provider: None,
            },
            ..deterministic(id, "", Value::Null)
        }
    }

    fn registry(mock: Arc<MockProvider>) -> StepRegistry {
        StepRegistry::new(Arc::new(ProviderRouter::new().with_provider(mock)))
    }

    #[tokio::test]
    async fn test_require_fields_reports_missing() {
        let reg = registry(Arc::new(MockProvider::new("primary")));
        let spec = deterministic("v", "require_fields", json!({"fields": ["note", "mrn"]}));
        let err = reg
            .execute(&spec, ctx(json!({"note": "x"})), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("mrn"));
    }

    #[tokio::test]
    async fn test_collect_and_merge() {
        let reg = registry(Arc::new(MockProvider::new("primary")));
        let mut c = ctx(json!({"a": 1}));
        c.dependency_outputs.insert("x".into(), json!({"b": 2}));

        let out = reg
            .execute(&deterministic("p", "passthrough", Value::Null), c.clone(), Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(
            out,
            StepOutcome::Completed {
                output: json!({"a": 1, "b": 2}),
                usage: None
            }
        );

        let out = reg
            .execute(&deterministic("c", "collect", Value::Null), c, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert!(matches!(out, StepOutcome::Completed { output, .. } if output == json!({"x": {"b": 2}})));
    }

    #[tokio::test]
    async fn test_unknown_handler_is_permanent() {
        let reg = registry(Arc::new(MockProvider::new("primary")));
        let err = reg
            .execute(&deterministic("u", "nope", Value::Null), ctx(json!({})), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::UnknownHandler { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_handler_timeout_is_transient() {
        struct Slow;
        #[async_trait]
        impl StepHandler for Slow {
            async fn execute(&self, _ctx: StepContext) -> Result<Value, StepError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            }
        }
        let reg = registry(Arc::new(MockProvider::new("primary"))).with_handler("slow", Arc::new(Slow));
        let err = reg
            .execute(&deterministic("s", "slow", Value::Null), ctx(json!({})), Duration::from_millis(20), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_ai_step_renders_prompt_and_reports_usage() {
        let mock = Arc::new(MockProvider::new("primary").with_replies([MockReply::json(json!({"summary": "stable"}))]));
        let reg = registry(mock.clone());
        let out = reg
            .execute(&ai("sum", "Summarize {{ inputs.note }}"), ctx(json!({"note": "chest pain"})), Duration::from_secs(1), None)
            .await
            .unwrap();
        let StepOutcome::Completed { output, usage } = out else {
            panic!("expected completion");
        };
        assert_eq!(output, json!({"summary": "stable"}));
        assert_eq!(usage.unwrap().provider, "primary");
        assert_eq!(mock.requests()[0].prompt, "Summarize chest pain");
    }

    #[tokio::test]
    async fn test_ai_failure_keeps_classification() {
        let mock = Arc::new(MockProvider::new("primary").with_replies([MockReply::fail(MockFailure::RateLimited)]));
        let reg = registry(mock);
        let err = reg
            .execute(&ai("sum", "hi"), ctx(json!({})), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Agent(AgentError::RateLimited { .. })));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_output_schema_violation() {
        let reg = registry(Arc::new(MockProvider::new("primary")));
        let mut spec = ai("sum", "hi");
        spec.output_schema = Schema::new().with_field("summary", FieldType::String);
        let err = reg
            .execute(&spec, ctx(json!({})), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::OutputSchemaViolation { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_human_review_awaits_input() {
        let reg = registry(Arc::new(MockProvider::new("primary")));
        let spec = StepSpec {
            kind: StepKind::HumanReview {
                instructions: "check".into(),
                assignee: None,
            },
            ..deterministic("r", "", Value::Null)
        };
        let out = reg
            .execute(&spec, ctx(json!({})), Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(out, StepOutcome::AwaitingInput);
    }
}
