//! AI agent client: a uniform interface for invoking model providers.
//!
//! The [`AgentClient`] makes exactly one provider call per `invoke` and never
//! retries; retry policy belongs to the orchestrator. Provider failures are
//! classified into [`AgentError`] kinds so callers can tell transient
//! failures from permanent ones.

pub mod mock;
pub mod openai;
pub mod redacting;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::{ProviderConfig, ProviderKind, RedactionConfig};
use crate::error::AgentError;
use crate::redact::create_phi_redactor;

pub use mock::{MockProvider, MockReply};
pub use openai::OpenAiCompatibleProvider;
pub use redacting::RedactingAgentClient;
pub use router::ProviderRouter;

/// One model invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Registered provider name.
    pub provider: String,
    /// Overrides the provider's default model.
    pub model: Option<String>,
    pub prompt: String,
    /// Structured context (workflow input and dependency outputs).
    pub context: Value,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

/// Normalized counters reported with every successful invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl AgentUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Raw provider output plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub raw: String,
    /// Set when the provider returned (or the raw text parsed as) a JSON object.
    pub structured: Option<Value>,
    pub usage: AgentUsage,
}

impl AgentResponse {
    pub fn text(provider: &str, model: &str, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            structured: parse_object(&raw),
            raw,
            usage: AgentUsage {
                provider: provider.to_string(),
                model: model.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64, cost_usd: f64) -> Self {
        self.usage.prompt_tokens = prompt_tokens;
        self.usage.completion_tokens = completion_tokens;
        self.usage.cost_usd = cost_usd;
        self
    }

    /// The value recorded as the step output: the structured object if any,
    /// otherwise `{"text": raw}`.
    pub fn output(&self) -> Value {
        match &self.structured {
            Some(value) => value.clone(),
            None => json!({ "text": self.raw }),
        }
    }
}

fn parse_object(raw: &str) -> Option<Value> {
    serde_json::from_str::<Value>(raw.trim())
        .ok()
        .filter(|v| v.is_object())
}

/// Uniform entry point for AI invocations.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Perform a single invocation. The call either returns within
    /// `request.timeout` or fails with [`AgentError::Timeout`].
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError>;
}

/// A concrete model backend addressed by name.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError>;
}

/// Build the agent client described by configuration: a router over every
/// configured provider, wrapped in PHI redaction unless disabled.
pub fn client_from_config(
    providers: &[ProviderConfig],
    redaction: &RedactionConfig,
) -> Result<Arc<dyn AgentClient>, AgentError> {
    let mut router = ProviderRouter::new();
    for config in providers {
        let provider: Arc<dyn ModelProvider> = match config.kind {
            ProviderKind::Mock => Arc::new(MockProvider::new(&config.name)),
            ProviderKind::OpenAiCompatible => Arc::new(OpenAiCompatibleProvider::new(config)?),
        };
        router.register(provider);
    }
    let client: Arc<dyn AgentClient> = Arc::new(router);
    if !redaction.enabled {
        return Ok(client);
    }
    Ok(Arc::new(RedactingAgentClient::new(
        client,
        create_phi_redactor(),
        redaction.redact_context,
    )))
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
