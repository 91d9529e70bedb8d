use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::AgentError;
use crate::redact::{SharedRedactor, redact_value};

use super::{AgentClient, AgentRequest, AgentResponse};

/// Scrubs PHI from prompts (and optionally from structured context) before
/// they reach a provider, and from provider error messages on the way back.
pub struct RedactingAgentClient {
    inner: Arc<dyn AgentClient>,
    redactor: SharedRedactor,
    redact_context: bool,
}

impl RedactingAgentClient {
    pub fn new(inner: Arc<dyn AgentClient>, redactor: SharedRedactor, redact_context: bool) -> Self {
        Self {
            inner,
            redactor,
            redact_context,
        }
    }

    fn scrub_error(&self, error: AgentError) -> AgentError {
        let scrub = |message: String| self.redactor.redact(&message);
        match error {
            AgentError::Unavailable { provider, message } => AgentError::Unavailable {
                provider,
                message: scrub(message),
            },
            AgentError::InvalidInput { provider, message } => AgentError::InvalidInput {
                provider,
                message: scrub(message),
            },
            AgentError::Rejected { provider, message } => AgentError::Rejected {
                provider,
                message: scrub(message),
            },
            AgentError::MalformedResponse { provider, message } => {
                AgentError::MalformedResponse {
                    provider,
                    message: scrub(message),
                }
            }
            other => other,
        }
    }
}

#[async_trait]
impl AgentClient for RedactingAgentClient {
    async fn invoke(&self, mut request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let prompt = self.redactor.redact(&request.prompt);
        debug!(
            provider = %request.provider,
            prompt_scrubbed = prompt != request.prompt,
            "Redacted agent prompt"
        );
        request.prompt = prompt;
        if self.redact_context {
            request.context = redact_value(self.redactor.as_ref(), &request.context);
        }
        self.inner
            .invoke(request)
            .await
            .map_err(|e| self.scrub_error(e))
    }
}
