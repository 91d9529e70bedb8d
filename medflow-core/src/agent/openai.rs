//! OpenAI-compatible chat completions provider.
//!
//! Works with any endpoint speaking the `/chat/completions` protocol
//! (hosted OpenAI, Azure-style gateways, vLLM, Ollama). HTTP failures are
//! mapped onto the transient / permanent [`AgentError`] kinds.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::AgentError;

use super::{AgentRequest, AgentResponse, ModelProvider};

const SYSTEM_PROMPT: &str = "You are a clinical documentation assistant. \
Answer only from the supplied context. When asked for structured output, reply with a single JSON object.";

pub struct OpenAiCompatibleProvider {
    client: Client,
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    cost_input: f64,
    cost_output: f64,
}

impl OpenAiCompatibleProvider {
    /// Create a provider from configuration, reading the API key from the
    /// environment variable named by `config.api_key_env`. Local endpoints
    /// (localhost / 127.0.0.1) don't need a key.
    pub fn new(config: &ProviderConfig) -> Result<Self, AgentError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let is_local = base_url.contains("localhost") || base_url.contains("127.0.0.1");

        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .or_else(|| is_local.then(|| "local".to_string()))
            .ok_or_else(|| AgentError::Rejected {
                provider: config.name.clone(),
                message: format!(
                    "API key env var '{}' not set",
                    config.api_key_env.as_deref().unwrap_or("<none>")
                ),
            })?;

        Ok(Self::new_with_key(config, base_url, api_key))
    }

    fn new_with_key(config: &ProviderConfig, base_url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            name: config.name.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
            cost_input: config.input_cost_per_million / 1_000_000.0,
            cost_output: config.output_cost_per_million / 1_000_000.0,
        }
    }

    fn request_body(&self, request: &AgentRequest) -> Value {
        let context = if request.context.is_null() {
            String::new()
        } else {
            format!("\n\nContext (JSON):\n{}", request.context)
        };
        json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": [
                { "role": "system", "content": format!("{SYSTEM_PROMPT}{context}") },
                { "role": "user", "content": request.prompt },
            ],
            "temperature": 0.0,
            "stream": false,
        })
    }

    fn parse_response(&self, body: &Value, model: &str) -> Result<AgentResponse, AgentError> {
        let content = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| AgentError::MalformedResponse {
                provider: self.name.clone(),
                message: "no message content in first choice".into(),
            })?;

        let usage = body.get("usage");
        let prompt_tokens = usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let completion_tokens = usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let cost =
            prompt_tokens as f64 * self.cost_input + completion_tokens as f64 * self.cost_output;
        let model = body.get("model").and_then(|m| m.as_str()).unwrap_or(model);

        Ok(AgentResponse::text(&self.name, model, content).with_usage(
            prompt_tokens,
            completion_tokens,
            cost,
        ))
    }

    /// Map an HTTP error status to an [`AgentError`] kind.
    fn map_http_error(
        &self,
        status: reqwest::StatusCode,
        body: &str,
        retry_after_secs: Option<u64>,
    ) -> AgentError {
        let provider = self.name.clone();
        // Error bodies can echo request content, so only their size is kept.
        let message = format!("HTTP {} ({} byte body)", status.as_u16(), body.len());
        match status.as_u16() {
            400 | 413 | 422 => AgentError::InvalidInput { provider, message },
            401 | 403 => AgentError::Rejected { provider, message },
            408 => AgentError::Timeout {
                provider,
                timeout_ms: 0,
            },
            429 => AgentError::RateLimited {
                provider,
                retry_after_secs,
            },
            s if s >= 500 => AgentError::Unavailable { provider, message },
            _ => AgentError::Rejected { provider, message },
        }
    }

    fn map_send_error(&self, e: &reqwest::Error, request: &AgentRequest) -> AgentError {
        if e.is_timeout() {
            AgentError::Timeout {
                provider: self.name.clone(),
                timeout_ms: request.timeout.as_millis() as u64,
            }
        } else {
            AgentError::Unavailable {
                provider: self.name.clone(),
                message: format!("request failed: {e}"),
            }
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        let url = format!("{}/chat/completions", self.base_url);
        let model = request.model.as_deref().unwrap_or(&self.model);
        debug!(url = %url, model = %model, "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(request.timeout)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| self.map_send_error(&e, request))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response
            .text()
            .await
            .map_err(|e| self.map_send_error(&e, request))?;

        if !status.is_success() {
            return Err(self.map_http_error(status, &body, retry_after));
        }

        let json: Value = serde_json::from_str(&body).map_err(|e| AgentError::MalformedResponse {
            provider: self.name.clone(),
            message: format!("invalid JSON: {e}"),
        })?;
        self.parse_response(&json, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use std::time::Duration;

    fn provider() -> OpenAiCompatibleProvider {
        let config = ProviderConfig {
            name: "primary".into(),
            kind: ProviderKind::OpenAiCompatible,
            base_url: Some("http://localhost:11434/v1/".into()),
            model: Some("llama3".into()),
            api_key_env: None,
            input_cost_per_million: 1.0,
            output_cost_per_million: 2.0,
        };
        OpenAiCompatibleProvider::new(&config).unwrap()
    }

    #[test]
    fn test_local_endpoint_needs_no_key() {
        let p = provider();
        assert_eq!(p.base_url, "http://localhost:11434/v1");
        assert_eq!(p.model, "llama3");
    }

    #[test]
    fn test_remote_endpoint_requires_key() {
        let config = ProviderConfig {
            name: "remote".into(),
            kind: ProviderKind::OpenAiCompatible,
            base_url: Some("https://api.example.com/v1".into()),
            model: None,
            api_key_env: Some("MEDFLOW_TEST_KEY_THAT_IS_NOT_SET".into()),
            input_cost_per_million: 0.0,
            output_cost_per_million: 0.0,
        };
        let err = OpenAiCompatibleProvider::new(&config).err().unwrap();
        assert!(matches!(err, AgentError::Rejected { .. }));
    }

    #[test]
    fn test_http_error_mapping() {
        let p = provider();
        use reqwest::StatusCode;
        assert!(matches!(
            p.map_http_error(StatusCode::TOO_MANY_REQUESTS, "", Some(3)),
            AgentError::RateLimited {
                retry_after_secs: Some(3),
                ..
            }
        ));
        assert!(p.map_http_error(StatusCode::SERVICE_UNAVAILABLE, "", None).is_transient());
        assert!(p.map_http_error(StatusCode::BAD_GATEWAY, "", None).is_transient());
        assert!(matches!(
            p.map_http_error(StatusCode::UNPROCESSABLE_ENTITY, "", None),
            AgentError::InvalidInput { .. }
        ));
        assert!(matches!(
            p.map_http_error(StatusCode::FORBIDDEN, "", None),
            AgentError::Rejected { .. }
        ));
    }

    #[test]
    fn test_error_message_omits_body() {
        let p = provider();
        let err = p.map_http_error(
            reqwest::StatusCode::BAD_REQUEST,
            "patient John Doe SSN 123-45-6789",
            None,
        );
        assert!(!err.to_string().contains("John"));
    }

    #[test]
    fn test_parse_response_with_usage() {
        let p = provider();
        let body = json!({
            "model": "llama3:8b",
            "choices": [{"message": {"role": "assistant", "content": "{\"acuity\": 3}"}}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 500}
        });
        let resp = p.parse_response(&body, "llama3").unwrap();
        assert_eq!(resp.output(), json!({"acuity": 3}));
        assert_eq!(resp.usage.model, "llama3:8b");
        assert_eq!(resp.usage.prompt_tokens, 1000);
        assert!((resp.usage.cost_usd - 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_parse_response_without_choices() {
        let p = provider();
        assert!(matches!(
            p.parse_response(&json!({"choices": []}), "m"),
            Err(AgentError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_request_body_carries_context() {
        let p = provider();
        let body = p.request_body(&AgentRequest {
            provider: "primary".into(),
            model: None,
            prompt: "Summarize".into(),
            context: json!({"inputs": {"note": "n"}}),
            timeout: Duration::from_secs(5),
        });
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["messages"][1]["content"], "Summarize");
        assert!(
            body["messages"][0]["content"]
                .as_str()
                .unwrap()
                .contains("\"note\"")
        );
    }
}
