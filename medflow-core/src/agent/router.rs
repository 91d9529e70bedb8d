//! Name-based dispatch from an [`AgentRequest`] to a registered provider.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::AgentError;

use super::{AgentClient, AgentRequest, AgentResponse, ModelProvider};

/// Routes each request to the provider it names and enforces the request
/// timeout around the single provider call.
#[derive(Default)]
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl AgentClient for ProviderRouter {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let provider = self.providers.get(&request.provider).ok_or_else(|| {
            AgentError::UnknownProvider {
                provider: request.provider.clone(),
            }
        })?;

        debug!(
            provider = %request.provider,
            prompt_len = request.prompt.len(),
            timeout_ms = request.timeout.as_millis() as u64,
            "Invoking model provider"
        );

        match tokio::time::timeout(request.timeout, provider.complete(&request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!(provider = %request.provider, kind = e.kind(), "Provider call failed");
                Err(e)
            }
            Err(_) => {
                warn!(provider = %request.provider, "Provider call timed out");
                Err(AgentError::Timeout {
                    provider: request.provider.clone(),
                    timeout_ms: request.timeout.as_millis() as u64,
                })
            }
        }
    }
}
