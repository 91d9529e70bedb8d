//! Scripted provider for tests and offline runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AgentError;

use super::{AgentRequest, AgentResponse, ModelProvider};

/// Failure kinds a mock can simulate, reported under the mock's own name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Unavailable,
    RateLimited,
    Timeout,
    InvalidInput,
    Rejected,
    Malformed,
}

#[derive(Debug, Clone)]
enum Outcome {
    Text(String),
    Failure(MockFailure),
}

/// One scripted reply, optionally delayed.
#[derive(Debug, Clone)]
pub struct MockReply {
    outcome: Outcome,
    delay: Duration,
}

impl MockReply {
    pub fn text(raw: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Text(raw.into()),
            delay: Duration::ZERO,
        }
    }

    pub fn json(value: Value) -> Self {
        Self::text(value.to_string())
    }

    pub fn fail(failure: MockFailure) -> Self {
        Self {
            outcome: Outcome::Failure(failure),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A provider that replays queued replies in order. With an empty queue it
/// answers with a fixed acknowledgement.
pub struct MockProvider {
    name: String,
    model: String,
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<AgentRequest>>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: "mock-model".to_string(),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, reply: MockReply) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    pub fn with_replies(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        for reply in replies {
            self.push(reply);
        }
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received so far, as the provider saw it.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn failure(&self, failure: MockFailure, request: &AgentRequest) -> AgentError {
        let provider = self.name.clone();
        match failure {
            MockFailure::Unavailable => AgentError::Unavailable {
                provider,
                message: "service unavailable".into(),
            },
            MockFailure::RateLimited => AgentError::RateLimited {
                provider,
                retry_after_secs: None,
            },
            MockFailure::Timeout => AgentError::Timeout {
                provider,
                timeout_ms: request.timeout.as_millis() as u64,
            },
            MockFailure::InvalidInput => AgentError::InvalidInput {
                provider,
                message: "prompt rejected as invalid".into(),
            },
            MockFailure::Rejected => AgentError::Rejected {
                provider,
                message: "content policy".into(),
            },
            MockFailure::Malformed => AgentError::MalformedResponse {
                provider,
                message: "truncated body".into(),
            },
        }
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| MockReply::text("Acknowledged."));

        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }

        let model = request.model.as_deref().unwrap_or(&self.model);
        match reply.outcome {
            Outcome::Text(raw) => {
                let prompt_tokens = (request.prompt.len() / 4) as u64;
                let completion_tokens = (raw.len() / 4) as u64;
                Ok(AgentResponse::text(&self.name, model, raw).with_usage(
                    prompt_tokens,
                    completion_tokens,
                    0.0,
                ))
            }
            Outcome::Failure(failure) => Err(self.failure(failure, request)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> AgentRequest {
        AgentRequest {
            provider: "mock".into(),
            model: None,
            prompt: "Summarize the note".into(),
            context: json!({}),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_replies_in_order_then_default() {
        let mock = MockProvider::new("mock").with_replies([
            MockReply::fail(MockFailure::Unavailable),
            MockReply::json(json!({"summary": "ok"})),
        ]);

        let first = mock.complete(&request()).await.unwrap_err();
        assert!(first.is_transient());
        assert_eq!(first.provider(), "mock");

        let second = mock.complete(&request()).await.unwrap();
        assert_eq!(second.output(), json!({"summary": "ok"}));

        let third = mock.complete(&request()).await.unwrap();
        assert_eq!(third.raw, "Acknowledged.");
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failures() {
        let mock = MockProvider::new("mock").with_replies([
            MockReply::fail(MockFailure::InvalidInput),
            MockReply::fail(MockFailure::Rejected),
        ]);
        assert!(!mock.complete(&request()).await.unwrap_err().is_transient());
        assert!(!mock.complete(&request()).await.unwrap_err().is_transient());
    }
}
