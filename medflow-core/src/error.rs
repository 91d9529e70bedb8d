//! Error types for the Medflow workflow engine.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering definition validation, step execution, AI agent invocation,
//! persistence, auditing, and configuration.

use std::path::PathBuf;

use uuid::Uuid;

use crate::audit::AuditError;
use crate::instance::InstanceStatus;

/// Top-level error type for the Medflow core library.
#[derive(Debug, thiserror::Error)]
pub enum MedflowError {
    #[error("Definition error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Audit failure: {0}")]
    Audit(#[from] AuditError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MedflowError {
    /// Fatal errors must reach an operator. An audit failure always is one,
    /// since the engine refuses to commit anything it could not record.
    pub fn is_fatal(&self) -> bool {
        match self {
            MedflowError::Audit(_) => true,
            MedflowError::Store(e) => matches!(e, StoreError::Io { .. }),
            MedflowError::Io(_) => true,
            _ => false,
        }
    }

    /// True when the caller should reload and retry the operation.
    pub fn is_stale_write(&self) -> bool {
        matches!(self, MedflowError::Store(StoreError::StaleWrite { .. }))
    }
}

/// Structural problems found while validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Workflow '{definition}' has no steps")]
    EmptyDefinition { definition: String },

    #[error("Duplicate step ID: '{step_id}'")]
    DuplicateStepId { step_id: String },

    #[error("Step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    #[error("Cyclic dependency: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("Schema mismatch on step '{step_id}', field '{field}': {reason}")]
    SchemaMismatch {
        step_id: String,
        field: String,
        reason: String,
    },

    #[error("Step '{step_id}' has an invalid template reference: {reason}")]
    InvalidTemplateReference { step_id: String, reason: String },

    #[error("Step '{step_id}' has an invalid retry policy: {reason}")]
    InvalidRetryPolicy { step_id: String, reason: String },

    #[error("Failed to parse workflow definition: {message}")]
    ParseError { message: String },
}

/// Errors raised by the orchestrator's public operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Workflow instance not found: {instance_id}")]
    InstanceNotFound { instance_id: Uuid },

    #[error("Workflow definition not found: {definition_id} v{version}")]
    DefinitionNotFound { definition_id: String, version: u32 },

    #[error("Workflow instance {instance_id} is already {status}")]
    InstanceTerminated {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("Step '{step_id}' of instance {instance_id} is not awaiting input")]
    NotWaiting { instance_id: Uuid, step_id: String },

    #[error("Unknown step: '{step_id}'")]
    UnknownStep { step_id: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

/// Errors from a single step execution attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("Agent invocation failed: {0}")]
    Agent(#[from] AgentError),

    #[error("Handler '{handler}' failed: {message}")]
    HandlerFailed {
        handler: String,
        message: String,
        transient: bool,
    },

    #[error("No handler registered under '{handler}'")]
    UnknownHandler { handler: String },

    #[error("Output of step '{step_id}' violates its schema: {reason}")]
    OutputSchemaViolation { step_id: String, reason: String },

    #[error("Step '{step_id}' timed out after {timeout_ms}ms")]
    Timeout { step_id: String, timeout_ms: u64 },

    #[error("Prompt rendering failed for step '{step_id}': {message}")]
    Template { step_id: String, message: String },

    #[error("Step '{step_id}' was rejected by reviewer {reviewer}: {reason}")]
    ReviewRejected {
        step_id: String,
        reviewer: String,
        reason: String,
    },
}

impl StepError {
    /// Transient failures are retried per the step's retry policy.
    pub fn is_transient(&self) -> bool {
        match self {
            StepError::Agent(e) => e.is_transient(),
            StepError::HandlerFailed { transient, .. } => *transient,
            StepError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Stable machine-readable label for audit metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Agent(e) => e.kind(),
            StepError::HandlerFailed { .. } => "handler_failed",
            StepError::UnknownHandler { .. } => "unknown_handler",
            StepError::OutputSchemaViolation { .. } => "output_schema_violation",
            StepError::Timeout { .. } => "step_timeout",
            StepError::Template { .. } => "template_error",
            StepError::ReviewRejected { .. } => "review_rejected",
        }
    }
}

/// Errors returned by an AI model provider.
///
/// The transient kinds (timeout, rate limiting, unavailability) are worth
/// retrying. Everything else is permanent for the request as submitted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("Provider '{provider}' timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("Provider '{provider}' rate limited the request")]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Provider '{provider}' is unavailable: {message}")]
    Unavailable { provider: String, message: String },

    #[error("Provider '{provider}' rejected the input: {message}")]
    InvalidInput { provider: String, message: String },

    #[error("Provider '{provider}' refused the request: {message}")]
    Rejected { provider: String, message: String },

    #[error("Unknown provider: '{provider}'")]
    UnknownProvider { provider: String },

    #[error("Provider '{provider}' returned a malformed response: {message}")]
    MalformedResponse { provider: String, message: String },
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Timeout { .. }
                | AgentError::RateLimited { .. }
                | AgentError::Unavailable { .. }
        )
    }

    pub fn provider(&self) -> &str {
        match self {
            AgentError::Timeout { provider, .. }
            | AgentError::RateLimited { provider, .. }
            | AgentError::Unavailable { provider, .. }
            | AgentError::InvalidInput { provider, .. }
            | AgentError::Rejected { provider, .. }
            | AgentError::UnknownProvider { provider }
            | AgentError::MalformedResponse { provider, .. } => provider,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Timeout { .. } => "agent_timeout",
            AgentError::RateLimited { .. } => "agent_rate_limited",
            AgentError::Unavailable { .. } => "agent_unavailable",
            AgentError::InvalidInput { .. } => "agent_invalid_input",
            AgentError::Rejected { .. } => "agent_rejected",
            AgentError::UnknownProvider { .. } => "agent_unknown_provider",
            AgentError::MalformedResponse { .. } => "agent_malformed_response",
        }
    }
}

/// Errors from definition and instance persistence.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {key}")]
    NotFound { key: String },

    #[error("Already exists: {key}")]
    AlreadyExists { key: String },

    #[error("Stale write for instance {instance_id}: expected revision {expected}, found {actual}")]
    StaleWrite {
        instance_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Workflow '{definition_id}' v{version} is already published with different content")]
    VersionExists { definition_id: String, version: u32 },

    #[error("Storage IO failed: {message}")]
    Io { message: String },

    #[error("Stored record could not be (de)serialized: {message}")]
    Serialization { message: String },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization {
            message: e.to_string(),
        }
    }
}

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// A convenience type alias for Results using MedflowError.
pub type Result<T> = std::result::Result<T, MedflowError>;
