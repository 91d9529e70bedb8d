//! # Medflow Core
//!
//! Workflow engine for clinical pipelines whose steps may call AI models.
//! Provides versioned workflow definitions, the instance state machine, the
//! orchestrator, a provider-agnostic AI agent client, and a fail-closed
//! audit log.

pub mod agent;
pub mod audit;
pub mod config;
pub mod definition;
pub mod error;
pub mod instance;
pub mod merkle;
pub mod orchestrator;
pub mod persistence;
pub mod redact;
pub mod registry;
pub mod types;

// Re-export commonly used types at the crate root.
pub use agent::{AgentClient, AgentRequest, AgentResponse, AgentUsage, ModelProvider};
pub use audit::{AuditEntry, AuditEventKind, AuditLog, AuditQuery};
pub use config::{MedflowConfig, load_config};
pub use definition::{DefinitionRef, DefinitionStore, StepKind, StepSpec, WorkflowDefinition};
pub use error::{
    AgentError, MedflowError, OrchestratorError, Result, StepError, StoreError, ValidationError,
};
pub use instance::{InstanceStatus, InstanceStore, StepResult, StepStatus, WorkflowInstance};
pub use orchestrator::{HumanInput, Orchestrator, ReviewDecision};
pub use registry::{StepContext, StepHandler, StepRegistry};
pub use types::{Actor, InstanceId};
