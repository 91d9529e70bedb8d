//! Workflow definitions: versioned, immutable DAGs of typed steps.

pub mod builtins;
pub mod model;
pub mod parser;
pub mod retry;
pub mod schema;
pub mod store;
pub mod templates;
pub mod validation;

pub use model::{DefinitionRef, StepKind, StepSpec, WorkflowDefinition};
pub use parser::{load_definition_file, parse_definition, parse_definition_json};
pub use retry::{Backoff, RetryPolicy};
pub use schema::{FieldType, Schema};
pub use store::{DefinitionStore, InMemoryDefinitionStore, publish};
pub use validation::{topological_order, validate};
