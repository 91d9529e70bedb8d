//! Workflow instances: lifecycle status, event history, and persistence.

pub mod model;
pub mod status;
pub mod store;

pub use model::{EventRecord, InstanceEvent, StepFailure, StepResult, WorkflowInstance};
pub use status::{InstanceStatus, StepStatus};
pub use store::{FileInstanceStore, InMemoryInstanceStore, InstanceStore};
