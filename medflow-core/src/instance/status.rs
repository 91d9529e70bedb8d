use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    WaitingOnStep,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Allowed edges of the lifecycle graph:
    ///
    /// ```text
    /// pending -> running -> waiting_on_step -> running
    ///                    -> completed | failed
    /// any non-terminal   -> cancelled
    /// ```
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, WaitingOnStep | Completed | Failed) => true,
            (WaitingOnStep, Running) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Pending => write!(f, "pending"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::WaitingOnStep => write!(f, "waiting_on_step"),
            InstanceStatus::Completed => write!(f, "completed"),
            InstanceStatus::Failed => write!(f, "failed"),
            InstanceStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Never ran because a required upstream step failed.
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}
