use crate::command::WorkflowCommand;
use crate::failure::TemporalFailure;
use serde::{Deserialize, Serialize};

/// Result of processing one activation, returned to the bridge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowActivationCompletion {
    pub run_id: String,
    pub status: ActivationCompletionStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActivationCompletionStatus {
    /// The workflow task succeeded; `commands` advance the run.
    Completed { commands: Vec<WorkflowCommand> },
    /// The workflow task failed; the server will retry it.
    Failed { failure: TemporalFailure },
}

impl WorkflowActivationCompletion {
    pub fn success(run_id: impl Into<String>, commands: Vec<WorkflowCommand>) -> Self {
        Self {
            run_id: run_id.into(),
            status: ActivationCompletionStatus::Completed { commands },
        }
    }

    pub fn fail(run_id: impl Into<String>, failure: TemporalFailure) -> Self {
        Self {
            run_id: run_id.into(),
            status: ActivationCompletionStatus::Failed { failure },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ActivationCompletionStatus::Completed { .. })
    }

    /// The command list of a successful completion, empty on failure.
    pub fn commands(&self) -> &[WorkflowCommand] {
        match &self.status {
            ActivationCompletionStatus::Completed { commands } => commands,
            ActivationCompletionStatus::Failed { .. } => &[],
        }
    }
}
