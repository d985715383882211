//! Author-facing error taxonomy.
//!
//! Workflow, signal, and update code returns [`WorkflowError`]. The instance
//! categorizes it at the top level: temporal-failure kinds finish the run
//! with a failure, continue-as-new finishes the run with a new execution,
//! and everything else fails the workflow task so the server retries it.

use capstan_types::options::RetryPolicy;
use capstan_types::payload::Payload;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub use capstan_types::failure::TimeoutType;

/// Business failure raised by workflow or activity code.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{error_type}: {message}")]
pub struct ApplicationError {
    pub message: String,
    pub error_type: String,
    pub non_retryable: bool,
    pub details: Vec<Payload>,
}

impl ApplicationError {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            non_retryable: false,
            details: Vec::new(),
        }
    }

    pub fn non_retryable(mut self) -> Self {
        self.non_retryable = true;
        self
    }
}

/// Cancellation propagated into workflow code. The message names what was
/// cancelled ("Wait condition cancelled", "Workflow execution canceled", ...).
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct CanceledError {
    pub message: String,
}

impl CanceledError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct TimeoutError {
    pub message: String,
    pub timeout_type: TimeoutType,
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct TerminatedError {
    pub message: String,
}

impl TerminatedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An activity finished unsuccessfully; `cause` is the underlying failure.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("activity {activity_type} failed")]
pub struct ActivityError {
    pub activity_type: String,
    pub activity_id: String,
    pub cause: Box<WorkflowError>,
}

/// A child workflow finished unsuccessfully; `cause` is the child's failure.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("child workflow {workflow_type} ({workflow_id}) failed")]
pub struct ChildWorkflowError {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: String,
    pub workflow_type: String,
    pub cause: Box<WorkflowError>,
}

/// Thrown (returned) by workflow code to finish the current run and start a
/// fresh one. Not a failure; the instance turns it into the continue-as-new
/// command.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("continue as new")]
pub struct ContinueAsNewError {
    /// Defaults to the current workflow type when `None`.
    pub workflow_type: Option<String>,
    pub task_queue: Option<String>,
    pub arguments: Vec<Payload>,
    pub memo: BTreeMap<String, Payload>,
    pub search_attributes: BTreeMap<String, Payload>,
    pub headers: BTreeMap<String, Payload>,
    pub retry_policy: Option<RetryPolicy>,
    pub workflow_run_timeout: Option<Duration>,
    pub workflow_task_timeout: Option<Duration>,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum WorkflowError {
    #[error(transparent)]
    Application(#[from] ApplicationError),
    #[error(transparent)]
    Canceled(#[from] CanceledError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Terminated(#[from] TerminatedError),
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error(transparent)]
    ChildWorkflow(#[from] ChildWorkflowError),
    #[error(transparent)]
    ContinueAsNew(#[from] ContinueAsNewError),

    /// A workflow with the requested id already exists.
    #[error("workflow already started: {workflow_id} ({workflow_type})")]
    WorkflowAlreadyStarted {
        workflow_id: String,
        workflow_type: String,
    },

    /// The author surface was used illegally, for example a mutating call in
    /// a frozen context. Always escalated to a workflow task failure.
    #[error("{message}")]
    IllegalWorkflowState { message: String },

    /// Payload encoding or decoding failed.
    #[error("payload conversion failed: {message}")]
    Conversion { message: String },

    /// The run was removed from the worker cache; outstanding waits unwind
    /// with this. Never reported to the server.
    #[error("workflow removed from cache")]
    RemovedFromCache,
}

impl WorkflowError {
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(ApplicationError::new(message, "ApplicationError"))
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalWorkflowState {
            message: message.into(),
        }
    }

    /// True for the kinds that map onto a wire-level failure. Everything
    /// else fails the workflow task instead of the workflow.
    pub fn is_temporal_failure(&self) -> bool {
        matches!(
            self,
            Self::Application(_)
                | Self::Canceled(_)
                | Self::Timeout(_)
                | Self::Terminated(_)
                | Self::Activity(_)
                | Self::ChildWorkflow(_)
        )
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }
}

impl From<capstan_machine::MachineError> for WorkflowError {
    fn from(err: capstan_machine::MachineError) -> Self {
        Self::IllegalWorkflowState {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporal_failure_classification() {
        assert!(WorkflowError::application("x").is_temporal_failure());
        assert!(WorkflowError::from(CanceledError::new("c")).is_temporal_failure());
        assert!(!WorkflowError::RemovedFromCache.is_temporal_failure());
        assert!(!WorkflowError::illegal_state("bad").is_temporal_failure());
        assert!(
            !WorkflowError::from(ContinueAsNewError {
                workflow_type: None,
                task_queue: None,
                arguments: vec![],
                memo: BTreeMap::new(),
                search_attributes: BTreeMap::new(),
                headers: BTreeMap::new(),
                retry_policy: None,
                workflow_run_timeout: None,
                workflow_task_timeout: None,
            })
            .is_temporal_failure()
        );
    }

    #[test]
    fn frozen_machine_error_becomes_illegal_state() {
        let err: WorkflowError = capstan_machine::MachineError::FrozenContext {
            api: "sleep",
            context: "a query handler is running",
        }
        .into();
        assert!(matches!(err, WorkflowError::IllegalWorkflowState { .. }));
    }
}
