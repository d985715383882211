use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which timeout fired for a `Timeout` failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutType {
    StartToClose,
    ScheduleToStart,
    ScheduleToClose,
    Heartbeat,
}

/// Typed detail attached to a [`TemporalFailure`].
///
/// The variant determines how the failure is reconstructed into a typed
/// error on the workflow side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureInfo {
    /// Business failure raised by workflow or activity code.
    Application {
        error_type: String,
        non_retryable: bool,
        details: Vec<Payload>,
    },
    /// Operation was cancelled.
    Canceled { details: Vec<Payload> },
    /// Execution was terminated from outside.
    Terminated,
    /// A server-enforced timeout elapsed.
    Timeout { timeout_type: TimeoutType },
    /// A child workflow finished unsuccessfully. The `cause` of the carrying
    /// failure holds the child's own failure.
    ChildWorkflowExecution {
        namespace: String,
        workflow_id: String,
        run_id: String,
        workflow_type: String,
    },
    /// An activity finished unsuccessfully. The `cause` holds the underlying
    /// failure reported by the activity.
    Activity {
        activity_type: String,
        activity_id: String,
    },
    /// Failure originating inside the server.
    Server { non_retryable: bool },
}

impl FailureInfo {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Application { .. } => "Application",
            Self::Canceled { .. } => "Canceled",
            Self::Terminated => "Terminated",
            Self::Timeout { .. } => "Timeout",
            Self::ChildWorkflowExecution { .. } => "ChildWorkflowExecution",
            Self::Activity { .. } => "Activity",
            Self::Server { .. } => "Server",
        }
    }
}

/// Wire-shape failure exchanged with the bridge.
///
/// Failures form a chain through `cause`; the outermost entry describes the
/// operation that surfaced the error, inner entries describe what went wrong
/// underneath it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalFailure {
    pub message: String,
    pub stack_trace: Option<String>,
    pub cause: Option<Box<TemporalFailure>>,
    pub info: FailureInfo,
}

impl TemporalFailure {
    pub fn application(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
            cause: None,
            info: FailureInfo::Application {
                error_type: error_type.into(),
                non_retryable: false,
                details: Vec::new(),
            },
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
            cause: None,
            info: FailureInfo::Canceled {
                details: Vec::new(),
            },
        }
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
            cause: None,
            info: FailureInfo::Terminated,
        }
    }

    pub fn timeout(message: impl Into<String>, timeout_type: TimeoutType) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
            cause: None,
            info: FailureInfo::Timeout { timeout_type },
        }
    }

    /// Attach the underlying failure. The last call wins.
    pub fn with_cause(mut self, cause: TemporalFailure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// True when this failure or any of its causes is a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self.info, FailureInfo::Canceled { .. })
            || self
                .cause
                .as_ref()
                .is_some_and(|cause| cause.is_canceled())
    }
}

impl fmt::Display for TemporalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.info.name(), self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TemporalFailure {}
