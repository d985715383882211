use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Server-side retry behavior for activities and child workflows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Option<Duration>,
    /// 0 means unlimited.
    pub maximum_attempts: u32,
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Some(Duration::from_secs(100)),
            maximum_attempts: 0,
            non_retryable_error_types: Vec::new(),
        }
    }
}

/// How an activity cancellation request is reported back to the waiter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityCancellationType {
    /// Request cancellation and resolve as soon as the server records it.
    #[default]
    TryCancel,
    /// Request cancellation and wait for the activity to acknowledge it.
    WaitCancellationCompleted,
    /// Drop the activity without telling the server.
    Abandon,
}

/// What happens to a child when its parent closes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentClosePolicy {
    #[default]
    Terminate,
    RequestCancel,
    Abandon,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowIdReusePolicy {
    #[default]
    AllowDuplicate,
    AllowDuplicateFailedOnly,
    RejectDuplicate,
    TerminateIfRunning,
}

/// How cancelling a pending child workflow behaves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildWorkflowCancellationType {
    Abandon,
    TryCancel,
    #[default]
    WaitCancellationCompleted,
    WaitCancellationRequested,
}

/// Options for scheduling a remote activity.
///
/// The server requires at least one of `schedule_to_close_timeout` or
/// `start_to_close_timeout`; violations are reported by the server when the
/// command is processed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Defaults to the sequence number when unset.
    pub activity_id: Option<String>,
    /// Defaults to the workflow's task queue when unset.
    pub task_queue: Option<String>,
    pub schedule_to_close_timeout: Option<Duration>,
    pub schedule_to_start_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub cancellation_type: ActivityCancellationType,
}

/// Options for scheduling a local activity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalActivityOptions {
    pub schedule_to_close_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    /// Backoffs longer than this are sent back through the server as timers.
    pub local_retry_threshold: Option<Duration>,
    pub cancellation_type: ActivityCancellationType,
}

/// Options for starting a child workflow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildWorkflowOptions {
    /// Generated deterministically from the parent's RNG when unset.
    pub workflow_id: Option<String>,
    pub task_queue: Option<String>,
    pub workflow_execution_timeout: Option<Duration>,
    pub workflow_run_timeout: Option<Duration>,
    pub workflow_task_timeout: Option<Duration>,
    pub parent_close_policy: ParentClosePolicy,
    pub workflow_id_reuse_policy: WorkflowIdReusePolicy,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: Option<String>,
    pub memo: BTreeMap<String, Payload>,
    pub search_attributes: BTreeMap<String, Payload>,
    pub cancellation_type: ChildWorkflowCancellationType,
}
