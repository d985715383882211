use crate::failure::TemporalFailure;
use crate::options::{
    ActivityCancellationType, ChildWorkflowCancellationType, ParentClosePolicy, RetryPolicy,
    WorkflowIdReusePolicy,
};
use crate::payload::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartTimer {
    pub seq: u32,
    pub duration: Duration,
    /// Free-form label shown in the UI next to the timer.
    pub summary: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleActivity {
    pub seq: u32,
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: Option<String>,
    pub headers: BTreeMap<String, Payload>,
    pub arguments: Vec<Payload>,
    pub schedule_to_close_timeout: Option<Duration>,
    pub schedule_to_start_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub cancellation_type: ActivityCancellationType,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleLocalActivity {
    pub seq: u32,
    pub activity_id: String,
    pub activity_type: String,
    pub headers: BTreeMap<String, Payload>,
    pub arguments: Vec<Payload>,
    pub schedule_to_close_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    /// Carried across backoff re-schedules; 1 on first schedule.
    pub attempt: u32,
    /// Original schedule time, preserved across backoff re-schedules so
    /// schedule-to-close enforcement spans all attempts.
    pub original_schedule_time: Option<DateTime<Utc>>,
    pub cancellation_type: ActivityCancellationType,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartChildWorkflowExecution {
    pub seq: u32,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: Option<String>,
    pub input: Vec<Payload>,
    pub headers: BTreeMap<String, Payload>,
    pub memo: BTreeMap<String, Payload>,
    pub search_attributes: BTreeMap<String, Payload>,
    pub workflow_execution_timeout: Option<Duration>,
    pub workflow_run_timeout: Option<Duration>,
    pub workflow_task_timeout: Option<Duration>,
    pub parent_close_policy: ParentClosePolicy,
    pub workflow_id_reuse_policy: WorkflowIdReusePolicy,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: Option<String>,
    pub cancellation_type: ChildWorkflowCancellationType,
}

/// Target of an external signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SignalTarget {
    /// A child started by this workflow.
    ChildWorkflow { workflow_id: String },
    /// An arbitrary workflow execution.
    External {
        workflow_id: String,
        run_id: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalExternalWorkflowExecution {
    pub seq: u32,
    pub target: SignalTarget,
    pub signal_name: String,
    pub args: Vec<Payload>,
    pub headers: BTreeMap<String, Payload>,
}

/// Answer to a single query job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: String,
    pub variant: QueryResultVariant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QueryResultVariant {
    Succeeded { response: Option<Payload> },
    Failed { failure: TemporalFailure },
}

/// Progress report for one update request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {
    /// The update id carried by the originating `DoUpdate` job.
    pub protocol_instance_id: String,
    pub response: UpdateResponseVariant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum UpdateResponseVariant {
    Accepted,
    Rejected { failure: TemporalFailure },
    Completed { result: Option<Payload> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContinueAsNewWorkflowExecution {
    pub workflow_type: String,
    pub task_queue: Option<String>,
    pub arguments: Vec<Payload>,
    pub headers: BTreeMap<String, Payload>,
    pub memo: BTreeMap<String, Payload>,
    pub search_attributes: BTreeMap<String, Payload>,
    pub retry_policy: Option<RetryPolicy>,
    pub workflow_run_timeout: Option<Duration>,
    pub workflow_task_timeout: Option<Duration>,
}

/// An instruction for the bridge, produced while processing one activation.
///
/// The command buffer is append-only within an activation and flushed exactly
/// once into the completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkflowCommand {
    StartTimer(StartTimer),
    CancelTimer {
        seq: u32,
    },
    ScheduleActivity(ScheduleActivity),
    ScheduleLocalActivity(ScheduleLocalActivity),
    RequestCancelActivity {
        seq: u32,
    },
    RequestCancelLocalActivity {
        seq: u32,
    },
    StartChildWorkflowExecution(StartChildWorkflowExecution),
    CancelChildWorkflowExecution {
        child_workflow_seq: u32,
    },
    SignalExternalWorkflowExecution(SignalExternalWorkflowExecution),
    CancelSignalWorkflow {
        seq: u32,
    },
    RespondToQuery(QueryResult),
    UpdateResponse(UpdateResponse),
    SetPatchMarker {
        patch_id: String,
        deprecated: bool,
    },
    UpsertWorkflowSearchAttributes {
        search_attributes: BTreeMap<String, Payload>,
    },
    /// Memo patch; `None` values delete the key.
    ModifyWorkflowProperties {
        upserted_memo: BTreeMap<String, Option<Payload>>,
    },
    CompleteWorkflowExecution {
        result: Option<Payload>,
    },
    FailWorkflowExecution {
        failure: TemporalFailure,
    },
    CancelWorkflowExecution,
    ContinueAsNewWorkflowExecution(ContinueAsNewWorkflowExecution),
}

impl WorkflowCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartTimer(_) => "StartTimer",
            Self::CancelTimer { .. } => "CancelTimer",
            Self::ScheduleActivity(_) => "ScheduleActivity",
            Self::ScheduleLocalActivity(_) => "ScheduleLocalActivity",
            Self::RequestCancelActivity { .. } => "RequestCancelActivity",
            Self::RequestCancelLocalActivity { .. } => "RequestCancelLocalActivity",
            Self::StartChildWorkflowExecution(_) => "StartChildWorkflowExecution",
            Self::CancelChildWorkflowExecution { .. } => "CancelChildWorkflowExecution",
            Self::SignalExternalWorkflowExecution(_) => "SignalExternalWorkflowExecution",
            Self::CancelSignalWorkflow { .. } => "CancelSignalWorkflow",
            Self::RespondToQuery(_) => "RespondToQuery",
            Self::UpdateResponse(_) => "UpdateResponse",
            Self::SetPatchMarker { .. } => "SetPatchMarker",
            Self::UpsertWorkflowSearchAttributes { .. } => "UpsertWorkflowSearchAttributes",
            Self::ModifyWorkflowProperties { .. } => "ModifyWorkflowProperties",
            Self::CompleteWorkflowExecution { .. } => "CompleteWorkflowExecution",
            Self::FailWorkflowExecution { .. } => "FailWorkflowExecution",
            Self::CancelWorkflowExecution => "CancelWorkflowExecution",
            Self::ContinueAsNewWorkflowExecution(_) => "ContinueAsNewWorkflowExecution",
        }
    }

    /// Whether this command ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflowExecution { .. }
                | Self::FailWorkflowExecution { .. }
                | Self::CancelWorkflowExecution
                | Self::ContinueAsNewWorkflowExecution(_)
        )
    }
}
