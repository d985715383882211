use crate::failure::TemporalFailure;
use crate::options::RetryPolicy;
use crate::payload::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A batch of jobs from the bridge advancing one workflow run.
///
/// Jobs are ordered as the server delivered them and must be applied in that
/// order. The header fields reflect the run at the moment this activation was
/// produced and stay fixed for the whole batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowActivation {
    pub run_id: String,
    /// Server time for this workflow task. Drives `Workflow.now`.
    pub timestamp: DateTime<Utc>,
    pub is_replaying: bool,
    pub history_length: u32,
    pub history_size_bytes: u64,
    pub continue_as_new_suggested: bool,
    pub jobs: Vec<ActivationJob>,
}

/// First job of the first activation for a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitializeWorkflow {
    pub workflow_type: String,
    pub workflow_id: String,
    pub namespace: String,
    pub task_queue: String,
    pub arguments: Vec<Payload>,
    pub headers: BTreeMap<String, Payload>,
    pub randomness_seed: u64,
    pub memo: BTreeMap<String, Payload>,
    pub search_attributes: BTreeMap<String, Payload>,
    pub retry_policy: Option<RetryPolicy>,
    /// 1-based attempt counter for this execution.
    pub attempt: u32,
    pub cron_schedule: Option<String>,
    pub continued_from_execution_run_id: Option<String>,
    pub workflow_execution_timeout: Option<Duration>,
    pub workflow_run_timeout: Option<Duration>,
    pub workflow_task_timeout: Option<Duration>,
    pub start_time: DateTime<Utc>,
}

/// Outcome of an activity reported by the bridge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActivityResolution {
    Completed {
        result: Option<Payload>,
    },
    Failed {
        failure: TemporalFailure,
    },
    Cancelled {
        failure: TemporalFailure,
    },
    /// Local activity retry whose backoff crossed the threshold. The waiter
    /// never sees this; the machine re-schedules with the carried attempt.
    Backoff {
        attempt: u32,
        backoff_duration: Duration,
        original_schedule_time: DateTime<Utc>,
    },
}

/// Outcome of a child workflow start request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChildWorkflowStartStatus {
    Succeeded {
        run_id: String,
    },
    /// A workflow with the chosen id already exists.
    AlreadyExists {
        workflow_id: String,
        workflow_type: String,
    },
    Cancelled {
        failure: TemporalFailure,
    },
}

/// Terminal outcome of a child workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChildWorkflowResult {
    Completed { result: Option<Payload> },
    Failed { failure: TemporalFailure },
    Cancelled { failure: TemporalFailure },
}

/// One unit of work inside an activation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActivationJob {
    InitializeWorkflow(InitializeWorkflow),
    FireTimer {
        seq: u32,
    },
    ResolveActivity {
        seq: u32,
        result: ActivityResolution,
    },
    ResolveChildWorkflowStart {
        seq: u32,
        status: ChildWorkflowStartStatus,
    },
    ResolveChildWorkflowResult {
        seq: u32,
        result: ChildWorkflowResult,
    },
    ResolveSignalExternalWorkflow {
        seq: u32,
        failure: Option<TemporalFailure>,
    },
    SignalWorkflow {
        signal_name: String,
        input: Vec<Payload>,
        headers: BTreeMap<String, Payload>,
    },
    QueryWorkflow {
        query_id: String,
        query_type: String,
        arguments: Vec<Payload>,
        headers: BTreeMap<String, Payload>,
    },
    DoUpdate {
        id: String,
        name: String,
        input: Vec<Payload>,
        headers: BTreeMap<String, Payload>,
        run_validator: bool,
    },
    NotifyHasPatch {
        patch_id: String,
    },
    UpdateRandomSeed {
        randomness_seed: u64,
    },
    CancelWorkflow {
        reason: String,
    },
    RemoveFromCache {
        message: String,
    },
}

impl ActivationJob {
    /// Variant name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitializeWorkflow(_) => "InitializeWorkflow",
            Self::FireTimer { .. } => "FireTimer",
            Self::ResolveActivity { .. } => "ResolveActivity",
            Self::ResolveChildWorkflowStart { .. } => "ResolveChildWorkflowStart",
            Self::ResolveChildWorkflowResult { .. } => "ResolveChildWorkflowResult",
            Self::ResolveSignalExternalWorkflow { .. } => "ResolveSignalExternalWorkflow",
            Self::SignalWorkflow { .. } => "SignalWorkflow",
            Self::QueryWorkflow { .. } => "QueryWorkflow",
            Self::DoUpdate { .. } => "DoUpdate",
            Self::NotifyHasPatch { .. } => "NotifyHasPatch",
            Self::UpdateRandomSeed { .. } => "UpdateRandomSeed",
            Self::CancelWorkflow { .. } => "CancelWorkflow",
            Self::RemoveFromCache { .. } => "RemoveFromCache",
        }
    }
}

impl WorkflowActivation {
    /// True when the only job is an eviction.
    pub fn is_only_eviction(&self) -> bool {
        self.jobs.len() == 1 && matches!(self.jobs[0], ActivationJob::RemoveFromCache { .. })
    }

    /// The eviction job's message, if one is present anywhere in the batch.
    pub fn eviction_reason(&self) -> Option<&str> {
        self.jobs.iter().find_map(|job| match job {
            ActivationJob::RemoveFromCache { message } => Some(message.as_str()),
            _ => None,
        })
    }
}
