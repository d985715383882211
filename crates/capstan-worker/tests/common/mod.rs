#![allow(dead_code)]

use capstan_types::activation::{ActivationJob, InitializeWorkflow, WorkflowActivation};
use capstan_types::command::WorkflowCommand;
use capstan_types::completion::{ActivationCompletionStatus, WorkflowActivationCompletion};
use capstan_types::payload::{ENCODING_JSON, Payload};
use capstan_worker::converter::{FailureConverter, PayloadConverter};
use capstan_worker::instance::WorkflowInstance;
use capstan_worker::interceptor::{WorkflowInboundInterceptor, WorkflowOutboundInterceptor};
use capstan_worker::registry::WorkflowRegistration;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::rc::Rc;

pub fn json_payload<T: Serialize>(value: &T) -> Payload {
    Payload::new(
        ENCODING_JSON,
        serde_json::to_vec(value).expect("test value serializes"),
    )
}

pub fn server_time(step: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, step).unwrap()
}

pub fn init_job(workflow_type: &str, arguments: Vec<Payload>) -> ActivationJob {
    ActivationJob::InitializeWorkflow(InitializeWorkflow {
        workflow_type: workflow_type.to_string(),
        workflow_id: format!("{workflow_type}-id"),
        namespace: "default".to_string(),
        task_queue: "tests".to_string(),
        arguments,
        headers: BTreeMap::new(),
        randomness_seed: 4242,
        memo: BTreeMap::new(),
        search_attributes: BTreeMap::new(),
        retry_policy: None,
        attempt: 1,
        cron_schedule: None,
        continued_from_execution_run_id: None,
        workflow_execution_timeout: None,
        workflow_run_timeout: None,
        workflow_task_timeout: None,
        start_time: server_time(0),
    })
}

pub fn init_job_with_memo(
    workflow_type: &str,
    arguments: Vec<Payload>,
    memo: BTreeMap<String, Payload>,
) -> ActivationJob {
    match init_job(workflow_type, arguments) {
        ActivationJob::InitializeWorkflow(mut init) => {
            init.memo = memo;
            ActivationJob::InitializeWorkflow(init)
        }
        other => other,
    }
}

pub fn activation(run_id: &str, step: u32, jobs: Vec<ActivationJob>) -> WorkflowActivation {
    WorkflowActivation {
        run_id: run_id.to_string(),
        timestamp: server_time(step),
        is_replaying: false,
        history_length: step * 3 + 1,
        history_size_bytes: u64::from(step) * 100,
        continue_as_new_suggested: false,
        jobs,
    }
}

pub fn replaying_activation(
    run_id: &str,
    step: u32,
    jobs: Vec<ActivationJob>,
) -> WorkflowActivation {
    let mut activation = activation(run_id, step, jobs);
    activation.is_replaying = true;
    activation
}

pub fn instance_for(registration: WorkflowRegistration, run_id: &str) -> WorkflowInstance {
    instance_with_interceptors(registration, run_id, Vec::new(), Vec::new())
}

pub fn instance_with_interceptors(
    registration: WorkflowRegistration,
    run_id: &str,
    inbound: Vec<Rc<dyn WorkflowInboundInterceptor>>,
    outbound: Vec<Rc<dyn WorkflowOutboundInterceptor>>,
) -> WorkflowInstance {
    WorkflowInstance::new(
        Rc::new(registration),
        run_id,
        Rc::new(PayloadConverter::default()),
        Rc::new(FailureConverter),
        Rc::from(inbound),
        Rc::from(outbound),
    )
}

/// Unwrap a successful completion into its command batch.
pub fn commands_of(completion: WorkflowActivationCompletion) -> Vec<WorkflowCommand> {
    match completion.status {
        ActivationCompletionStatus::Completed { commands } => commands,
        ActivationCompletionStatus::Failed { failure } => {
            panic!("expected successful completion, got failure: {failure}")
        }
    }
}

/// Unwrap a failed completion's failure message.
pub fn failure_of(completion: WorkflowActivationCompletion) -> String {
    match completion.status {
        ActivationCompletionStatus::Failed { failure } => failure.message,
        ActivationCompletionStatus::Completed { commands } => {
            panic!("expected failed completion, got {} commands", commands.len())
        }
    }
}

pub fn command_names(commands: &[WorkflowCommand]) -> Vec<&'static str> {
    commands.iter().map(WorkflowCommand::name).collect()
}
