//! Per-run orchestration.
//!
//! One [`WorkflowInstance`] exists per cached run. Each activation is
//! processed as: initialize (first activation only), apply jobs in arrival
//! order, spawn the run method (first activation only), then alternate
//! draining the executor with condition sweeps until quiescent, and finally
//! flush the machine's output into a completion.

use crate::context::{ContextShared, WorkflowContext, WorkflowInfo};
use crate::converter::{FailureConverter, PayloadConverter};
use crate::error::WorkflowError;
use crate::executor::{CancelScope, CoopExecutor};
use crate::interceptor::{
    ExecuteWorkflowInput, HandleQueryInput, HandleSignalInput, HandleUpdateInput, InboundStack,
    OutboundStack, inbound_chain, inbound_sync_chain,
};
use crate::registry::{
    DynWorkflow, METADATA_QUERY_TYPE, WorkflowRegistration, workflow_metadata,
};
use capstan_machine::machine::{ActivationOutcome, WorkflowMachine};
use capstan_types::activation::{ActivationJob, InitializeWorkflow, WorkflowActivation};
use capstan_types::command::{
    ContinueAsNewWorkflowExecution, QueryResult, QueryResultVariant, UpdateResponse,
    UpdateResponseVariant, WorkflowCommand,
};
use capstan_types::completion::WorkflowActivationCompletion;
use capstan_types::failure::TemporalFailure;
use capstan_types::payload::Payload;
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, info_span, warn};

/// Reports a finished top-level task (the run method, a signal handler, or
/// an update handler) into the state machine.
struct TaskReporter {
    machine: Rc<RefCell<WorkflowMachine>>,
    failures: Rc<FailureConverter>,
    default_workflow_type: String,
    cancel_requested: Rc<Cell<bool>>,
}

impl TaskReporter {
    fn continue_as_new_attrs(
        &self,
        error: crate::error::ContinueAsNewError,
    ) -> ContinueAsNewWorkflowExecution {
        ContinueAsNewWorkflowExecution {
            workflow_type: error
                .workflow_type
                .unwrap_or_else(|| self.default_workflow_type.clone()),
            task_queue: error.task_queue,
            arguments: error.arguments,
            headers: error.headers,
            memo: error.memo,
            search_attributes: error.search_attributes,
            retry_policy: error.retry_policy,
            workflow_run_timeout: error.workflow_run_timeout,
            workflow_task_timeout: error.workflow_task_timeout,
        }
    }

    /// Top-level categorization shared by the run method and signal
    /// handlers: continue-as-new finishes the run, temporal failures fail
    /// the workflow, anything else fails the workflow task.
    fn report_run_outcome(&self, result: Result<Option<Payload>, WorkflowError>) {
        let mut machine = self.machine.borrow_mut();
        match result {
            Ok(result) => machine.workflow_completed(result),
            Err(WorkflowError::ContinueAsNew(error)) => {
                machine.continue_as_new(self.continue_as_new_attrs(error));
            }
            Err(WorkflowError::Canceled(_)) if self.cancel_requested.get() => {
                machine.workflow_cancellation_acknowledged();
            }
            Err(WorkflowError::RemovedFromCache) => {}
            Err(error) if error.is_temporal_failure() => {
                machine.workflow_failed(self.failures.to_failure(&error));
            }
            Err(error) => {
                machine.workflow_task_failed(self.failures.to_failure(&error));
            }
        }
    }

    fn report_signal_outcome(&self, result: Result<(), WorkflowError>) {
        let mut machine = self.machine.borrow_mut();
        match result {
            Ok(()) => {}
            Err(WorkflowError::ContinueAsNew(error)) => {
                machine.continue_as_new(self.continue_as_new_attrs(error));
            }
            // The run method owns acknowledging a requested cancellation.
            Err(WorkflowError::Canceled(_)) if self.cancel_requested.get() => {}
            Err(WorkflowError::RemovedFromCache) => {}
            Err(error) if error.is_temporal_failure() => {
                machine.workflow_failed(self.failures.to_failure(&error));
            }
            Err(error) => {
                machine.workflow_task_failed(self.failures.to_failure(&error));
            }
        }
    }

    fn report_update_outcome(
        &self,
        update_id: String,
        result: Result<Option<Payload>, WorkflowError>,
    ) {
        let mut machine = self.machine.borrow_mut();
        let response = match result {
            Ok(result) => UpdateResponseVariant::Completed { result },
            Err(WorkflowError::ContinueAsNew(error)) => {
                machine.continue_as_new(self.continue_as_new_attrs(error));
                UpdateResponseVariant::Completed { result: None }
            }
            Err(WorkflowError::RemovedFromCache) => return,
            Err(error @ WorkflowError::IllegalWorkflowState { .. }) => {
                machine.workflow_task_failed(self.failures.to_failure(&error));
                return;
            }
            Err(error) if error.is_temporal_failure() => UpdateResponseVariant::Rejected {
                failure: self.failures.to_failure(&error),
            },
            Err(error) => {
                machine.workflow_task_failed(self.failures.to_failure(&error));
                return;
            }
        };
        machine.append_command(WorkflowCommand::UpdateResponse(UpdateResponse {
            protocol_instance_id: update_id,
            response,
        }));
    }
}

pub struct WorkflowInstance {
    run_id: String,
    machine: Rc<RefCell<WorkflowMachine>>,
    executor: CoopExecutor,
    registration: Rc<WorkflowRegistration>,
    payload_converter: Rc<PayloadConverter>,
    failure_converter: Rc<FailureConverter>,
    inbound: InboundStack,
    outbound: OutboundStack,
    root_scope: CancelScope,
    cancel_requested: Rc<Cell<bool>>,
    /// Present once the initialize job has been applied successfully.
    shared: Option<Rc<ContextShared>>,
    workflow: Option<DynWorkflow>,
    init_arguments: Vec<Payload>,
    init_headers: BTreeMap<String, Payload>,
    run_started: bool,
    init_failed: bool,
    evicted: bool,
}

impl WorkflowInstance {
    pub fn new(
        registration: Rc<WorkflowRegistration>,
        run_id: impl Into<String>,
        payload_converter: Rc<PayloadConverter>,
        failure_converter: Rc<FailureConverter>,
        inbound: InboundStack,
        outbound: OutboundStack,
    ) -> Self {
        let run_id = run_id.into();
        Self {
            machine: Rc::new(RefCell::new(WorkflowMachine::new(run_id.clone()))),
            run_id,
            executor: CoopExecutor::new(),
            registration,
            payload_converter,
            failure_converter,
            inbound,
            outbound,
            root_scope: CancelScope::new_root(),
            cancel_requested: Rc::new(Cell::new(false)),
            shared: None,
            workflow: None,
            init_arguments: Vec::new(),
            init_headers: BTreeMap::new(),
            run_started: false,
            init_failed: false,
            evicted: false,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Process one activation batch and produce its completion.
    pub fn activate(&mut self, activation: WorkflowActivation) -> WorkflowActivationCompletion {
        let run_id = activation.run_id.clone();
        let span = info_span!("activation", run_id = %run_id);
        let _entered = span.enter();

        if self.evicted {
            return WorkflowActivationCompletion::success(run_id, Vec::new());
        }
        self.machine.borrow_mut().begin_activation(&activation);

        if self.shared.is_none()
            && !matches!(
                activation.jobs.first(),
                Some(ActivationJob::InitializeWorkflow(_))
                    | Some(ActivationJob::RemoveFromCache { .. })
            )
        {
            return WorkflowActivationCompletion::fail(
                run_id,
                TemporalFailure::application(
                    "expected InitializeWorkflow as the first job of the first activation",
                    "InvalidActivation",
                ),
            );
        }

        let mut evict_message = None;
        // Queries answer against the state left by every other job in the
        // batch, so they are held back until the executor has gone quiet.
        let mut deferred_queries = Vec::new();
        for job in activation.jobs {
            debug!(job = job.name(), "applying job");
            match job {
                ActivationJob::RemoveFromCache { message } => {
                    evict_message = Some(message);
                    break;
                }
                ActivationJob::QueryWorkflow {
                    query_id,
                    query_type,
                    arguments,
                    headers,
                } => deferred_queries.push((query_id, query_type, arguments, headers)),
                job => {
                    self.apply_job(job);
                    if self.init_failed {
                        break;
                    }
                }
            }
        }

        if let Some(message) = evict_message {
            self.evict(&message);
            return WorkflowActivationCompletion::success(run_id, Vec::new());
        }

        if !self.init_failed {
            if !self.run_started && self.shared.is_some() {
                self.spawn_run_task();
                self.run_started = true;
            }
            self.drain_and_sweep();
            for (query_id, query_type, arguments, headers) in deferred_queries {
                self.handle_query(query_id, query_type, arguments, headers);
            }
        }

        match self.machine.borrow_mut().drain_commands() {
            Ok(ActivationOutcome::SendCommands(commands)) => {
                WorkflowActivationCompletion::success(run_id, commands)
            }
            Ok(ActivationOutcome::FailActivation(failure)) => {
                WorkflowActivationCompletion::fail(run_id, failure)
            }
            Err(err) => WorkflowActivationCompletion::fail(
                run_id,
                TemporalFailure::application(err.to_string(), "InternalError"),
            ),
        }
    }

    /// Force-wake every outstanding wait with the removed-from-cache error,
    /// cancel all tasks, and let them unwind once. Nothing produced during
    /// the unwind reaches the server.
    pub fn evict(&mut self, message: &str) {
        debug!(run_id = %self.run_id, reason = %message, "evicting workflow run");
        self.machine.borrow_mut().evict();
        self.root_scope.cancel();
        self.executor.run_until_stalled();
        self.evicted = true;
    }

    fn apply_job(&mut self, job: ActivationJob) {
        match job {
            ActivationJob::InitializeWorkflow(init) => self.initialize(init),
            ActivationJob::FireTimer { seq } => self.machine.borrow_mut().fire_timer(seq),
            ActivationJob::ResolveActivity { seq, result } => {
                self.machine.borrow_mut().resolve_activity(seq, result);
            }
            ActivationJob::ResolveChildWorkflowStart { seq, status } => {
                self.machine
                    .borrow_mut()
                    .resolve_child_workflow_start(seq, status);
            }
            ActivationJob::ResolveChildWorkflowResult { seq, result } => {
                self.machine
                    .borrow_mut()
                    .resolve_child_workflow_result(seq, result);
            }
            ActivationJob::ResolveSignalExternalWorkflow { seq, failure } => {
                self.machine
                    .borrow_mut()
                    .resolve_signal_external_workflow(seq, failure);
            }
            ActivationJob::SignalWorkflow {
                signal_name,
                input,
                headers,
            } => self.dispatch_signal(signal_name, input, headers),
            // Queries are deferred by the activation loop.
            ActivationJob::QueryWorkflow { .. } => {}
            ActivationJob::DoUpdate {
                id,
                name,
                input,
                headers,
                run_validator,
            } => self.handle_update(id, name, input, headers, run_validator),
            ActivationJob::NotifyHasPatch { patch_id } => {
                self.machine.borrow_mut().notify_has_patch(&patch_id);
            }
            ActivationJob::UpdateRandomSeed { randomness_seed } => {
                self.machine.borrow_mut().reseed(randomness_seed);
            }
            ActivationJob::CancelWorkflow { reason } => {
                debug!(reason = %reason, "cancelling workflow");
                self.cancel_requested.set(true);
                self.root_scope.cancel();
            }
            // Handled by the activation loop before dispatch.
            ActivationJob::RemoveFromCache { .. } => {}
        }
    }

    fn initialize(&mut self, init: InitializeWorkflow) {
        if self.shared.is_some() {
            warn!(run_id = %self.run_id, "ignoring repeated InitializeWorkflow job");
            return;
        }
        self.machine.borrow_mut().initialize(&init);
        let info = Rc::new(WorkflowInfo {
            workflow_type: init.workflow_type,
            workflow_id: init.workflow_id,
            run_id: self.run_id.clone(),
            namespace: init.namespace,
            task_queue: init.task_queue,
            attempt: init.attempt,
            headers: init.headers.clone(),
            cron_schedule: init.cron_schedule,
            continued_from_execution_run_id: init.continued_from_execution_run_id,
            retry_policy: init.retry_policy,
            workflow_execution_timeout: init.workflow_execution_timeout,
            workflow_run_timeout: init.workflow_run_timeout,
            workflow_task_timeout: init.workflow_task_timeout,
            start_time: init.start_time,
        });
        let shared = Rc::new(ContextShared {
            machine: self.machine.clone(),
            executor: self.executor.clone(),
            payload_converter: self.payload_converter.clone(),
            failure_converter: self.failure_converter.clone(),
            inbound: self.inbound.clone(),
            outbound: self.outbound.clone(),
            info,
        });
        let ctx = WorkflowContext::new(shared.clone(), self.root_scope.child());

        self.machine.borrow_mut().freeze("the workflow is initializing");
        let created = (self.registration.factory)(&ctx, &init.arguments);
        self.machine.borrow_mut().thaw();

        match created {
            Ok(workflow) => {
                self.workflow = Some(workflow);
                self.shared = Some(shared);
                self.init_arguments = init.arguments;
                self.init_headers = init.headers;
            }
            Err(error) => {
                debug!(run_id = %self.run_id, %error, "workflow initialization failed");
                self.machine
                    .borrow_mut()
                    .workflow_task_failed(self.failure_converter.to_failure(&error));
                self.init_failed = true;
            }
        }
    }

    fn reporter(&self) -> TaskReporter {
        TaskReporter {
            machine: self.machine.clone(),
            failures: self.failure_converter.clone(),
            default_workflow_type: self.registration.name.clone(),
            cancel_requested: self.cancel_requested.clone(),
        }
    }

    /// Spawn the primary run method under the inbound interceptor chain.
    /// The surface is frozen around the chain entry and thawed only inside
    /// the terminal call into user code.
    fn spawn_run_task(&mut self) {
        let (Some(shared), Some(workflow)) = (self.shared.clone(), self.workflow.clone()) else {
            return;
        };
        let ctx = WorkflowContext::new(shared, self.root_scope.child());
        let run = self.registration.run.clone();
        let machine = self.machine.clone();
        let reporter = self.reporter();

        let input = ExecuteWorkflowInput {
            workflow_type: self.registration.name.clone(),
            headers: self.init_headers.clone(),
            arguments: self.init_arguments.clone(),
        };

        let terminal_ctx = ctx.clone();
        let terminal_machine = machine.clone();
        let terminal = move |_input: ExecuteWorkflowInput| {
            let run = run.clone();
            let workflow = workflow.clone();
            let ctx = terminal_ctx.clone();
            let machine = terminal_machine.clone();
            async move {
                machine.borrow_mut().thaw();
                let output = run(workflow, ctx).await;
                machine.borrow_mut().freeze("inbound interceptors are running");
                output
            }
            .boxed_local()
        };
        let chain_ctx = ctx.clone();
        let chain = inbound_chain(self.inbound.clone(), terminal, move |layer, input, next| {
            layer.execute_workflow(chain_ctx.clone(), input, next)
        });

        self.executor.spawn(async move {
            machine
                .borrow_mut()
                .freeze("inbound interceptors are running");
            let result = chain.run(input).await;
            machine.borrow_mut().thaw();
            reporter.report_run_outcome(result);
        });
    }

    fn dispatch_signal(
        &mut self,
        signal_name: String,
        input: Vec<Payload>,
        headers: BTreeMap<String, Payload>,
    ) {
        let (Some(shared), Some(workflow)) = (self.shared.clone(), self.workflow.clone()) else {
            warn!(signal = %signal_name, "dropping signal delivered before initialization");
            return;
        };
        let Some(definition) = self.registration.signal(&signal_name) else {
            // Unknown signals are dropped, not failed: a later deploy may
            // add the handler and replay will deliver it again.
            warn!(signal = %signal_name, "dropping signal with no registered handler");
            return;
        };
        let handler = definition.handler.clone();
        let ctx = WorkflowContext::new(shared, self.root_scope.child());
        let machine = self.machine.clone();
        let reporter = self.reporter();

        machine.borrow_mut().handler_dispatched();

        let terminal_ctx = ctx.clone();
        let terminal_machine = machine.clone();
        let terminal = move |input: HandleSignalInput| {
            let handler = handler.clone();
            let workflow = workflow.clone();
            let ctx = terminal_ctx.clone();
            let machine = terminal_machine.clone();
            async move {
                machine.borrow_mut().thaw();
                let output = handler(workflow, ctx, input.input).await;
                machine.borrow_mut().freeze("inbound interceptors are running");
                output
            }
            .boxed_local()
        };
        let chain_ctx = ctx.clone();
        let chain = inbound_chain(self.inbound.clone(), terminal, move |layer, input, next| {
            layer.handle_signal(chain_ctx.clone(), input, next)
        });

        let job = HandleSignalInput {
            signal_name,
            input,
            headers,
        };
        self.executor.spawn(async move {
            machine
                .borrow_mut()
                .freeze("inbound interceptors are running");
            let result = chain.run(job).await;
            {
                let mut machine = machine.borrow_mut();
                machine.thaw();
                machine.handler_returned();
            }
            reporter.report_signal_outcome(result);
        });
    }

    fn handle_query(
        &mut self,
        query_id: String,
        query_type: String,
        arguments: Vec<Payload>,
        headers: BTreeMap<String, Payload>,
    ) {
        let (Some(shared), Some(workflow)) = (self.shared.clone(), self.workflow.clone()) else {
            self.machine
                .borrow_mut()
                .workflow_task_failed(TemporalFailure::application(
                    "query received before workflow initialization",
                    "InvalidActivation",
                ));
            return;
        };

        if query_type == METADATA_QUERY_TYPE {
            self.respond_metadata_query(query_id);
            return;
        }

        let Some(definition) = self.registration.query(&query_type) else {
            let known = self.registration.sorted_query_names().join(", ");
            self.machine
                .borrow_mut()
                .workflow_task_failed(TemporalFailure::application(
                    format!("unknown query type `{query_type}`; known queries: [{known}]"),
                    "UnknownQueryType",
                ));
            return;
        };
        let handler = definition.handler.clone();
        let ctx = WorkflowContext::new(shared, self.root_scope.child());

        let terminal_ctx = ctx.clone();
        let terminal = move |input: HandleQueryInput| {
            handler(workflow.clone(), terminal_ctx.clone(), input.arguments)
        };
        let chain_ctx = ctx.clone();
        let chain =
            inbound_sync_chain(self.inbound.clone(), terminal, move |layer, input, next| {
                layer.handle_query(chain_ctx.clone(), input, next)
            });

        self.machine
            .borrow_mut()
            .freeze("a query handler is running");
        let result = chain.run(HandleQueryInput {
            query_id: query_id.clone(),
            query_type,
            arguments,
            headers,
        });
        self.machine.borrow_mut().thaw();

        let mut machine = self.machine.borrow_mut();
        match result {
            Ok(response) => {
                machine.append_command(WorkflowCommand::RespondToQuery(QueryResult {
                    query_id,
                    variant: QueryResultVariant::Succeeded { response },
                }));
            }
            Err(error @ WorkflowError::IllegalWorkflowState { .. }) => {
                machine.workflow_task_failed(self.failure_converter.to_failure(&error));
            }
            Err(error) => {
                machine.append_command(WorkflowCommand::RespondToQuery(QueryResult {
                    query_id,
                    variant: QueryResultVariant::Failed {
                        failure: self.failure_converter.to_failure(&error),
                    },
                }));
            }
        }
    }

    fn respond_metadata_query(&mut self, query_id: String) {
        let current_details = self.machine.borrow().current_details().to_string();
        let metadata = workflow_metadata(&self.registration, current_details);
        let mut machine = self.machine.borrow_mut();
        let variant = match self.payload_converter.to_payload(&metadata) {
            Ok(payload) => QueryResultVariant::Succeeded {
                response: Some(payload),
            },
            Err(error) => QueryResultVariant::Failed {
                failure: self.failure_converter.to_failure(&error),
            },
        };
        machine.append_command(WorkflowCommand::RespondToQuery(QueryResult {
            query_id,
            variant,
        }));
    }

    fn handle_update(
        &mut self,
        id: String,
        name: String,
        input: Vec<Payload>,
        headers: BTreeMap<String, Payload>,
        run_validator: bool,
    ) {
        let (Some(shared), Some(workflow)) = (self.shared.clone(), self.workflow.clone()) else {
            self.machine
                .borrow_mut()
                .workflow_task_failed(TemporalFailure::application(
                    "update received before workflow initialization",
                    "InvalidActivation",
                ));
            return;
        };
        let Some(definition) = self.registration.update(&name) else {
            let known = self.registration.sorted_update_names().join(", ");
            self.machine
                .borrow_mut()
                .workflow_task_failed(TemporalFailure::application(
                    format!("unknown update `{name}`; known updates: [{known}]"),
                    "UnknownUpdate",
                ));
            return;
        };
        let handler = definition.handler.clone();
        let validator = definition.validator.clone();

        let job = HandleUpdateInput {
            id: id.clone(),
            name,
            input,
            headers,
        };

        if run_validator {
            if let Some(validator) = validator {
                let ctx = WorkflowContext::new(shared.clone(), self.root_scope.child());
                let validate_workflow = workflow.clone();
                let terminal_ctx = ctx.clone();
                let terminal = move |input: HandleUpdateInput| {
                    validator(validate_workflow.clone(), terminal_ctx.clone(), input.input)
                };
                let chain_ctx = ctx.clone();
                let chain = inbound_sync_chain(
                    self.inbound.clone(),
                    terminal,
                    move |layer, input, next| layer.validate_update(chain_ctx.clone(), input, next),
                );

                self.machine
                    .borrow_mut()
                    .freeze("an update validator is running");
                let validation = chain.run(job.clone());
                self.machine.borrow_mut().thaw();

                match validation {
                    Ok(()) => {}
                    Err(error @ WorkflowError::IllegalWorkflowState { .. }) => {
                        self.machine
                            .borrow_mut()
                            .workflow_task_failed(self.failure_converter.to_failure(&error));
                        return;
                    }
                    Err(error) => {
                        self.machine.borrow_mut().append_command(
                            WorkflowCommand::UpdateResponse(UpdateResponse {
                                protocol_instance_id: id,
                                response: UpdateResponseVariant::Rejected {
                                    failure: self.failure_converter.to_failure(&error),
                                },
                            }),
                        );
                        return;
                    }
                }
            }
        }

        self.machine
            .borrow_mut()
            .append_command(WorkflowCommand::UpdateResponse(UpdateResponse {
                protocol_instance_id: id.clone(),
                response: UpdateResponseVariant::Accepted,
            }));

        let ctx = WorkflowContext::new(shared, self.root_scope.child());
        let machine = self.machine.clone();
        let reporter = self.reporter();

        machine.borrow_mut().handler_dispatched();

        let terminal_ctx = ctx.clone();
        let terminal_machine = machine.clone();
        let terminal = move |input: HandleUpdateInput| {
            let handler = handler.clone();
            let workflow = workflow.clone();
            let ctx = terminal_ctx.clone();
            let machine = terminal_machine.clone();
            async move {
                machine.borrow_mut().thaw();
                let output = handler(workflow, ctx, input.input).await;
                machine.borrow_mut().freeze("inbound interceptors are running");
                output
            }
            .boxed_local()
        };
        let chain_ctx = ctx.clone();
        let chain = inbound_chain(self.inbound.clone(), terminal, move |layer, input, next| {
            layer.handle_update(chain_ctx.clone(), input, next)
        });

        self.executor.spawn(async move {
            machine
                .borrow_mut()
                .freeze("inbound interceptors are running");
            let result = chain.run(job).await;
            {
                let mut machine = machine.borrow_mut();
                machine.thaw();
                machine.handler_returned();
            }
            reporter.report_update_outcome(id, result);
        });
    }

    /// Alternate executor drains with condition sweeps until no task is
    /// runnable and no registered predicate evaluates true.
    fn drain_and_sweep(&mut self) {
        loop {
            self.executor.run_until_stalled();
            if !self.sweep_conditions() {
                break;
            }
        }
    }

    /// Resume at most one condition: the earliest-registered satisfied
    /// predicate. The woken task observes the satisfying state before any
    /// peer is re-checked.
    fn sweep_conditions(&self) -> bool {
        let seqs = self.machine.borrow().condition_seqs();
        for seq in seqs {
            let Some(predicate) = self.machine.borrow().condition_predicate(seq) else {
                continue;
            };
            if predicate() {
                self.machine.borrow_mut().resolve_condition(seq);
                return true;
            }
        }
        false
    }
}
