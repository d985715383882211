//! The author-facing workflow surface.
//!
//! [`WorkflowContext`] is a cheap-clone handle over the instance's state
//! machine, executor, converters, and interceptor stacks. Every side-effecting
//! call goes through the outbound interceptor chain and ends at the state
//! machine; read-only calls (`info`, `now`, `memo`, ...) never touch the
//! frozen check and are always permitted.
//!
//! Suspension points are exactly: `sleep`, activity execution, child start,
//! child result, external signals, condition waits, and `timeout` (a sleep
//! race). Each is implemented as a future over a resume token, with
//! cooperative cancellation through the context's [`CancelScope`].

use crate::converter::{FailureConverter, PayloadConverter};
use crate::error::{CanceledError, ContinueAsNewError, WorkflowError};
use crate::executor::{CancelScope, CoopExecutor, TaskHandle};
use crate::interceptor::{
    ExecuteActivityInput, ExecuteLocalActivityInput, InboundStack, OutboundStack,
    SignalExternalInput, SleepInput, StartChildWorkflowInput, outbound_chain,
    outbound_sync_chain,
};
use capstan_machine::machine::WorkflowMachine;
use capstan_machine::resume::{ResumeToken, Woken};
use capstan_types::activation::{ActivityResolution, ChildWorkflowResult, ChildWorkflowStartStatus};
use capstan_types::command::{
    ScheduleActivity, ScheduleLocalActivity, SignalExternalWorkflowExecution, SignalTarget,
    StartChildWorkflowExecution,
};
use capstan_types::failure::TemporalFailure;
use capstan_types::options::{ActivityOptions, ChildWorkflowOptions, LocalActivityOptions, RetryPolicy};
use capstan_types::payload::Payload;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{Either, LocalBoxFuture};
use rand::RngCore as _;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;
use uuid::Uuid;

/// Immutable facts about the execution, built from the initialize job.
#[derive(Clone, Debug)]
pub struct WorkflowInfo {
    pub workflow_type: String,
    pub workflow_id: String,
    pub run_id: String,
    pub namespace: String,
    pub task_queue: String,
    pub attempt: u32,
    pub headers: BTreeMap<String, Payload>,
    pub cron_schedule: Option<String>,
    pub continued_from_execution_run_id: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub workflow_execution_timeout: Option<Duration>,
    pub workflow_run_timeout: Option<Duration>,
    pub workflow_task_timeout: Option<Duration>,
    pub start_time: DateTime<Utc>,
}

pub(crate) struct ContextShared {
    pub(crate) machine: Rc<RefCell<WorkflowMachine>>,
    pub(crate) executor: CoopExecutor,
    pub(crate) payload_converter: Rc<PayloadConverter>,
    pub(crate) failure_converter: Rc<FailureConverter>,
    pub(crate) inbound: InboundStack,
    pub(crate) outbound: OutboundStack,
    pub(crate) info: Rc<WorkflowInfo>,
}

#[derive(Clone)]
pub struct WorkflowContext {
    pub(crate) shared: Rc<ContextShared>,
    pub(crate) scope: CancelScope,
}

fn decode_optional<R: DeserializeOwned>(
    converter: &PayloadConverter,
    payload: Option<Payload>,
) -> Result<R, WorkflowError> {
    match payload {
        Some(payload) => converter.from_payload(&payload),
        None => serde_json::from_value(serde_json::Value::Null)
            .map_err(|err| WorkflowError::conversion(err.to_string())),
    }
}

impl WorkflowContext {
    pub(crate) fn new(shared: Rc<ContextShared>, scope: CancelScope) -> Self {
        Self { shared, scope }
    }

    // ── Reads ──

    pub fn info(&self) -> &WorkflowInfo {
        &self.shared.info
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.shared.machine.borrow().now()
    }

    pub fn is_replaying(&self) -> bool {
        self.shared.machine.borrow().is_replaying()
    }

    pub fn history_length(&self) -> u32 {
        self.shared.machine.borrow().history_length()
    }

    pub fn history_size_bytes(&self) -> u64 {
        self.shared.machine.borrow().history_size_bytes()
    }

    pub fn continue_as_new_suggested(&self) -> bool {
        self.shared.machine.borrow().continue_as_new_suggested()
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.scope.is_cancelled()
    }

    pub fn current_details(&self) -> String {
        self.shared.machine.borrow().current_details().to_string()
    }

    pub fn set_current_details(&self, details: impl Into<String>) -> Result<(), WorkflowError> {
        self.shared
            .machine
            .borrow_mut()
            .set_current_details(details.into())
            .map_err(Into::into)
    }

    pub fn payload_converter(&self) -> &PayloadConverter {
        &self.shared.payload_converter
    }

    pub fn failure_converter(&self) -> &FailureConverter {
        &self.shared.failure_converter
    }

    /// Deterministic random value from the replay-stable generator.
    pub fn random(&self) -> u64 {
        self.shared.machine.borrow_mut().rng_mut().next()
    }

    /// Deterministic v4 UUID drawn from the workflow generator.
    pub fn uuid4(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.shared.machine.borrow_mut().rng_mut().fill(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    /// A `rand`-compatible handle over the deterministic generator, for use
    /// with standard distributions and shuffles.
    pub fn random_number_generator(&self) -> WorkflowRng {
        WorkflowRng {
            machine: self.shared.machine.clone(),
        }
    }

    pub fn memo_payloads(&self) -> BTreeMap<String, Payload> {
        self.shared.machine.borrow().memo().clone()
    }

    pub fn memo<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, WorkflowError> {
        match self.shared.machine.borrow().memo().get(key) {
            Some(payload) => Ok(Some(self.payload_converter().from_payload(payload)?)),
            None => Ok(None),
        }
    }

    pub fn search_attributes(&self) -> BTreeMap<String, Payload> {
        self.shared.machine.borrow().search_attributes().clone()
    }

    pub fn all_handlers_finished(&self) -> bool {
        self.shared.machine.borrow().all_handlers_finished()
    }

    pub fn logger(&self) -> WorkflowLogger {
        WorkflowLogger {
            run_id: self.shared.info.run_id.clone(),
            replaying: self.is_replaying(),
        }
    }

    // ── Mutations ──

    pub fn patch(&self, id: &str) -> Result<bool, WorkflowError> {
        self.shared
            .machine
            .borrow_mut()
            .patch(id, false)
            .map_err(Into::into)
    }

    pub fn deprecate_patch(&self, id: &str) -> Result<(), WorkflowError> {
        self.shared.machine.borrow_mut().patch(id, true)?;
        Ok(())
    }

    pub fn upsert_search_attributes<T: Serialize>(
        &self,
        delta: BTreeMap<String, T>,
    ) -> Result<(), WorkflowError> {
        let mut encoded = BTreeMap::new();
        for (key, value) in &delta {
            encoded.insert(key.clone(), self.payload_converter().to_payload(value)?);
        }
        self.shared
            .machine
            .borrow_mut()
            .upsert_search_attributes(encoded)
            .map_err(Into::into)
    }

    /// Merge into the memo; `None` deletes the key.
    pub fn upsert_memo<T: Serialize>(
        &self,
        delta: BTreeMap<String, Option<T>>,
    ) -> Result<(), WorkflowError> {
        let mut encoded = BTreeMap::new();
        for (key, value) in &delta {
            let payload = match value {
                Some(value) => Some(self.payload_converter().to_payload(value)?),
                None => None,
            };
            encoded.insert(key.clone(), payload);
        }
        self.shared
            .machine
            .borrow_mut()
            .upsert_memo(encoded)
            .map_err(Into::into)
    }

    // ── Suspension points ──

    pub fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, Result<(), WorkflowError>> {
        self.sleep_with_summary(duration, None)
    }

    pub fn sleep_with_summary(
        &self,
        duration: Duration,
        summary: Option<String>,
    ) -> LocalBoxFuture<'static, Result<(), WorkflowError>> {
        let machine = self.shared.machine.clone();
        let scope = self.scope.clone();
        let terminal = move |input: SleepInput| {
            let started = machine
                .borrow_mut()
                .start_timer(input.duration, input.summary);
            match started {
                Ok((seq, token)) => TimerFuture {
                    machine: machine.clone(),
                    scope: scope.clone(),
                    seq,
                    token,
                    finished: false,
                }
                .boxed_local(),
                Err(err) => futures::future::ready(Err(err.into())).boxed_local(),
            }
        };
        let ctx = self.clone();
        outbound_chain(self.shared.outbound.clone(), terminal, move |layer, input, next| {
            layer.handle_sleep(ctx.clone(), input, next)
        })
        .run(SleepInput { duration, summary })
    }

    pub fn execute_activity<A, R>(
        &self,
        activity_type: &str,
        arg: A,
        options: ActivityOptions,
    ) -> LocalBoxFuture<'static, Result<R, WorkflowError>>
    where
        A: Serialize,
        R: DeserializeOwned + 'static,
    {
        let arguments = match self.encode_argument(&arg) {
            Ok(arguments) => arguments,
            Err(err) => return futures::future::ready(Err(err)).boxed_local(),
        };
        let raw = self.execute_activity_raw(ExecuteActivityInput {
            activity_type: activity_type.to_string(),
            arguments,
            options,
            headers: BTreeMap::new(),
        });
        let converter = self.shared.payload_converter.clone();
        async move { decode_optional(&converter, raw.await?) }.boxed_local()
    }

    pub fn execute_activity_raw(
        &self,
        input: ExecuteActivityInput,
    ) -> LocalBoxFuture<'static, Result<Option<Payload>, WorkflowError>> {
        let machine = self.shared.machine.clone();
        let scope = self.scope.clone();
        let failures = self.shared.failure_converter.clone();
        let terminal = move |input: ExecuteActivityInput| {
            let attrs = ScheduleActivity {
                seq: 0,
                activity_id: input.options.activity_id.clone().unwrap_or_default(),
                activity_type: input.activity_type,
                task_queue: input.options.task_queue.clone(),
                headers: input.headers,
                arguments: input.arguments,
                schedule_to_close_timeout: input.options.schedule_to_close_timeout,
                schedule_to_start_timeout: input.options.schedule_to_start_timeout,
                start_to_close_timeout: input.options.start_to_close_timeout,
                heartbeat_timeout: input.options.heartbeat_timeout,
                retry_policy: input.options.retry_policy.clone(),
                cancellation_type: input.options.cancellation_type,
            };
            let scheduled = machine.borrow_mut().schedule_activity(attrs);
            match scheduled {
                Ok((seq, token)) => ActivityFuture {
                    machine: machine.clone(),
                    scope: scope.clone(),
                    failures: failures.clone(),
                    seq,
                    token,
                    cancel_requested: false,
                    finished: false,
                }
                .boxed_local(),
                Err(err) => futures::future::ready(Err(err.into())).boxed_local(),
            }
        };
        let ctx = self.clone();
        outbound_chain(self.shared.outbound.clone(), terminal, move |layer, input, next| {
            layer.execute_activity(ctx.clone(), input, next)
        })
        .run(input)
    }

    pub fn execute_local_activity<A, R>(
        &self,
        activity_type: &str,
        arg: A,
        options: LocalActivityOptions,
    ) -> LocalBoxFuture<'static, Result<R, WorkflowError>>
    where
        A: Serialize,
        R: DeserializeOwned + 'static,
    {
        let arguments = match self.encode_argument(&arg) {
            Ok(arguments) => arguments,
            Err(err) => return futures::future::ready(Err(err)).boxed_local(),
        };
        let raw = self.execute_local_activity_raw(ExecuteLocalActivityInput {
            activity_type: activity_type.to_string(),
            arguments,
            options,
            headers: BTreeMap::new(),
        });
        let converter = self.shared.payload_converter.clone();
        async move { decode_optional(&converter, raw.await?) }.boxed_local()
    }

    pub fn execute_local_activity_raw(
        &self,
        input: ExecuteLocalActivityInput,
    ) -> LocalBoxFuture<'static, Result<Option<Payload>, WorkflowError>> {
        let machine = self.shared.machine.clone();
        let scope = self.scope.clone();
        let failures = self.shared.failure_converter.clone();
        let terminal = move |input: ExecuteLocalActivityInput| {
            let attrs = ScheduleLocalActivity {
                seq: 0,
                activity_id: String::new(),
                activity_type: input.activity_type,
                headers: input.headers,
                arguments: input.arguments,
                schedule_to_close_timeout: input.options.schedule_to_close_timeout,
                start_to_close_timeout: input.options.start_to_close_timeout,
                retry_policy: input.options.retry_policy.clone(),
                attempt: 1,
                original_schedule_time: None,
                cancellation_type: input.options.cancellation_type,
            };
            let scheduled = machine.borrow_mut().schedule_local_activity(attrs);
            match scheduled {
                Ok((seq, token)) => ActivityFuture {
                    machine: machine.clone(),
                    scope: scope.clone(),
                    failures: failures.clone(),
                    seq,
                    token,
                    cancel_requested: false,
                    finished: false,
                }
                .boxed_local(),
                Err(err) => futures::future::ready(Err(err.into())).boxed_local(),
            }
        };
        let ctx = self.clone();
        outbound_chain(self.shared.outbound.clone(), terminal, move |layer, input, next| {
            layer.execute_local_activity(ctx.clone(), input, next)
        })
        .run(input)
    }

    pub fn start_child_workflow<A: Serialize>(
        &self,
        workflow_type: &str,
        arg: A,
        options: ChildWorkflowOptions,
    ) -> LocalBoxFuture<'static, Result<StartedChildWorkflow, WorkflowError>> {
        let arguments = match self.encode_argument(&arg) {
            Ok(arguments) => arguments,
            Err(err) => return futures::future::ready(Err(err)).boxed_local(),
        };
        self.start_child_workflow_raw(StartChildWorkflowInput {
            workflow_type: workflow_type.to_string(),
            arguments,
            options,
            headers: BTreeMap::new(),
        })
    }

    pub fn start_child_workflow_raw(
        &self,
        input: StartChildWorkflowInput,
    ) -> LocalBoxFuture<'static, Result<StartedChildWorkflow, WorkflowError>> {
        let ctx = self.clone();
        let terminal = move |input: StartChildWorkflowInput| {
            let ctx = ctx.clone();
            async move {
                // The id must be stable across replays, so an absent id is
                // drawn from the deterministic generator.
                let workflow_id = match &input.options.workflow_id {
                    Some(id) => id.clone(),
                    None => ctx.uuid4().to_string(),
                };
                let attrs = StartChildWorkflowExecution {
                    seq: 0,
                    workflow_id: workflow_id.clone(),
                    workflow_type: input.workflow_type,
                    task_queue: input.options.task_queue.clone(),
                    input: input.arguments,
                    headers: input.headers,
                    memo: input.options.memo.clone(),
                    search_attributes: input.options.search_attributes.clone(),
                    workflow_execution_timeout: input.options.workflow_execution_timeout,
                    workflow_run_timeout: input.options.workflow_run_timeout,
                    workflow_task_timeout: input.options.workflow_task_timeout,
                    parent_close_policy: input.options.parent_close_policy,
                    workflow_id_reuse_policy: input.options.workflow_id_reuse_policy,
                    retry_policy: input.options.retry_policy.clone(),
                    cron_schedule: input.options.cron_schedule.clone(),
                    cancellation_type: input.options.cancellation_type,
                };
                let started = ctx.shared.machine.borrow_mut().start_child_workflow(attrs);
                let (seq, start_token, result_token) = match started {
                    Ok(parts) => parts,
                    Err(err) => return Err(err.into()),
                };
                let status = ChildStartFuture { token: start_token }.await?;
                match status {
                    ChildWorkflowStartStatus::Succeeded { run_id } => Ok(StartedChildWorkflow {
                        workflow_id,
                        first_run_id: run_id,
                        seq,
                        ctx: ctx.clone(),
                        result_token: RefCell::new(Some(result_token)),
                    }),
                    ChildWorkflowStartStatus::AlreadyExists {
                        workflow_id,
                        workflow_type,
                    } => Err(WorkflowError::WorkflowAlreadyStarted {
                        workflow_id,
                        workflow_type,
                    }),
                    ChildWorkflowStartStatus::Cancelled { failure } => {
                        Err(ctx.shared.failure_converter.from_failure(&failure))
                    }
                }
            }
            .boxed_local()
        };
        let ctx = self.clone();
        outbound_chain(self.shared.outbound.clone(), terminal, move |layer, input, next| {
            layer.start_child_workflow(ctx.clone(), input, next)
        })
        .run(input)
    }

    /// Start a child and wait for its result.
    pub fn execute_child_workflow<A, R>(
        &self,
        workflow_type: &str,
        arg: A,
        options: ChildWorkflowOptions,
    ) -> LocalBoxFuture<'static, Result<R, WorkflowError>>
    where
        A: Serialize,
        R: DeserializeOwned + 'static,
    {
        let start = self.start_child_workflow(workflow_type, arg, options);
        async move { start.await?.result().await }.boxed_local()
    }

    pub fn signal_external_workflow<S: Serialize>(
        &self,
        workflow_id: &str,
        run_id: Option<String>,
        signal_name: &str,
        arg: S,
    ) -> LocalBoxFuture<'static, Result<(), WorkflowError>> {
        let args = match self.encode_argument(&arg) {
            Ok(args) => args,
            Err(err) => return futures::future::ready(Err(err)).boxed_local(),
        };
        self.signal_workflow_raw(SignalExternalInput {
            target: SignalTarget::External {
                workflow_id: workflow_id.to_string(),
                run_id,
            },
            signal_name: signal_name.to_string(),
            args,
            headers: BTreeMap::new(),
        })
    }

    pub(crate) fn signal_workflow_raw(
        &self,
        input: SignalExternalInput,
    ) -> LocalBoxFuture<'static, Result<(), WorkflowError>> {
        let machine = self.shared.machine.clone();
        let scope = self.scope.clone();
        let failures = self.shared.failure_converter.clone();
        let terminal = move |input: SignalExternalInput| {
            let attrs = SignalExternalWorkflowExecution {
                seq: 0,
                target: input.target,
                signal_name: input.signal_name,
                args: input.args,
                headers: input.headers,
            };
            let parked = machine.borrow_mut().signal_external_workflow(attrs);
            match parked {
                Ok((seq, token)) => ExternalSignalFuture {
                    machine: machine.clone(),
                    scope: scope.clone(),
                    failures: failures.clone(),
                    seq,
                    token,
                    finished: false,
                }
                .boxed_local(),
                Err(err) => futures::future::ready(Err(err.into())).boxed_local(),
            }
        };
        let ctx = self.clone();
        outbound_chain(self.shared.outbound.clone(), terminal, move |layer, input, next| {
            layer.signal_external_workflow(ctx.clone(), input, next)
        })
        .run(input)
    }

    /// Park until `predicate` is observed true by a condition sweep.
    ///
    /// Predicates must be pure with respect to the state machine; they are
    /// evaluated repeatedly and wake-ups are strictly one at a time.
    pub fn wait_condition(
        &self,
        predicate: impl Fn() -> bool + 'static,
    ) -> LocalBoxFuture<'static, Result<(), WorkflowError>> {
        let registered = self
            .shared
            .machine
            .borrow_mut()
            .register_condition(Rc::new(predicate));
        match registered {
            Ok((seq, token)) => ConditionFuture {
                machine: self.shared.machine.clone(),
                scope: self.scope.clone(),
                seq,
                token,
                finished: false,
            }
            .boxed_local(),
            Err(err) => futures::future::ready(Err(err.into())).boxed_local(),
        }
    }

    pub fn wait_all_handlers_finished(&self) -> LocalBoxFuture<'static, Result<(), WorkflowError>> {
        let machine = self.shared.machine.clone();
        self.wait_condition(move || machine.borrow().all_handlers_finished())
    }

    /// Run `body` against a deadline measured by a workflow timer.
    ///
    /// If the timer wins, the body task is cancelled and awaited before this
    /// returns, and the cancelled body's error propagates.
    pub fn timeout<T: 'static>(
        &self,
        duration: Duration,
        body: impl Future<Output = Result<T, WorkflowError>> + 'static,
    ) -> LocalBoxFuture<'static, Result<T, WorkflowError>> {
        let ctx = self.clone();
        async move {
            let body_scope = ctx.scope.child();
            let body_ctx_scope = body_scope.clone();
            let handle = ctx
                .shared
                .executor
                .spawn_with_handle(body, body_ctx_scope);
            let join = Box::pin(handle.join());
            let sleep = ctx.sleep(duration);
            match futures::future::select(join, sleep).await {
                // Dropping the sleep future cancels its timer.
                Either::Left((body_output, _sleep)) => body_output,
                Either::Right((_slept, join)) => {
                    body_scope.cancel();
                    join.await
                }
            }
        }
        .boxed_local()
    }

    /// Run `op` insulated from cancellation of the surrounding workflow, for
    /// cleanup work that must finish even while the run is being cancelled.
    pub fn with_cancellation_shield<F, Fut>(&self, op: F) -> Fut
    where
        F: FnOnce(WorkflowContext) -> Fut,
    {
        let shielded = WorkflowContext::new(self.shared.clone(), CancelScope::detached());
        op(shielded)
    }

    /// Spawn a task on the workflow executor. The task gets a child scope, so
    /// cancelling the workflow cancels it; `TaskHandle::cancel` cancels just
    /// this task.
    pub fn spawn<F, Fut>(&self, f: F) -> TaskHandle<Fut::Output>
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future + 'static,
        Fut::Output: 'static,
    {
        let child_scope = self.scope.child();
        let task_ctx = WorkflowContext::new(self.shared.clone(), child_scope.clone());
        self.shared.executor.spawn_with_handle(f(task_ctx), child_scope)
    }

    /// Draft a continue-as-new error carrying the encoded argument; pass it
    /// through [`Self::make_continue_as_new_error`] before returning it.
    pub fn continue_as_new_draft<A: Serialize>(
        &self,
        arg: A,
    ) -> Result<ContinueAsNewError, WorkflowError> {
        Ok(ContinueAsNewError {
            workflow_type: None,
            task_queue: None,
            arguments: self.encode_argument(&arg)?,
            memo: BTreeMap::new(),
            search_attributes: BTreeMap::new(),
            headers: BTreeMap::new(),
            retry_policy: None,
            workflow_run_timeout: None,
            workflow_task_timeout: None,
        })
    }

    /// Finalize a continue-as-new draft through the outbound chain.
    pub fn make_continue_as_new_error(&self, draft: ContinueAsNewError) -> WorkflowError {
        let ctx = self.clone();
        let finalized = outbound_sync_chain(
            self.shared.outbound.clone(),
            |draft: ContinueAsNewError| draft,
            move |layer, draft, next| layer.make_continue_as_new_error(ctx.clone(), draft, next),
        )
        .run(draft);
        WorkflowError::ContinueAsNew(finalized)
    }

    fn encode_argument<A: Serialize>(&self, arg: &A) -> Result<Vec<Payload>, WorkflowError> {
        Ok(match self.payload_converter().to_result_payload(arg)? {
            Some(payload) => vec![payload],
            None => Vec::new(),
        })
    }
}

/// Handle to a child workflow whose start has been acknowledged.
///
/// The result state is shared with the state machine and resolved exactly
/// once; awaiting the result a second time is an illegal-state error.
pub struct StartedChildWorkflow {
    pub workflow_id: String,
    pub first_run_id: String,
    seq: u32,
    ctx: WorkflowContext,
    result_token: RefCell<Option<ResumeToken<ChildWorkflowResult>>>,
}

impl StartedChildWorkflow {
    pub async fn result<R: DeserializeOwned + 'static>(&self) -> Result<R, WorkflowError> {
        let token = self
            .result_token
            .borrow_mut()
            .take()
            .ok_or_else(|| WorkflowError::illegal_state("child workflow result already awaited"))?;
        let raw = ChildResultFuture {
            machine: self.ctx.shared.machine.clone(),
            scope: self.ctx.scope.clone(),
            failures: self.ctx.shared.failure_converter.clone(),
            seq: self.seq,
            token,
            cancel_requested: false,
            finished: false,
        }
        .await?;
        decode_optional(&self.ctx.shared.payload_converter, raw)
    }

    pub fn signal<S: Serialize>(
        &self,
        signal_name: &str,
        arg: S,
    ) -> LocalBoxFuture<'static, Result<(), WorkflowError>> {
        let args = match self.ctx.encode_argument(&arg) {
            Ok(args) => args,
            Err(err) => return futures::future::ready(Err(err)).boxed_local(),
        };
        self.ctx.signal_workflow_raw(SignalExternalInput {
            target: SignalTarget::ChildWorkflow {
                workflow_id: self.workflow_id.clone(),
            },
            signal_name: signal_name.to_string(),
            args,
            headers: BTreeMap::new(),
        })
    }

    /// Request cancellation of the child through the server.
    pub fn cancel(&self) {
        self.ctx
            .shared
            .machine
            .borrow_mut()
            .cancel_child_workflow(self.seq);
    }
}

/// `rand::RngCore` adapter over the workflow's deterministic generator.
pub struct WorkflowRng {
    machine: Rc<RefCell<WorkflowMachine>>,
}

impl rand::RngCore for WorkflowRng {
    fn next_u32(&mut self) -> u32 {
        self.machine.borrow_mut().rng_mut().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.machine.borrow_mut().rng_mut().next()
    }

    fn fill_bytes(&mut self, dst: &mut [u8]) {
        self.machine.borrow_mut().rng_mut().fill(dst);
    }
}

/// Replay-aware logger handle; suppresses output while replaying so a replay
/// does not duplicate the original run's log lines.
pub struct WorkflowLogger {
    run_id: String,
    replaying: bool,
}

impl WorkflowLogger {
    pub fn debug(&self, message: &str) {
        if !self.replaying {
            tracing::debug!(run_id = %self.run_id, "{message}");
        }
    }

    pub fn info(&self, message: &str) {
        if !self.replaying {
            tracing::info!(run_id = %self.run_id, "{message}");
        }
    }

    pub fn warn(&self, message: &str) {
        if !self.replaying {
            tracing::warn!(run_id = %self.run_id, "{message}");
        }
    }

    pub fn error(&self, message: &str) {
        if !self.replaying {
            tracing::error!(run_id = %self.run_id, "{message}");
        }
    }
}

// ── Primitive futures ──

struct TimerFuture {
    machine: Rc<RefCell<WorkflowMachine>>,
    scope: CancelScope,
    seq: u32,
    token: ResumeToken<()>,
    finished: bool,
}

impl Future for TimerFuture {
    type Output = Result<(), WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.finished && this.scope.is_cancelled() {
            this.machine.borrow_mut().cancel_timer(this.seq);
        }
        match Pin::new(&mut this.token).poll(cx) {
            Poll::Ready(woken) => {
                this.finished = true;
                Poll::Ready(match woken {
                    Woken::Resolved(()) => Ok(()),
                    Woken::Cancelled => Err(CanceledError::new("Timer canceled").into()),
                    Woken::Evicted => Err(WorkflowError::RemovedFromCache),
                })
            }
            Poll::Pending => {
                this.scope.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl Drop for TimerFuture {
    fn drop(&mut self) {
        if !self.finished && !self.token.is_resolved() {
            // An abandoned wait (for example a lost timeout race) cancels
            // its timer so the server does not keep it alive.
            if let Ok(mut machine) = self.machine.try_borrow_mut() {
                machine.cancel_timer(self.seq);
            }
        }
    }
}

struct ActivityFuture {
    machine: Rc<RefCell<WorkflowMachine>>,
    scope: CancelScope,
    failures: Rc<FailureConverter>,
    seq: u32,
    token: ResumeToken<ActivityResolution>,
    cancel_requested: bool,
    finished: bool,
}

impl Future for ActivityFuture {
    type Output = Result<Option<Payload>, WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.finished && !this.cancel_requested && this.scope.is_cancelled() {
            this.machine.borrow_mut().request_cancel_activity(this.seq);
            this.cancel_requested = true;
        }
        match Pin::new(&mut this.token).poll(cx) {
            Poll::Ready(woken) => {
                this.finished = true;
                Poll::Ready(match woken {
                    Woken::Resolved(ActivityResolution::Completed { result }) => Ok(result),
                    Woken::Resolved(ActivityResolution::Failed { failure })
                    | Woken::Resolved(ActivityResolution::Cancelled { failure }) => {
                        Err(this.failures.from_failure(&failure))
                    }
                    Woken::Resolved(ActivityResolution::Backoff { .. }) => {
                        Err(WorkflowError::illegal_state(
                            "backoff resolution reached an activity waiter",
                        ))
                    }
                    Woken::Cancelled => {
                        Err(CanceledError::new("Activity cancelled").into())
                    }
                    Woken::Evicted => Err(WorkflowError::RemovedFromCache),
                })
            }
            Poll::Pending => {
                this.scope.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl Drop for ActivityFuture {
    fn drop(&mut self) {
        if !self.finished && !self.cancel_requested && !self.token.is_resolved() {
            if let Ok(mut machine) = self.machine.try_borrow_mut() {
                machine.request_cancel_activity(self.seq);
            }
        }
    }
}

/// Waits for the server to acknowledge a child start. Start waits have no
/// cancellation path of their own; the scope is consulted only by the result
/// future.
struct ChildStartFuture {
    token: ResumeToken<ChildWorkflowStartStatus>,
}

impl Future for ChildStartFuture {
    type Output = Result<ChildWorkflowStartStatus, WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.token).poll(cx) {
            Poll::Ready(woken) => Poll::Ready(match woken {
                Woken::Resolved(status) => Ok(status),
                Woken::Cancelled => Err(CanceledError::new("Workflow execution canceled").into()),
                Woken::Evicted => Err(WorkflowError::RemovedFromCache),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct ChildResultFuture {
    machine: Rc<RefCell<WorkflowMachine>>,
    scope: CancelScope,
    failures: Rc<FailureConverter>,
    seq: u32,
    token: ResumeToken<ChildWorkflowResult>,
    cancel_requested: bool,
    finished: bool,
}

impl Future for ChildResultFuture {
    type Output = Result<Option<Payload>, WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.finished && !this.cancel_requested && this.scope.is_cancelled() {
            this.machine.borrow_mut().cancel_child_workflow(this.seq);
            this.cancel_requested = true;
        }
        match Pin::new(&mut this.token).poll(cx) {
            Poll::Ready(woken) => {
                this.finished = true;
                Poll::Ready(match woken {
                    Woken::Resolved(ChildWorkflowResult::Completed { result }) => Ok(result),
                    Woken::Resolved(ChildWorkflowResult::Failed { failure })
                    | Woken::Resolved(ChildWorkflowResult::Cancelled { failure }) => {
                        Err(this.failures.from_failure(&failure))
                    }
                    Woken::Cancelled => {
                        Err(CanceledError::new("Workflow execution canceled").into())
                    }
                    Woken::Evicted => Err(WorkflowError::RemovedFromCache),
                })
            }
            Poll::Pending => {
                this.scope.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

struct ExternalSignalFuture {
    machine: Rc<RefCell<WorkflowMachine>>,
    scope: CancelScope,
    failures: Rc<FailureConverter>,
    seq: u32,
    token: ResumeToken<Option<TemporalFailure>>,
    finished: bool,
}

impl Future for ExternalSignalFuture {
    type Output = Result<(), WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.finished && this.scope.is_cancelled() {
            this.machine
                .borrow_mut()
                .cancel_signal_external_workflow(this.seq);
        }
        match Pin::new(&mut this.token).poll(cx) {
            Poll::Ready(woken) => {
                this.finished = true;
                Poll::Ready(match woken {
                    Woken::Resolved(None) => Ok(()),
                    Woken::Resolved(Some(failure)) => Err(this.failures.from_failure(&failure)),
                    Woken::Cancelled => Err(CanceledError::new(
                        "Signal was cancelled before being sent",
                    )
                    .into()),
                    Woken::Evicted => Err(WorkflowError::RemovedFromCache),
                })
            }
            Poll::Pending => {
                this.scope.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl Drop for ExternalSignalFuture {
    fn drop(&mut self) {
        if !self.finished && !self.token.is_resolved() {
            if let Ok(mut machine) = self.machine.try_borrow_mut() {
                machine.cancel_signal_external_workflow(self.seq);
            }
        }
    }
}

struct ConditionFuture {
    machine: Rc<RefCell<WorkflowMachine>>,
    scope: CancelScope,
    seq: u32,
    token: ResumeToken<()>,
    finished: bool,
}

impl Future for ConditionFuture {
    type Output = Result<(), WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.finished && this.scope.is_cancelled() {
            this.machine.borrow_mut().cancel_condition(this.seq);
        }
        match Pin::new(&mut this.token).poll(cx) {
            Poll::Ready(woken) => {
                this.finished = true;
                Poll::Ready(match woken {
                    Woken::Resolved(()) => Ok(()),
                    Woken::Cancelled => {
                        Err(CanceledError::new("Wait condition cancelled").into())
                    }
                    Woken::Evicted => Err(WorkflowError::RemovedFromCache),
                })
            }
            Poll::Pending => {
                this.scope.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl Drop for ConditionFuture {
    fn drop(&mut self) {
        if !self.finished && !self.token.is_resolved() {
            if let Ok(mut machine) = self.machine.try_borrow_mut() {
                machine.cancel_condition(self.seq);
            }
        }
    }
}
