//! Composable middleware around workflow operations.
//!
//! Two symmetric stacks: inbound interceptors wrap work delivered to the
//! workflow (the run method, signals, queries, updates), outbound
//! interceptors wrap operations the workflow performs (activities, children,
//! timers, external signals, continue-as-new). The first registered
//! interceptor is outermost; the innermost layer is the concrete operation
//! against the state machine.
//!
//! Interceptors must not affect workflow determinism: they may observe and
//! transform inputs, keep externally synchronized counters, or log, but must
//! not emit commands of their own or suspend outside `next`.

use crate::context::{StartedChildWorkflow, WorkflowContext};
use crate::error::{ContinueAsNewError, WorkflowError};
use capstan_types::command::SignalTarget;
use capstan_types::options::{ActivityOptions, ChildWorkflowOptions, LocalActivityOptions};
use capstan_types::payload::Payload;
use futures::future::LocalBoxFuture;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

// ── Hook inputs ──

#[derive(Clone, Debug)]
pub struct ExecuteWorkflowInput {
    pub workflow_type: String,
    pub headers: BTreeMap<String, Payload>,
    pub arguments: Vec<Payload>,
}

#[derive(Clone, Debug)]
pub struct HandleSignalInput {
    pub signal_name: String,
    pub input: Vec<Payload>,
    pub headers: BTreeMap<String, Payload>,
}

#[derive(Clone, Debug)]
pub struct HandleQueryInput {
    pub query_id: String,
    pub query_type: String,
    pub arguments: Vec<Payload>,
    pub headers: BTreeMap<String, Payload>,
}

#[derive(Clone, Debug)]
pub struct HandleUpdateInput {
    pub id: String,
    pub name: String,
    pub input: Vec<Payload>,
    pub headers: BTreeMap<String, Payload>,
}

#[derive(Debug)]
pub struct ExecuteActivityInput {
    pub activity_type: String,
    pub arguments: Vec<Payload>,
    pub options: ActivityOptions,
    pub headers: BTreeMap<String, Payload>,
}

#[derive(Debug)]
pub struct ExecuteLocalActivityInput {
    pub activity_type: String,
    pub arguments: Vec<Payload>,
    pub options: LocalActivityOptions,
    pub headers: BTreeMap<String, Payload>,
}

#[derive(Debug)]
pub struct SleepInput {
    pub duration: Duration,
    pub summary: Option<String>,
}

#[derive(Debug)]
pub struct StartChildWorkflowInput {
    pub workflow_type: String,
    pub arguments: Vec<Payload>,
    pub options: ChildWorkflowOptions,
    pub headers: BTreeMap<String, Payload>,
}

#[derive(Debug)]
pub struct SignalExternalInput {
    pub target: SignalTarget,
    pub signal_name: String,
    pub args: Vec<Payload>,
    pub headers: BTreeMap<String, Payload>,
}

// ── Hook outputs ──

pub type WorkflowRunResult = Result<Option<Payload>, WorkflowError>;
pub type SignalResult = Result<(), WorkflowError>;
pub type QueryResultValue = Result<Option<Payload>, WorkflowError>;
pub type ValidateResult = Result<(), WorkflowError>;
pub type UpdateRunResult = Result<Option<Payload>, WorkflowError>;
pub type ActivityResultValue = Result<Option<Payload>, WorkflowError>;
pub type SleepResult = Result<(), WorkflowError>;
pub type ChildStartResult = Result<StartedChildWorkflow, WorkflowError>;
pub type ExternalSignalResult = Result<(), WorkflowError>;

// ── Continuation machinery ──

/// The rest of an async interceptor chain. Calling [`Next::run`] invokes the
/// following layer, or the concrete operation once the layers are exhausted.
type AsyncDispatch<T, I, O> = Rc<dyn Fn(Rc<T>, I, Next<T, I, O>) -> LocalBoxFuture<'static, O>>;

pub struct Next<T: ?Sized, I, O> {
    layers: Rc<[Rc<T>]>,
    index: usize,
    terminal: Rc<dyn Fn(I) -> LocalBoxFuture<'static, O>>,
    dispatch: AsyncDispatch<T, I, O>,
}

impl<T: ?Sized, I: 'static, O: 'static> Next<T, I, O> {
    pub(crate) fn new(
        layers: Rc<[Rc<T>]>,
        terminal: Rc<dyn Fn(I) -> LocalBoxFuture<'static, O>>,
        dispatch: AsyncDispatch<T, I, O>,
    ) -> Self {
        Self {
            layers,
            index: 0,
            terminal,
            dispatch,
        }
    }

    pub fn run(mut self, input: I) -> LocalBoxFuture<'static, O> {
        if self.index < self.layers.len() {
            let layer = self.layers[self.index].clone();
            self.index += 1;
            let dispatch = self.dispatch.clone();
            dispatch(layer, input, self)
        } else {
            (self.terminal)(input)
        }
    }
}

/// Synchronous counterpart of [`Next`] for hooks that must not suspend
/// (queries and update validators run in frozen contexts).
type SyncDispatch<T, I, O> = Rc<dyn Fn(Rc<T>, I, SyncNext<T, I, O>) -> O>;

pub struct SyncNext<T: ?Sized, I, O> {
    layers: Rc<[Rc<T>]>,
    index: usize,
    terminal: Rc<dyn Fn(I) -> O>,
    dispatch: SyncDispatch<T, I, O>,
}

impl<T: ?Sized, I, O> SyncNext<T, I, O> {
    pub(crate) fn new(
        layers: Rc<[Rc<T>]>,
        terminal: Rc<dyn Fn(I) -> O>,
        dispatch: SyncDispatch<T, I, O>,
    ) -> Self {
        Self {
            layers,
            index: 0,
            terminal,
            dispatch,
        }
    }

    pub fn run(mut self, input: I) -> O {
        if self.index < self.layers.len() {
            let layer = self.layers[self.index].clone();
            self.index += 1;
            let dispatch = self.dispatch.clone();
            dispatch(layer, input, self)
        } else {
            (self.terminal)(input)
        }
    }
}

pub type InboundNext<I, O> = Next<dyn WorkflowInboundInterceptor, I, O>;
pub type InboundSyncNext<I, O> = SyncNext<dyn WorkflowInboundInterceptor, I, O>;
pub type OutboundNext<I, O> = Next<dyn WorkflowOutboundInterceptor, I, O>;
pub type OutboundSyncNext<I, O> = SyncNext<dyn WorkflowOutboundInterceptor, I, O>;

// ── Traits ──

/// Wraps work delivered to the workflow. Every hook defaults to passthrough.
pub trait WorkflowInboundInterceptor {
    fn execute_workflow(
        self: Rc<Self>,
        ctx: WorkflowContext,
        input: ExecuteWorkflowInput,
        next: InboundNext<ExecuteWorkflowInput, WorkflowRunResult>,
    ) -> LocalBoxFuture<'static, WorkflowRunResult> {
        let _ = ctx;
        next.run(input)
    }

    fn handle_signal(
        self: Rc<Self>,
        ctx: WorkflowContext,
        input: HandleSignalInput,
        next: InboundNext<HandleSignalInput, SignalResult>,
    ) -> LocalBoxFuture<'static, SignalResult> {
        let _ = ctx;
        next.run(input)
    }

    fn handle_query(
        self: Rc<Self>,
        ctx: WorkflowContext,
        input: HandleQueryInput,
        next: InboundSyncNext<HandleQueryInput, QueryResultValue>,
    ) -> QueryResultValue {
        let _ = ctx;
        next.run(input)
    }

    fn validate_update(
        self: Rc<Self>,
        ctx: WorkflowContext,
        input: HandleUpdateInput,
        next: InboundSyncNext<HandleUpdateInput, ValidateResult>,
    ) -> ValidateResult {
        let _ = ctx;
        next.run(input)
    }

    fn handle_update(
        self: Rc<Self>,
        ctx: WorkflowContext,
        input: HandleUpdateInput,
        next: InboundNext<HandleUpdateInput, UpdateRunResult>,
    ) -> LocalBoxFuture<'static, UpdateRunResult> {
        let _ = ctx;
        next.run(input)
    }
}

/// Wraps operations the workflow performs. Every hook defaults to
/// passthrough.
pub trait WorkflowOutboundInterceptor {
    fn execute_activity(
        self: Rc<Self>,
        ctx: WorkflowContext,
        input: ExecuteActivityInput,
        next: OutboundNext<ExecuteActivityInput, ActivityResultValue>,
    ) -> LocalBoxFuture<'static, ActivityResultValue> {
        let _ = ctx;
        next.run(input)
    }

    fn execute_local_activity(
        self: Rc<Self>,
        ctx: WorkflowContext,
        input: ExecuteLocalActivityInput,
        next: OutboundNext<ExecuteLocalActivityInput, ActivityResultValue>,
    ) -> LocalBoxFuture<'static, ActivityResultValue> {
        let _ = ctx;
        next.run(input)
    }

    fn handle_sleep(
        self: Rc<Self>,
        ctx: WorkflowContext,
        input: SleepInput,
        next: OutboundNext<SleepInput, SleepResult>,
    ) -> LocalBoxFuture<'static, SleepResult> {
        let _ = ctx;
        next.run(input)
    }

    fn start_child_workflow(
        self: Rc<Self>,
        ctx: WorkflowContext,
        input: StartChildWorkflowInput,
        next: OutboundNext<StartChildWorkflowInput, ChildStartResult>,
    ) -> LocalBoxFuture<'static, ChildStartResult> {
        let _ = ctx;
        next.run(input)
    }

    fn signal_external_workflow(
        self: Rc<Self>,
        ctx: WorkflowContext,
        input: SignalExternalInput,
        next: OutboundNext<SignalExternalInput, ExternalSignalResult>,
    ) -> LocalBoxFuture<'static, ExternalSignalResult> {
        let _ = ctx;
        next.run(input)
    }

    fn make_continue_as_new_error(
        self: Rc<Self>,
        ctx: WorkflowContext,
        draft: ContinueAsNewError,
        next: OutboundSyncNext<ContinueAsNewError, ContinueAsNewError>,
    ) -> ContinueAsNewError {
        let _ = ctx;
        next.run(draft)
    }
}

pub type InboundStack = Rc<[Rc<dyn WorkflowInboundInterceptor>]>;
pub type OutboundStack = Rc<[Rc<dyn WorkflowOutboundInterceptor>]>;

// ── Chain constructors ──
//
// Thin wrappers fixing the closure types so call sites infer cleanly.

pub(crate) fn inbound_chain<I: 'static, O: 'static>(
    layers: InboundStack,
    terminal: impl Fn(I) -> LocalBoxFuture<'static, O> + 'static,
    dispatch: impl Fn(Rc<dyn WorkflowInboundInterceptor>, I, InboundNext<I, O>) -> LocalBoxFuture<'static, O>
    + 'static,
) -> InboundNext<I, O> {
    Next::new(layers, Rc::new(terminal), Rc::new(dispatch))
}

pub(crate) fn inbound_sync_chain<I, O>(
    layers: InboundStack,
    terminal: impl Fn(I) -> O + 'static,
    dispatch: impl Fn(Rc<dyn WorkflowInboundInterceptor>, I, InboundSyncNext<I, O>) -> O + 'static,
) -> InboundSyncNext<I, O> {
    SyncNext::new(layers, Rc::new(terminal), Rc::new(dispatch))
}

pub(crate) fn outbound_chain<I: 'static, O: 'static>(
    layers: OutboundStack,
    terminal: impl Fn(I) -> LocalBoxFuture<'static, O> + 'static,
    dispatch: impl Fn(Rc<dyn WorkflowOutboundInterceptor>, I, OutboundNext<I, O>) -> LocalBoxFuture<'static, O>
    + 'static,
) -> OutboundNext<I, O> {
    Next::new(layers, Rc::new(terminal), Rc::new(dispatch))
}

pub(crate) fn outbound_sync_chain<I, O>(
    layers: OutboundStack,
    terminal: impl Fn(I) -> O + 'static,
    dispatch: impl Fn(Rc<dyn WorkflowOutboundInterceptor>, I, OutboundSyncNext<I, O>) -> O + 'static,
) -> OutboundSyncNext<I, O> {
    SyncNext::new(layers, Rc::new(terminal), Rc::new(dispatch))
}
