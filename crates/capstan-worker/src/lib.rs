//! Deterministic workflow worker core.
//!
//! Runs user-authored workflow code as a durable, resumable state machine:
//! activations from the core bridge are applied to a per-run
//! [`instance::WorkflowInstance`], workflow code executes on a cooperative
//! single-threaded [`executor::CoopExecutor`], and the resulting commands are
//! returned to the bridge as the activation's completion. Replaying the same
//! history always reproduces the same command batches.

pub mod context;
pub mod converter;
pub mod error;
pub mod executor;
pub mod instance;
pub mod interceptor;
pub mod registry;
pub mod worker;

pub use context::{
    StartedChildWorkflow, WorkflowContext, WorkflowInfo, WorkflowLogger, WorkflowRng,
};
pub use converter::{EncodingConverter, FailureConverter, PayloadConverter};
pub use error::{
    ApplicationError, CanceledError, ChildWorkflowError, ContinueAsNewError, TerminatedError,
    TimeoutError, WorkflowError,
};
pub use executor::{CancelScope, CoopExecutor, TaskHandle};
pub use instance::WorkflowInstance;
pub use interceptor::{
    WorkflowInboundInterceptor, WorkflowOutboundInterceptor,
};
pub use registry::{
    METADATA_QUERY_TYPE, RegistryError, WorkflowBuilder, WorkflowRegistration, WorkflowRegistry,
};
pub use worker::{BridgeError, Worker, WorkerError, WorkflowBridge};
