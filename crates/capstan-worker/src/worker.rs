//! Bridge driver: the poll/complete loop owning all cached instances.

use crate::converter::{FailureConverter, PayloadConverter};
use crate::instance::WorkflowInstance;
use crate::interceptor::{
    InboundStack, OutboundStack, WorkflowInboundInterceptor, WorkflowOutboundInterceptor,
};
use crate::registry::{RegistryError, WorkflowRegistration, WorkflowRegistry};
use async_trait::async_trait;
use capstan_types::activation::{ActivationJob, WorkflowActivation};
use capstan_types::completion::WorkflowActivationCompletion;
use capstan_types::failure::TemporalFailure;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge is shutting down")]
    Shutdown,
    #[error("bridge transport error: {0}")]
    Transport(String),
}

/// The transport to the core bridge. Activations arrive here and completions
/// are returned here; everything in between is this crate.
#[async_trait(?Send)]
pub trait WorkflowBridge {
    /// Next activation, or `None` once the stream has ended.
    async fn poll_workflow_activation(&self) -> Result<Option<WorkflowActivation>, BridgeError>;

    async fn complete_workflow_activation(
        &self,
        completion: WorkflowActivationCompletion,
    ) -> Result<(), BridgeError>;

    fn initiate_shutdown(&self);

    async fn finalize_shutdown(&self);
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// A workflow worker: a registry of workflow types plus the driver loop
/// routing activations to per-run instances.
pub struct Worker<B> {
    bridge: B,
    registry: WorkflowRegistry,
    payload_converter: Rc<PayloadConverter>,
    failure_converter: Rc<FailureConverter>,
    inbound: InboundStack,
    outbound: OutboundStack,
    instances: HashMap<String, WorkflowInstance>,
}

impl<B: WorkflowBridge> Worker<B> {
    /// Build a worker. Registration problems (duplicate workflow type names,
    /// duplicate handler names, incomplete registrations) are fatal here,
    /// before any polling starts.
    pub fn new(
        bridge: B,
        registrations: Vec<WorkflowRegistration>,
    ) -> Result<Self, WorkerError> {
        let registry = WorkflowRegistry::new(registrations)?;
        Ok(Self {
            bridge,
            registry,
            payload_converter: Rc::new(PayloadConverter::default()),
            failure_converter: Rc::new(FailureConverter),
            inbound: Rc::from(Vec::new()),
            outbound: Rc::from(Vec::new()),
            instances: HashMap::new(),
        })
    }

    /// Install inbound interceptors; the first element is outermost.
    pub fn with_inbound_interceptors(
        mut self,
        interceptors: Vec<Rc<dyn WorkflowInboundInterceptor>>,
    ) -> Self {
        self.inbound = Rc::from(interceptors);
        self
    }

    /// Install outbound interceptors; the first element is outermost.
    pub fn with_outbound_interceptors(
        mut self,
        interceptors: Vec<Rc<dyn WorkflowOutboundInterceptor>>,
    ) -> Self {
        self.outbound = Rc::from(interceptors);
        self
    }

    pub fn with_payload_converter(mut self, converter: PayloadConverter) -> Self {
        self.payload_converter = Rc::new(converter);
        self
    }

    pub fn initiate_shutdown(&self) {
        self.bridge.initiate_shutdown();
    }

    /// Poll activations until the stream ends, dispatching each to its run's
    /// instance and returning the completion to the bridge.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        info!(
            workflows = ?self.registry.workflow_types(),
            "workflow worker polling"
        );
        loop {
            let polled = self.bridge.poll_workflow_activation().await;
            match polled {
                Ok(Some(activation)) => {
                    let completion = self.handle_activation(activation);
                    self.bridge.complete_workflow_activation(completion).await?;
                }
                Ok(None) | Err(BridgeError::Shutdown) => break,
                Err(err) => return Err(err.into()),
            }
        }
        // End of stream: every cached run is torn down as if evicted.
        for (_, mut instance) in self.instances.drain() {
            instance.evict("worker shutting down");
        }
        self.bridge.finalize_shutdown().await;
        info!("workflow worker stopped");
        Ok(())
    }

    fn handle_activation(
        &mut self,
        activation: WorkflowActivation,
    ) -> WorkflowActivationCompletion {
        let run_id = activation.run_id.clone();
        let evicts = activation.eviction_reason().is_some();

        if !self.instances.contains_key(&run_id) {
            match activation.jobs.first() {
                Some(ActivationJob::InitializeWorkflow(init)) => {
                    let Some(registration) = self.registry.get(&init.workflow_type) else {
                        return WorkflowActivationCompletion::fail(
                            run_id,
                            TemporalFailure::application(
                                format!(
                                    "workflow type `{}` is not registered with this worker",
                                    init.workflow_type
                                ),
                                "NotFound",
                            ),
                        );
                    };
                    debug!(run_id = %run_id, workflow_type = %init.workflow_type, "caching new workflow run");
                    let instance = WorkflowInstance::new(
                        registration,
                        run_id.clone(),
                        self.payload_converter.clone(),
                        self.failure_converter.clone(),
                        self.inbound.clone(),
                        self.outbound.clone(),
                    );
                    self.instances.insert(run_id.clone(), instance);
                }
                Some(ActivationJob::RemoveFromCache { .. }) => {
                    // Nothing cached; acknowledge the eviction.
                    return WorkflowActivationCompletion::success(run_id, Vec::new());
                }
                _ => {
                    return WorkflowActivationCompletion::fail(
                        run_id,
                        TemporalFailure::application(
                            "expected InitializeWorkflow as the first job of the first activation",
                            "InvalidActivation",
                        ),
                    );
                }
            }
        }

        let completion = match self.instances.get_mut(&run_id) {
            Some(instance) => instance.activate(activation),
            None => WorkflowActivationCompletion::success(run_id.clone(), Vec::new()),
        };
        if evicts {
            self.instances.remove(&run_id);
        }
        completion
    }
}
