//! Workflow type registry.
//!
//! Workflow definitions are registered by string name; handlers are stored
//! as erased closures taking the workflow instance and raw payloads. The
//! typed [`WorkflowBuilder`] generates the decode and encode shims at
//! registration time, so nothing in the hot path reflects over types.

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use capstan_types::payload::Payload;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::rc::Rc;
use thiserror::Error;
use tracing::info;

/// Erased workflow instance. Concrete workflow structs are `Rc`-shared
/// between the run method, handler tasks, and condition predicates.
pub type DynWorkflow = Rc<dyn Any>;

type Factory = Rc<dyn Fn(&WorkflowContext, &[Payload]) -> Result<DynWorkflow, WorkflowError>>;
type RunFn = Rc<
    dyn Fn(DynWorkflow, WorkflowContext) -> LocalBoxFuture<'static, Result<Option<Payload>, WorkflowError>>,
>;
type SignalFn = Rc<
    dyn Fn(DynWorkflow, WorkflowContext, Vec<Payload>) -> LocalBoxFuture<'static, Result<(), WorkflowError>>,
>;
type QueryFn =
    Rc<dyn Fn(DynWorkflow, WorkflowContext, Vec<Payload>) -> Result<Option<Payload>, WorkflowError>>;
type ValidatorFn =
    Rc<dyn Fn(DynWorkflow, WorkflowContext, Vec<Payload>) -> Result<(), WorkflowError>>;
type UpdateFn = Rc<
    dyn Fn(DynWorkflow, WorkflowContext, Vec<Payload>) -> LocalBoxFuture<'static, Result<Option<Payload>, WorkflowError>>,
>;

pub struct SignalDefinition {
    pub name: String,
    pub description: Option<String>,
    pub(crate) handler: SignalFn,
}

pub struct QueryDefinition {
    pub name: String,
    pub description: Option<String>,
    pub(crate) handler: QueryFn,
}

pub struct UpdateDefinition {
    pub name: String,
    pub description: Option<String>,
    pub(crate) validator: Option<ValidatorFn>,
    pub(crate) handler: UpdateFn,
}

/// One registered workflow type.
pub struct WorkflowRegistration {
    pub name: String,
    pub description: Option<String>,
    pub(crate) factory: Factory,
    pub(crate) run: RunFn,
    pub(crate) signals: Vec<SignalDefinition>,
    pub(crate) queries: Vec<QueryDefinition>,
    pub(crate) updates: Vec<UpdateDefinition>,
}

impl WorkflowRegistration {
    pub fn builder<W: 'static>(name: impl Into<String>) -> WorkflowBuilder<W> {
        WorkflowBuilder::new(name)
    }

    pub(crate) fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|def| def.name == name)
    }

    pub(crate) fn query(&self, name: &str) -> Option<&QueryDefinition> {
        self.queries.iter().find(|def| def.name == name)
    }

    pub(crate) fn update(&self, name: &str) -> Option<&UpdateDefinition> {
        self.updates.iter().find(|def| def.name == name)
    }

    pub(crate) fn sorted_query_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.queries.iter().map(|def| def.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn sorted_update_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.updates.iter().map(|def| def.name.as_str()).collect();
        names.sort_unstable();
        names
    }
}

fn downcast<W: 'static>(workflow: DynWorkflow) -> Result<Rc<W>, WorkflowError> {
    workflow
        .downcast::<W>()
        .map_err(|_| WorkflowError::illegal_state("workflow instance has an unexpected type"))
}

/// Typed builder producing an erased [`WorkflowRegistration`].
pub struct WorkflowBuilder<W> {
    name: String,
    description: Option<String>,
    factory: Option<Factory>,
    run: Option<RunFn>,
    signals: Vec<SignalDefinition>,
    queries: Vec<QueryDefinition>,
    updates: Vec<UpdateDefinition>,
    _workflow: PhantomData<fn() -> W>,
}

impl<W: 'static> WorkflowBuilder<W> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            factory: None,
            run: None,
            signals: Vec::new(),
            queries: Vec::new(),
            updates: Vec::new(),
            _workflow: PhantomData,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Constructor from decoded input. Runs in a frozen context.
    pub fn init<I, F>(mut self, factory: F) -> Self
    where
        I: DeserializeOwned + 'static,
        F: Fn(I) -> W + 'static,
    {
        self.factory = Some(Rc::new(move |ctx, arguments| {
            let input: I = ctx.payload_converter().from_arguments(arguments)?;
            Ok(Rc::new(factory(input)) as DynWorkflow)
        }));
        self
    }

    /// The primary run method.
    pub fn run<F, Fut, O>(mut self, run: F) -> Self
    where
        F: Fn(Rc<W>, WorkflowContext) -> Fut + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + 'static,
        O: Serialize + 'static,
    {
        self.run = Some(Rc::new(move |workflow, ctx| {
            let encode_ctx = ctx.clone();
            match downcast::<W>(workflow) {
                Ok(workflow) => {
                    let body = run(workflow, ctx);
                    async move {
                        let output = body.await?;
                        encode_ctx.payload_converter().to_result_payload(&output)
                    }
                    .boxed_local()
                }
                Err(err) => futures::future::ready(Err(err)).boxed_local(),
            }
        }));
        self
    }

    pub fn signal<I, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned + 'static,
        F: Fn(Rc<W>, WorkflowContext, I) -> Fut + 'static,
        Fut: Future<Output = Result<(), WorkflowError>> + 'static,
    {
        self.signal_described(name, None::<String>, handler)
    }

    pub fn signal_described<I, F, Fut>(
        mut self,
        name: impl Into<String>,
        description: Option<impl Into<String>>,
        handler: F,
    ) -> Self
    where
        I: DeserializeOwned + 'static,
        F: Fn(Rc<W>, WorkflowContext, I) -> Fut + 'static,
        Fut: Future<Output = Result<(), WorkflowError>> + 'static,
    {
        self.signals.push(SignalDefinition {
            name: name.into(),
            description: description.map(Into::into),
            handler: Rc::new(move |workflow, ctx, arguments| {
                match downcast::<W>(workflow).and_then(|workflow| {
                    let input: I = ctx.payload_converter().from_arguments(&arguments)?;
                    Ok((workflow, input))
                }) {
                    Ok((workflow, input)) => handler(workflow, ctx, input).boxed_local(),
                    Err(err) => futures::future::ready(Err(err)).boxed_local(),
                }
            }),
        });
        self
    }

    /// Queries are synchronous and run in a frozen context.
    pub fn query<I, O, F>(self, name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(Rc<W>, WorkflowContext, I) -> Result<O, WorkflowError> + 'static,
    {
        self.query_described(name, None::<String>, handler)
    }

    pub fn query_described<I, O, F>(
        mut self,
        name: impl Into<String>,
        description: Option<impl Into<String>>,
        handler: F,
    ) -> Self
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(Rc<W>, WorkflowContext, I) -> Result<O, WorkflowError> + 'static,
    {
        self.queries.push(QueryDefinition {
            name: name.into(),
            description: description.map(Into::into),
            handler: Rc::new(move |workflow, ctx, arguments| {
                let workflow = downcast::<W>(workflow)?;
                let input: I = ctx.payload_converter().from_arguments(&arguments)?;
                let output = handler(workflow, ctx.clone(), input)?;
                ctx.payload_converter().to_result_payload(&output)
            }),
        });
        self
    }

    pub fn update<I, O, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(Rc<W>, WorkflowContext, I) -> Fut + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + 'static,
    {
        self.update_full(
            name,
            None::<String>,
            None::<fn(Rc<W>, WorkflowContext, I) -> Result<(), WorkflowError>>,
            handler,
        )
    }

    /// Update with a validator. The validator runs in a frozen context
    /// before the update is accepted; an error rejects the update.
    pub fn update_with_validator<I, O, V, F, Fut>(
        self,
        name: impl Into<String>,
        validator: V,
        handler: F,
    ) -> Self
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        V: Fn(Rc<W>, WorkflowContext, I) -> Result<(), WorkflowError> + 'static,
        F: Fn(Rc<W>, WorkflowContext, I) -> Fut + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + 'static,
    {
        self.update_full(name, None::<String>, Some(validator), handler)
    }

    fn update_full<I, O, V, F, Fut>(
        mut self,
        name: impl Into<String>,
        description: Option<impl Into<String>>,
        validator: Option<V>,
        handler: F,
    ) -> Self
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        V: Fn(Rc<W>, WorkflowContext, I) -> Result<(), WorkflowError> + 'static,
        F: Fn(Rc<W>, WorkflowContext, I) -> Fut + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + 'static,
    {
        let validator = validator.map(|validate| {
            let validate: ValidatorFn = Rc::new(move |workflow, ctx, arguments| {
                let workflow = downcast::<W>(workflow)?;
                let input: I = ctx.payload_converter().from_arguments(&arguments)?;
                validate(workflow, ctx, input)
            });
            validate
        });
        self.updates.push(UpdateDefinition {
            name: name.into(),
            description: description.map(Into::into),
            validator,
            handler: Rc::new(move |workflow, ctx, arguments| {
                let encode_ctx = ctx.clone();
                let prepared = downcast::<W>(workflow).and_then(|workflow| {
                    let input: I = ctx.payload_converter().from_arguments(&arguments)?;
                    Ok((workflow, input))
                });
                match prepared {
                    Ok((workflow, input)) => {
                        let body = handler(workflow, ctx, input);
                        async move {
                            let output = body.await?;
                            encode_ctx.payload_converter().to_result_payload(&output)
                        }
                        .boxed_local()
                    }
                    Err(err) => futures::future::ready(Err(err)).boxed_local(),
                }
            }),
        });
        self
    }

    pub fn build(self) -> Result<WorkflowRegistration, RegistryError> {
        let factory = self.factory.ok_or(RegistryError::IncompleteRegistration {
            name: self.name.clone(),
            what: "an init constructor",
        })?;
        let run = self.run.ok_or(RegistryError::IncompleteRegistration {
            name: self.name.clone(),
            what: "a run method",
        })?;
        Ok(WorkflowRegistration {
            name: self.name,
            description: self.description,
            factory,
            run,
            signals: self.signals,
            queries: self.queries,
            updates: self.updates,
        })
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("workflow type `{name}` is registered more than once")]
    DuplicateWorkflowType { name: String },

    #[error("workflow `{workflow}` declares {kind} `{handler}` more than once")]
    DuplicateHandler {
        workflow: String,
        kind: &'static str,
        handler: String,
    },

    #[error("workflow `{name}` registration is missing {what}")]
    IncompleteRegistration {
        name: String,
        what: &'static str,
    },
}

/// All workflow types a worker serves, validated at startup.
pub struct WorkflowRegistry {
    workflows: HashMap<String, Rc<WorkflowRegistration>>,
}

impl WorkflowRegistry {
    pub fn new(registrations: Vec<WorkflowRegistration>) -> Result<Self, RegistryError> {
        let mut workflows = HashMap::new();
        for registration in registrations {
            Self::check_handler_names(&registration)?;
            let name = registration.name.clone();
            if workflows
                .insert(name.clone(), Rc::new(registration))
                .is_some()
            {
                info!("workflow.type" = %name, "rejecting duplicate workflow registration");
                return Err(RegistryError::DuplicateWorkflowType { name });
            }
        }
        Ok(Self { workflows })
    }

    fn check_handler_names(registration: &WorkflowRegistration) -> Result<(), RegistryError> {
        fn find_duplicate<'a>(names: impl Iterator<Item = &'a str>) -> Option<String> {
            let mut seen = std::collections::HashSet::new();
            for name in names {
                if !seen.insert(name) {
                    return Some(name.to_string());
                }
            }
            None
        }
        for (kind, duplicate) in [
            (
                "signal",
                find_duplicate(registration.signals.iter().map(|def| def.name.as_str())),
            ),
            (
                "query",
                find_duplicate(registration.queries.iter().map(|def| def.name.as_str())),
            ),
            (
                "update",
                find_duplicate(registration.updates.iter().map(|def| def.name.as_str())),
            ),
        ] {
            if let Some(handler) = duplicate {
                return Err(RegistryError::DuplicateHandler {
                    workflow: registration.name.clone(),
                    kind,
                    handler,
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, workflow_type: &str) -> Option<Rc<WorkflowRegistration>> {
        self.workflows.get(workflow_type).cloned()
    }

    pub fn workflow_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ── Built-in metadata query ──

pub const METADATA_QUERY_TYPE: &str = "__temporal_workflow_metadata";

#[derive(Debug, Serialize)]
pub struct HandlerMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowDefinitionMetadata {
    #[serde(rename = "type")]
    pub workflow_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub query_definitions: Vec<HandlerMetadata>,
    pub signal_definitions: Vec<HandlerMetadata>,
    pub update_definitions: Vec<HandlerMetadata>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowMetadata {
    pub definition: WorkflowDefinitionMetadata,
    pub current_details: String,
}

/// Definition listing for the built-in metadata query, sorted by name.
pub(crate) fn workflow_metadata(
    registration: &WorkflowRegistration,
    current_details: String,
) -> WorkflowMetadata {
    fn sorted(handlers: impl Iterator<Item = HandlerMetadata>) -> Vec<HandlerMetadata> {
        let mut list: Vec<HandlerMetadata> = handlers.collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
    WorkflowMetadata {
        definition: WorkflowDefinitionMetadata {
            workflow_type: registration.name.clone(),
            description: registration.description.clone(),
            query_definitions: sorted(registration.queries.iter().map(|def| HandlerMetadata {
                name: def.name.clone(),
                description: def.description.clone(),
            })),
            signal_definitions: sorted(registration.signals.iter().map(|def| HandlerMetadata {
                name: def.name.clone(),
                description: def.description.clone(),
            })),
            update_definitions: sorted(registration.updates.iter().map(|def| HandlerMetadata {
                name: def.name.clone(),
                description: def.description.clone(),
            })),
        },
        current_details,
    }
}
