pub mod activation;
pub mod command;
pub mod completion;
pub mod failure;
pub mod options;
pub mod payload;

pub use activation::{
    ActivationJob, ActivityResolution, ChildWorkflowResult, ChildWorkflowStartStatus,
    InitializeWorkflow, WorkflowActivation,
};
pub use command::{
    ContinueAsNewWorkflowExecution, QueryResult, QueryResultVariant, ScheduleActivity,
    ScheduleLocalActivity, SignalExternalWorkflowExecution, SignalTarget,
    StartChildWorkflowExecution, StartTimer, UpdateResponse, UpdateResponseVariant,
    WorkflowCommand,
};
pub use completion::{ActivationCompletionStatus, WorkflowActivationCompletion};
pub use failure::{FailureInfo, TemporalFailure, TimeoutType};
pub use options::{
    ActivityCancellationType, ActivityOptions, ChildWorkflowCancellationType,
    ChildWorkflowOptions, LocalActivityOptions, ParentClosePolicy, RetryPolicy,
    WorkflowIdReusePolicy,
};
pub use payload::{
    ENCODING_BINARY_NULL, ENCODING_BINARY_PLAIN, ENCODING_JSON, ENCODING_JSON_PROTOBUF,
    ENCODING_KEY, Payload,
};
