use thiserror::Error;

/// Errors raised by the workflow state machine.
///
/// `FrozenContext` is deterministic by construction: the same workflow code
/// replayed over the same history freezes and thaws at the same points, so
/// it either always fires or never does.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MachineError {
    /// A mutating operation was attempted while the workflow surface was
    /// read-only (initialization, a query handler, or an update validator).
    #[error("`{api}` is not allowed while {context}")]
    FrozenContext {
        api: &'static str,
        context: &'static str,
    },

    /// The command buffer was drained twice for one activation.
    #[error("activation commands were already drained")]
    AlreadyDrained,
}
