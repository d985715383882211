pub mod error;
pub mod machine;
pub mod resume;
pub mod rng;

pub use error::MachineError;
pub use machine::{ActivationOutcome, WorkflowMachine};
pub use resume::{ResumeSlot, ResumeToken, Woken, resume_pair};
pub use rng::DeterministicRng;
