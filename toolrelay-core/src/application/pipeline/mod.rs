mod error;
mod step;
mod store;

pub use error::PipelineError;
pub use step::{ClarificationRequest, StepReport, TaskFailure, VerificationStep};
pub use store::TaskStore;
