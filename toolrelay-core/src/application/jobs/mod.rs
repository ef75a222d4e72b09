mod error;
mod progress;
mod supervisor;
mod types;

pub use error::JobError;
pub use progress::{FractionProgress, MAX_RUNNING_PROGRESS, ProgressEstimator};
pub use supervisor::{JobContext, JobSupervisor};
pub use types::{JobSnapshot, JobStatus, JobStatusResponse, KillResponse};
