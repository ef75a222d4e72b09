use super::types::JobStatus;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {id} not found")]
    NotFound { id: Uuid },
    #[error("job {id} already left the queue (status: {status})")]
    AlreadyStarted { id: Uuid, status: JobStatus },
    #[error("failed to spawn command for job {id}: {source}")]
    Spawn {
        id: Uuid,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start worker thread for job {id}: {source}")]
    Thread {
        id: Uuid,
        #[source]
        source: std::io::Error,
    },
    #[error("command exited with {}", describe_code(.code))]
    SubprocessFailure { code: Option<i32> },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}
