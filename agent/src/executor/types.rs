use crate::model::{ArtifactError, CacheError};
use crate::protocol::{DecodeError, Envelope};
use crate::scheduler::{JobClass, PoolError};
use crate::session::SessionError;
use serde_json::{json, Value};
use thiserror::Error;

/// Job-local faults. None of these end the session.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("model construction failed: {0}")]
    Construction(#[from] CacheError),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no handler for command {0}")]
    UnknownCommand(String),

    #[error("admission for {0} jobs is closed")]
    AdmissionClosed(JobClass),

    #[error("could not deliver reply: {0}")]
    Delivery(#[from] SessionError),
}

impl JobError {
    /// Value of `error_kind` in the failure frame.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Construction(_) => "construction",
            JobError::Execution(_) => "execution",
            JobError::InvalidPayload(_) => "invalid_payload",
            JobError::UnknownCommand(_) => "unknown_command",
            JobError::AdmissionClosed(_) => "admission",
            JobError::Delivery(_) => "delivery",
        }
    }
}

impl From<DecodeError> for JobError {
    fn from(err: DecodeError) -> Self {
        JobError::InvalidPayload(err.to_string())
    }
}

impl From<ArtifactError> for JobError {
    fn from(err: ArtifactError) -> Self {
        JobError::Execution(err.to_string())
    }
}

impl From<PoolError> for JobError {
    fn from(err: PoolError) -> Self {
        JobError::Execution(err.to_string())
    }
}

/// Build the `job_failed` frame reporting `error`.
///
/// `command` is the command that failed, echoed under `arguments.command`.
pub fn failure_frame(
    module: &str,
    command: &str,
    context: Option<&Value>,
    error: &JobError,
) -> Envelope {
    Envelope::new("job_failed", module, "error").with_arguments(json!({
        "context": context.cloned().unwrap_or(Value::Null),
        "command": command,
        "error_kind": error.kind(),
        "error": error.to_string(),
    }))
}
