use labdash_shared::state_machine::{ApplianceState, LifecycleEvent};
use labdash_shared::{CommandError, JobError, JobErrorKind, ShellError};
use thiserror::Error;

/// Failures of an appliance operation
#[derive(Error, Debug)]
pub enum ApplianceError {
    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("invalid lifecycle transition: {event:?} from {from:?}")]
    InvalidState {
        from: ApplianceState,
        event: LifecycleEvent,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The device or appliance rejected the operation
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl From<ApplianceError> for JobError {
    fn from(err: ApplianceError) -> Self {
        match err {
            ApplianceError::Shell(e) => e.into(),
            ApplianceError::Command(e) => e.into(),
            e @ ApplianceError::InvalidState { .. } => {
                JobError::new(JobErrorKind::Internal, e.to_string())
            }
            ApplianceError::Unsupported(msg) => JobError::new(JobErrorKind::Unsupported, msg),
            ApplianceError::OperationFailed(msg) => {
                JobError::new(JobErrorKind::OperationFailed, msg)
            }
        }
    }
}
