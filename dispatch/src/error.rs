//! Dispatch-layer errors

use labdash_shared::JobStatus;
use thiserror::Error;

/// Errors from a job store backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job store database error: {0}")]
    Database(String),

    #[error("job record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced to dispatch callers
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No live record exists for this identifier
    #[error("no such job: {0}")]
    JobNotFound(String),

    /// The caller stopped waiting; the job keeps running
    #[error("gave up waiting for job {id} (last status: {status})")]
    WaitTimedOut { id: String, status: JobStatus },

    /// An earlier execution of this identifier has not returned yet
    #[error("job {0} is still executing from an earlier run")]
    InFlight(String),

    #[error("worker pool is shut down")]
    QueueClosed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Unresolved because the job does not exist, as opposed to still pending
    pub fn is_not_found(&self) -> bool {
        matches!(self, DispatchError::JobNotFound(_))
    }
}
