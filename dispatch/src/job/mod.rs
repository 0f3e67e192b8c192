//! Job dispatch and expiry tracking
//!
//! This module handles:
//! - Looking up cached results by job identifier
//! - Enqueuing operations on the worker pool on a cache miss
//! - Blocking and fan-in waits over job records
//! - Purging expired records

mod dispatcher;
mod locks;
mod timeout;
mod worker;

pub use dispatcher::{DispatchConfig, Dispatcher, JobBatch};
pub use timeout::ExpiryTracker;

use futures::future::BoxFuture;
use labdash_shared::{JobError, JobOutput};
use std::future::Future;
use std::time::Duration;

/// Boxed future produced by a job task
pub type JobFuture = BoxFuture<'static, Result<JobOutput, JobError>>;

/// A deferred operation; built per request, run at most once by a worker
pub struct JobTask(Box<dyn FnOnce() -> JobFuture + Send>);

impl JobTask {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutput, JobError>> + Send + 'static,
    {
        Self(Box::new(move || Box::pin(f())))
    }

    pub(crate) fn run(self) -> JobFuture {
        (self.0)()
    }
}

impl std::fmt::Debug for JobTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JobTask")
    }
}

/// A job identifier with its task and cache policy
#[derive(Debug)]
pub struct JobSpec {
    pub id: String,
    pub task: JobTask,
    /// Execution budget; past it the job is reported as outcome unknown
    pub timeout: Duration,
    /// How long a finished result stays cached
    pub ttl: Duration,
}

impl JobSpec {
    pub fn new(id: impl Into<String>, task: JobTask, timeout: Duration, ttl: Duration) -> Self {
        Self {
            id: id.into(),
            task,
            timeout,
            ttl,
        }
    }
}
