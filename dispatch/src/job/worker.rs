//! Bounded worker pool executing enqueued jobs

use std::sync::Arc;
use std::time::Duration;

use labdash_shared::{now_ms, JobError, JobErrorKind, JobOutput, JobRecord};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::locks::InflightGuard;
use super::JobTask;
use crate::error::DispatchError;
use crate::store::JobStore;

/// A job handed to the pool
pub(crate) struct QueuedJob {
    pub id: String,
    pub task: JobTask,
    pub timeout: Duration,
    pub guard: InflightGuard,
}

/// Fixed set of worker tasks draining one queue
pub(crate) struct WorkerPool {
    queue_tx: mpsc::Sender<QueuedJob>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers that only touch records held by `owner`.
    /// Must be called inside a tokio runtime.
    pub(crate) fn new(
        size: usize,
        capacity: usize,
        store: Arc<dyn JobStore>,
        owner: Arc<str>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel::<QueuedJob>(capacity.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let workers = (0..size.max(1))
            .map(|worker_id| {
                let queue_rx = queue_rx.clone();
                let store = store.clone();
                let owner = owner.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, queue_rx, store, owner).await;
                })
            })
            .collect();

        Self { queue_tx, workers }
    }

    /// Wait for room in the queue. Sending on the permit cannot block or fail.
    pub(crate) async fn reserve(&self) -> Result<mpsc::Permit<'_, QueuedJob>, DispatchError> {
        self.queue_tx
            .reserve()
            .await
            .map_err(|_| DispatchError::QueueClosed)
    }

    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue_rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    store: Arc<dyn JobStore>,
    owner: Arc<str>,
) {
    debug!(worker_id, "worker started");
    loop {
        let job = queue_rx.lock().await.recv().await;
        match job {
            Some(job) => execute(worker_id, job, store.as_ref(), &owner).await,
            None => {
                debug!(worker_id, "queue closed, worker exiting");
                break;
            }
        }
    }
}

/// Run one job and record its outcome. A record this dispatcher no longer
/// holds is neither run nor written.
async fn execute(worker_id: usize, job: QueuedJob, store: &dyn JobStore, owner: &str) {
    let QueuedJob {
        id,
        task,
        timeout,
        guard,
    } = job;

    if !update_record(store, owner, &id, |r| r.mark_running(now_ms())).await {
        warn!(worker_id, job_id = %id, "job record not held by this dispatcher, skipping");
        return;
    }
    info!(worker_id, job_id = %id, "job started");

    // The operation runs in its own task so a panic is contained and a
    // timed-out operation is left to finish rather than aborted. The
    // in-flight guard travels with it.
    let handle = tokio::spawn(async move {
        let _guard = guard;
        task.run().await
    });

    let result: Result<JobOutput, JobError> = match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => {
            error!(worker_id, job_id = %id, "job panicked");
            Err(JobError::new(JobErrorKind::Panicked, "job panicked"))
        }
        Ok(Err(join_err)) => Err(JobError::new(JobErrorKind::Internal, join_err.to_string())),
        Err(_) => {
            warn!(worker_id, job_id = %id, ?timeout, "job exceeded its timeout, detaching");
            Err(JobError::new(
                JobErrorKind::TimeoutUnknownOutcome,
                format!("job exceeded {}s, outcome unknown", timeout.as_secs_f64()),
            ))
        }
    };

    match &result {
        Ok(_) => info!(worker_id, job_id = %id, "job finished"),
        Err(e) => warn!(worker_id, job_id = %id, error = %e, "job failed"),
    }

    if !update_record(store, owner, &id, |r| r.complete(result, now_ms())).await {
        error!(worker_id, job_id = %id, "job result discarded, record no longer held");
    }
}

/// Read, modify and conditionally write back a record held by `owner`.
/// Returns whether the change was stored.
async fn update_record<F>(store: &dyn JobStore, owner: &str, id: &str, apply: F) -> bool
where
    F: FnOnce(&mut JobRecord) -> bool,
{
    let mut record = match store.get(id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(job_id = %id, "job record vanished before update");
            return false;
        }
        Err(e) => {
            error!(job_id = %id, error = %e, "failed to read job record");
            return false;
        }
    };

    if record.owner.as_deref() != Some(owner) {
        debug!(job_id = %id, holder = ?record.owner, "record held by another dispatcher");
        return false;
    }

    if !apply(&mut record) {
        debug!(job_id = %id, status = %record.status(), "record not updated");
        return false;
    }

    match store.update_owned(&record).await {
        Ok(written) => written,
        Err(e) => {
            error!(job_id = %id, error = %e, "failed to write job record");
            false
        }
    }
}
