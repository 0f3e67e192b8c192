//! Job dispatcher: cached, single-flight execution of appliance operations

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use labdash_shared::{now_ms, timing, JobRecord};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::locks::{InflightSet, KeyedLocks};
use super::worker::{QueuedJob, WorkerPool};
use super::{JobSpec, JobTask};
use crate::error::DispatchError;
use crate::store::{Claim, JobStore};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Identifies one dispatcher among every process sharing a store
fn instance_id() -> String {
    format!(
        "{}-{:x}-{}",
        std::process::id(),
        now_ms(),
        NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
    )
}

/// Worker pool and polling parameters
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Jobs that may wait for a free worker before `enqueue` blocks
    pub queue_capacity: usize,
    /// Interval at which blocked callers re-read the store
    pub poll_interval: Duration,
    /// How long a live record stays held without renewal. Renewed every
    /// third of this while the job is in flight.
    pub lease: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            poll_interval: Duration::from_millis(timing::JOB_POLL_INTERVAL_MS),
            lease: Duration::from_secs(timing::JOB_LEASE_SECS),
        }
    }
}

/// Records for a set of jobs after a fan-in wait
#[derive(Debug, Clone)]
pub struct JobBatch {
    /// Every requested identifier, terminal or not
    pub records: BTreeMap<String, JobRecord>,
    /// Identifiers still queued/running when the wait ended
    pub pending: Vec<String>,
}

impl JobBatch {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Dispatches operations onto the worker pool, keyed by job identifier.
///
/// Single flight holds across every dispatcher sharing the store: a job is
/// only enqueued after [`JobStore::claim`] wins its identifier.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    pool: WorkerPool,
    locks: KeyedLocks,
    inflight: InflightSet,
    owner: Arc<str>,
    poll_interval: Duration,
    lease: Duration,
    renewal: JoinHandle<()>,
}

impl Dispatcher {
    /// Create a dispatcher and spawn its workers and lease renewal
    pub fn new(store: Arc<dyn JobStore>, config: DispatchConfig) -> Self {
        let owner: Arc<str> = instance_id().into();
        let pool = WorkerPool::new(
            config.workers,
            config.queue_capacity,
            store.clone(),
            owner.clone(),
        );
        let inflight = InflightSet::default();
        let renewal = tokio::spawn(renew_leases(
            store.clone(),
            inflight.clone(),
            owner.clone(),
            config.lease,
        ));
        info!(workers = pool.size(), owner = %owner, "dispatcher started");

        Self {
            store,
            pool,
            locks: KeyedLocks::default(),
            inflight,
            owner,
            poll_interval: config.poll_interval,
            lease: config.lease,
            renewal,
        }
    }

    /// Get the backing store
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Owner tag written on the records this dispatcher claims
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Return a cached result, or run `task` and block until it finishes.
    ///
    /// `timeout` bounds both the job's execution and this caller's wait. A
    /// caller that gives up gets [`DispatchError::WaitTimedOut`]; the job is
    /// left running and can be polled by `id`.
    pub async fn run_to_completion(
        &self,
        id: &str,
        task: JobTask,
        timeout: Duration,
        ttl: Duration,
    ) -> Result<JobRecord, DispatchError> {
        let (record, enqueued) = self
            .lookup_or_enqueue(JobSpec::new(id, task, timeout, ttl))
            .await?;

        if record.is_terminal() {
            debug!(job_id = %id, status = %record.status(), "served from cache");
            return Ok(record);
        }

        debug!(job_id = %id, enqueued, "waiting for job");
        // A few extra polls so a job failing at its own deadline is seen
        self.wait_terminal(id, timeout + self.poll_interval * 5).await
    }

    /// Return a cached or live record, or enqueue `task` and return at once
    pub async fn enqueue(
        &self,
        id: &str,
        task: JobTask,
        timeout: Duration,
        ttl: Duration,
    ) -> Result<JobRecord, DispatchError> {
        let (record, _) = self
            .lookup_or_enqueue(JobSpec::new(id, task, timeout, ttl))
            .await?;
        Ok(record)
    }

    /// Enqueue every job without a live record, then wait for all of them.
    ///
    /// Returns when every job is terminal or `timeout` elapses; the batch
    /// always holds a record for each requested identifier.
    pub async fn wait_for_all(
        &self,
        jobs: Vec<JobSpec>,
        timeout: Duration,
    ) -> Result<JobBatch, DispatchError> {
        let mut records = BTreeMap::new();
        let mut pending = Vec::new();

        for spec in jobs {
            let id = spec.id.clone();
            let (record, enqueued) = self.lookup_or_enqueue(spec).await?;
            debug!(job_id = %id, enqueued, status = %record.status(), "fan-out");
            if !record.is_terminal() {
                pending.push(id.clone());
            }
            records.insert(id, record);
        }

        let deadline = Instant::now() + timeout;
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !pending.is_empty() {
            ticker.tick().await;

            let mut still_pending = Vec::with_capacity(pending.len());
            for id in pending {
                match self.store.get(&id).await? {
                    Some(record) if record.is_terminal() => {
                        records.insert(id, record);
                    }
                    Some(record) => {
                        records.insert(id.clone(), record);
                        still_pending.push(id);
                    }
                    None => still_pending.push(id),
                }
            }
            pending = still_pending;

            if Instant::now() >= deadline {
                break;
            }
        }

        if !pending.is_empty() {
            info!(pending = ?pending, "fan-in wait timed out");
        }

        Ok(JobBatch { records, pending })
    }

    /// Look up a job by identifier. Expired records are not found.
    pub async fn job(&self, id: &str) -> Result<JobRecord, DispatchError> {
        match self.store.get(id).await? {
            Some(record) if !record.is_expired() => Ok(record),
            _ => Err(DispatchError::JobNotFound(id.to_string())),
        }
    }

    /// Job lookup rendered as the external status document
    pub async fn job_status(&self, id: &str) -> Result<Value, DispatchError> {
        let record = self.job(id).await?;
        let mut doc = json!({
            "id": record.id,
            "status": record.status(),
        });
        if let Some(output) = record.output() {
            doc["result"] = serde_json::to_value(output).map_err(crate::StoreError::from)?;
        }
        if let Some(err) = record.error() {
            doc["error"] = serde_json::to_value(err).map_err(crate::StoreError::from)?;
        }
        Ok(doc)
    }

    /// Whether an operation for `id` is executing right now
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.inflight.contains(id)
    }

    /// Atomic per identifier: cache lookup, then claim and enqueue on miss.
    ///
    /// Returns the live record and whether this call enqueued it.
    async fn lookup_or_enqueue(&self, spec: JobSpec) -> Result<(JobRecord, bool), DispatchError> {
        let _lock = self.locks.lock(&spec.id).await;

        let existing = self.store.get(&spec.id).await?;
        let in_flight = self.inflight.contains(&spec.id);

        match existing {
            Some(record) if !record.is_claimable_at(now_ms()) => return Ok((record, false)),
            // Expired, but a timed-out earlier run is still executing
            Some(record) if in_flight => return Ok((record, false)),
            None if in_flight => return Err(DispatchError::InFlight(spec.id)),
            _ => {}
        }

        // Hold a queue slot before any record exists, so a caller dropped
        // while the queue is full leaves nothing behind
        let permit = self.pool.reserve().await?;
        let guard = self.inflight.insert(&spec.id);

        let now = now_ms();
        let record = JobRecord::queued(spec.id.clone(), spec.ttl, spec.timeout)
            .leased_to(self.owner.as_ref(), now + self.lease.as_millis() as u64);

        if let Claim::Held(current) = self.store.claim(&record, now).await? {
            debug!(job_id = %spec.id, holder = ?current.owner, "claimed by another dispatcher");
            return Ok((current, false));
        }

        permit.send(QueuedJob {
            guard,
            id: spec.id.clone(),
            task: spec.task,
            timeout: spec.timeout,
        });

        info!(job_id = %spec.id, "job enqueued");
        Ok((record, true))
    }

    /// Poll the store until `id` is terminal or `timeout` elapses
    async fn wait_terminal(&self, id: &str, timeout: Duration) -> Result<JobRecord, DispatchError> {
        let deadline = Instant::now() + timeout;
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let record = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| DispatchError::JobNotFound(id.to_string()))?;

            if record.is_terminal() {
                return Ok(record);
            }

            if Instant::now() >= deadline {
                return Err(DispatchError::WaitTimedOut {
                    id: id.to_string(),
                    status: record.status(),
                });
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

/// Keep the leases of in-flight jobs fresh for as long as the dispatcher lives
async fn renew_leases(
    store: Arc<dyn JobStore>,
    inflight: InflightSet,
    owner: Arc<str>,
    lease: Duration,
) {
    let mut ticker = interval((lease / 3).max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let ids = inflight.snapshot();
        if ids.is_empty() {
            continue;
        }
        let until = now_ms() + lease.as_millis() as u64;
        match store.renew_leases(&owner, &ids, until).await {
            Ok(renewed) => debug!(renewed, "job leases renewed"),
            Err(e) => warn!(error = %e, "failed to renew job leases"),
        }
    }
}
