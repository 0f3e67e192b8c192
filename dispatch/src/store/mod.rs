//! Job cache backends
//!
//! A store maps job identifiers to [`JobRecord`]s. Stores persist records as
//! given; expiry is a property of the record and is interpreted by the
//! dispatcher, except in [`JobStore::purge_expired`] and [`JobStore::claim`].
//!
//! Several dispatchers, in one process or many, may share a store. A live
//! record belongs to the dispatcher named in its `owner` for as long as that
//! dispatcher keeps renewing its lease.

mod memory;
mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use labdash_shared::{JobError, JobErrorKind, JobRecord};

use crate::error::StoreError;

/// Result of [`JobStore::claim`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The record was written; the caller must run the job
    Acquired,
    /// Another live or cached record holds the identifier
    Held(JobRecord),
}

/// Durable mapping from job identifier to job record
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fetch a record, including expired ones
    async fn get(&self, id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Insert or replace a record unconditionally
    async fn put(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Atomically write `record` unless the identifier is held by a record
    /// that is not [claimable](JobRecord::is_claimable_at) at `now_ms`.
    async fn claim(&self, record: &JobRecord, now_ms: u64) -> Result<Claim, StoreError>;

    /// Replace the stored record only while it is live and still owned by
    /// `record.owner`. Returns whether the write happened.
    async fn update_owned(&self, record: &JobRecord) -> Result<bool, StoreError>;

    /// Extend the lease of every live record in `ids` held by `owner`.
    /// Returns how many were renewed.
    async fn renew_leases(
        &self,
        owner: &str,
        ids: &[String],
        until_ms: u64,
    ) -> Result<usize, StoreError>;

    /// Delete a record. Returns whether one existed.
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;

    /// Delete every record expired at `now_ms` and return their ids
    async fn purge_expired(&self, now_ms: u64) -> Result<Vec<String>, StoreError>;

    /// All stored records, ordered by id
    async fn list(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Fail every live record whose lease lapsed by `now_ms`. Records still
    /// renewed by a running dispatcher are left alone.
    async fn recover_abandoned(&self, now_ms: u64) -> Result<Vec<String>, StoreError>;
}

/// Mark a lapsed record failed. Returns false when it is not lapsed.
pub(crate) fn abandon(record: &mut JobRecord, now_ms: u64) -> bool {
    if !record.is_lease_lapsed_at(now_ms) {
        return false;
    }
    let err = JobError::new(
        JobErrorKind::Abandoned,
        "job was still pending when its dispatcher went away",
    );
    record.complete(Err(err), now_ms)
}
