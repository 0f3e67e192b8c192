//! Job dispatch for slow, side-effecting appliance operations
//!
//! This crate handles:
//! - Caching job results by a stable identifier with a TTL
//! - Single-flight execution per identifier, across every process sharing
//!   a store, with leases so a dead process does not hold an id forever
//! - A bounded worker pool running enqueued operations
//! - Blocking, fire-and-forget and fan-in waits over jobs

pub mod error;
pub mod job;
pub mod store;

pub use error::{DispatchError, StoreError};
pub use job::{DispatchConfig, Dispatcher, ExpiryTracker, JobBatch, JobSpec, JobTask};
pub use store::{Claim, JobStore, MemoryJobStore, SqliteJobStore};
