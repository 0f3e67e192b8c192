//! labdash shared types
//!
//! This crate provides the model types, error taxonomy and appliance
//! lifecycle state machine shared by the appliance layer and the job
//! dispatcher.

pub mod error;
pub mod model;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{CommandError, ShellError};
pub use model::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing and sizing parameters for shell sessions and jobs
pub mod timing {
    /// Default TTL for cached status jobs
    pub const STATUS_TTL_SECS: u64 = 60;

    /// Default TTL for reset/restore jobs; outlives a full appliance restore
    pub const RESET_TTL_SECS: u64 = 3600;

    /// How long a caller blocks on a status job before giving up
    pub const STATUS_TIMEOUT_SECS: u64 = 300;

    /// Execution budget for reset jobs
    pub const RESET_TIMEOUT_SECS: u64 = 3600;

    /// Interval at which blocked callers re-read the job store
    pub const JOB_POLL_INTERVAL_MS: u64 = 1000;

    /// A queued or running job whose lease is not renewed within this
    /// window is treated as abandoned by its process
    pub const JOB_LEASE_SECS: u64 = 30;

    /// SSH handshake + shell request budget
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;

    /// Byte budget for a single command response.
    /// Largest observed appliance response is ~11.6 KB.
    pub const COMMAND_READ_BYTES: usize = 20_000;

    /// Initial wait before reading a command response
    pub const COMMAND_READ_WAIT_MS: u64 = 4000;

    /// Byte budget for each poll while waiting on a long-running operation
    pub const COMPLETION_READ_BYTES: usize = 50_000;

    /// Sleep after issuing a device reload before reconnect attempts
    pub const RELOAD_SLEEP_SECS: u64 = 300;

    /// Give up on a reloading device after this long
    pub const RELOAD_TIMEOUT_SECS: u64 = 1200;
}
