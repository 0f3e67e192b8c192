//! Normalized records produced by appliance drivers and stored by the job layer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::now_ms;

/// Placeholder used when an appliance reports no restore history
pub const NONE_FOUND: &str = "None found";

/// Login details for one remote host
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    host: String,
    port: u16,
    username: String,
    secret: String,
}

impl Credentials {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// `host:port` form used for socket connects and log lines
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Restore status of an appliance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub last_restore: String,
    pub restore_id: String,
    pub restore_file: String,
    pub status: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusRecord {
    /// Defaults reported when no restore history exists
    pub fn not_found(host: impl Into<String>) -> Self {
        Self {
            last_restore: NONE_FOUND.into(),
            restore_id: NONE_FOUND.into(),
            restore_file: NONE_FOUND.into(),
            status: NONE_FOUND.into(),
            host: host.into(),
            error: None,
        }
    }

    /// Defaults plus an inline error, for unreachable appliances
    pub fn with_error(host: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::not_found(host)
        }
    }
}

/// Whether a network device still runs its default configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigState {
    Default,
    Configured,
}

impl fmt::Display for ConfigState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigState::Default => write!(f, "default"),
            ConfigState::Configured => write!(f, "configured"),
        }
    }
}

/// Status of one lab network device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub default_cfg_on_flash: Option<bool>,
    #[serde(default)]
    pub status: Option<ConfigState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceStatus {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            default_cfg_on_flash: None,
            status: None,
            error: None,
        }
    }
}

/// How a restore or reset ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// Success marker seen, or device reloaded
    Completed,
    /// Failure marker seen or command rejected
    Failed,
    /// Stopped watching before any marker appeared
    Unknown,
    /// Nothing to do
    Skipped,
}

/// Result of a reset job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOutcome {
    pub target: String,
    pub reset: bool,
    pub outcome: RestoreOutcome,
    pub message: String,
}

impl ResetOutcome {
    pub fn completed(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(target, true, RestoreOutcome::Completed, message)
    }

    pub fn failed(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(target, false, RestoreOutcome::Failed, message)
    }

    pub fn unknown(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(target, false, RestoreOutcome::Unknown, message)
    }

    pub fn skipped(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(target, false, RestoreOutcome::Skipped, message)
    }

    fn build(
        target: impl Into<String>,
        reset: bool,
        outcome: RestoreOutcome,
        message: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            reset,
            outcome,
            message: message.into(),
        }
    }
}

/// Result of backing up a device's running configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOutcome {
    pub target: String,
    pub file: String,
    pub on_flash: bool,
}

/// Payload of a finished job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutput {
    Status(StatusRecord),
    Device(DeviceStatus),
    Reset(ResetOutcome),
    Backup(BackupOutcome),
}

/// Classification of a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    Connection,
    Command,
    /// Watching stopped without a completion marker; outcome is unknown
    TimeoutUnknownOutcome,
    /// An explicit failure marker was seen
    OperationFailed,
    Unsupported,
    Panicked,
    /// Left unfinished by a previous process
    Abandoned,
    Internal,
}

/// Error payload of a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for JobError {}

/// Externally visible job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job state with its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Finished(JobOutput),
    Failed(JobError),
}

/// One entry of the job cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub state: JobState,
    pub created_at_ms: u64,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    #[serde(default)]
    pub finished_at_ms: Option<u64>,
    pub ttl_ms: u64,
    pub timeout_ms: u64,
    /// Dispatcher instance that claimed the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// A live record whose lease lapses is treated as abandoned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until_ms: Option<u64>,
}

impl JobRecord {
    /// Create a freshly enqueued record
    pub fn queued(id: impl Into<String>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            state: JobState::Queued,
            created_at_ms: now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
            ttl_ms: ttl.as_millis() as u64,
            timeout_ms: timeout.as_millis() as u64,
            owner: None,
            lease_until_ms: None,
        }
    }

    /// Hold the record for `owner` until `until` (epoch ms)
    pub fn leased_to(mut self, owner: impl Into<String>, until: u64) -> Self {
        self.owner = Some(owner.into());
        self.lease_until_ms = Some(until);
        self
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Queued => JobStatus::Queued,
            JobState::Running => JobStatus::Running,
            JobState::Finished(_) => JobStatus::Finished,
            JobState::Failed(_) => JobStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn output(&self) -> Option<&JobOutput> {
        match &self.state {
            JobState::Finished(output) => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&JobError> {
        match &self.state {
            JobState::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Terminal records expire `ttl` after they finished; live ones never do
    pub fn expires_at_ms(&self) -> Option<u64> {
        self.finished_at_ms
            .map(|finished| finished.saturating_add(self.ttl_ms))
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at_ms().is_some_and(|at| now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Live, but nobody has renewed its lease since `now`
    pub fn is_lease_lapsed_at(&self, now: u64) -> bool {
        !self.is_terminal() && self.lease_until_ms.map_or(true, |until| now >= until)
    }

    /// Whether a dispatcher may replace this record with a fresh run
    pub fn is_claimable_at(&self, now: u64) -> bool {
        self.is_expired_at(now) || self.is_lease_lapsed_at(now)
    }

    /// Move a queued job to running. Returns false from any other state.
    pub fn mark_running(&mut self, now: u64) -> bool {
        if self.state != JobState::Queued {
            return false;
        }
        self.state = JobState::Running;
        self.started_at_ms = Some(now);
        true
    }

    /// Record the job's result. A terminal record is never overwritten.
    pub fn complete(&mut self, result: Result<JobOutput, JobError>, now: u64) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = match result {
            Ok(output) => JobState::Finished(output),
            Err(err) => JobState::Failed(err),
        };
        self.finished_at_ms = Some(now);
        true
    }
}
