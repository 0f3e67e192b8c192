//! Error taxonomy for shell sessions and appliance commands

use thiserror::Error;

use crate::model::{JobError, JobErrorKind};

/// Errors raised while opening or using a shell session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShellError {
    #[error("authentication failed for {username}@{host}")]
    AuthFailure { host: String, username: String },

    #[error("host unreachable: {host}: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("shell session is not connected")]
    NotConnected,

    #[error("transport closed: {0}")]
    TransportClosed(String),
}

impl ShellError {
    /// Connection-class errors end the session; the caller must reconnect
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ShellError::AuthFailure { .. }
                | ShellError::Unreachable { .. }
                | ShellError::TransportClosed(_)
        )
    }
}

/// A single send/receive round trip failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("command `{command}` failed: {source}")]
pub struct CommandError {
    pub command: String,
    #[source]
    pub source: ShellError,
}

impl CommandError {
    pub fn new(command: impl Into<String>, source: ShellError) -> Self {
        Self {
            command: command.into(),
            source,
        }
    }
}

impl From<ShellError> for JobError {
    fn from(err: ShellError) -> Self {
        let kind = match err {
            ShellError::NotConnected | ShellError::Protocol(_) => JobErrorKind::Command,
            _ => JobErrorKind::Connection,
        };
        JobError::new(kind, err.to_string())
    }
}

impl From<CommandError> for JobError {
    fn from(err: CommandError) -> Self {
        if err.source.is_connection_error() {
            JobError::new(JobErrorKind::Connection, err.to_string())
        } else {
            JobError::new(JobErrorKind::Command, err.to_string())
        }
    }
}
