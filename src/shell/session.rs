//! One interactive command channel to one remote host

use std::time::Duration;

use labdash_shared::{Credentials, ShellError};
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

use crate::transport::{ShellChannel, ShellConnector};

/// Waits shorter than this are treated as zero
const READ_WAIT_FLOOR: Duration = Duration::from_millis(1);

/// An open shell. Not shareable; one command in flight at a time.
pub struct ShellSession {
    host: String,
    channel: Option<Box<dyn ShellChannel>>,
    last_command: Option<String>,
}

impl ShellSession {
    /// Open the remote channel and its interactive shell within `connect_timeout`
    pub async fn connect(
        connector: &dyn ShellConnector,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<Self, ShellError> {
        let channel = match timeout(connect_timeout, connector.connect(credentials)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ShellError::Unreachable {
                    host: credentials.address(),
                    reason: format!("connect timed out after {:?}", connect_timeout),
                })
            }
        };

        debug!(host = %credentials.address(), transport = connector.name(), "shell session open");
        Ok(Self {
            host: credentials.address(),
            channel: Some(channel),
            last_command: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    /// Send one line. A short write closes the session.
    pub async fn send(&mut self, text: &str) -> Result<(), ShellError> {
        let channel = self.channel.as_mut().ok_or(ShellError::NotConnected)?;

        let line = format!("{}\n", text);
        let expected = line.len();
        let written = match channel.write(line.as_bytes()).await {
            Ok(n) => n,
            Err(e) => {
                self.close().await;
                return Err(e);
            }
        };

        if written != expected {
            self.close().await;
            return Err(ShellError::TransportClosed(format!(
                "short write: {} of {} bytes accepted",
                written, expected
            )));
        }

        self.last_command = Some(text.to_string());
        Ok(())
    }

    /// Read up to `max_bytes` of pending output.
    ///
    /// Sleeps `wait` before checking; when nothing is ready the wait is
    /// halved and the check repeated, down to a zero wait. Returns `None`
    /// when no data arrived by then.
    pub async fn read_available(
        &mut self,
        max_bytes: usize,
        wait: Duration,
    ) -> Result<Option<String>, ShellError> {
        let channel = self.channel.as_mut().ok_or(ShellError::NotConnected)?;

        let mut wait = wait;
        loop {
            if !wait.is_zero() {
                sleep(wait).await;
            }

            if let Some(bytes) = channel.try_read(max_bytes) {
                trace!(host = %self.host, len = bytes.len(), "read");
                return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
            }

            if wait.is_zero() {
                return Ok(None);
            }
            wait /= 2;
            if wait < READ_WAIT_FLOOR {
                wait = Duration::ZERO;
            }
        }
    }

    /// Close the channel. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(host = %self.host, error = %e, "error while closing shell");
            }
            debug!(host = %self.host, "shell session closed");
        }
    }
}
