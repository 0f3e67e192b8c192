//! Appliance connect/disconnect lifecycle and command primitives

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use labdash_shared::state_machine::{
    ApplianceState, LifecycleEvent, LifecycleStateMachine, Transition,
};
use labdash_shared::{timing, CommandError, Credentials, ShellError};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::driver::{ApplianceDriver, Markers, PollBudget};
use super::error::ApplianceError;
use crate::shell::ShellSession;
use crate::transport::ShellConnector;

/// Message reported when watching stops before any marker appears
pub const TIMEOUT_UNKNOWN: &str = "timeout, outcome unknown";

const REDACTED: &str = "<redacted>";

/// Read sizes and waits for one appliance's shell
#[derive(Debug, Clone, Copy)]
pub struct ShellTiming {
    pub connect_timeout: Duration,
    /// Initial wait before reading a command response
    pub command_wait: Duration,
    pub command_read_bytes: usize,
    pub completion_read_bytes: usize,
}

impl Default for ShellTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(timing::CONNECT_TIMEOUT_SECS),
            command_wait: Duration::from_millis(timing::COMMAND_READ_WAIT_MS),
            command_read_bytes: timing::COMMAND_READ_BYTES,
            completion_read_bytes: timing::COMPLETION_READ_BYTES,
        }
    }
}

/// Result of watching a long-running operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub success: bool,
    /// No marker was seen before the poll budget ran out
    pub timed_out: bool,
    pub message: String,
    /// Everything read while watching
    pub output: String,
}

/// A remote appliance driven through a shell session
pub struct Appliance {
    name: String,
    credentials: Credentials,
    connector: Arc<dyn ShellConnector>,
    driver: Arc<dyn ApplianceDriver>,
    session: Option<ShellSession>,
    lifecycle: LifecycleStateMachine,
    timing: ShellTiming,
}

impl Appliance {
    pub fn new(
        name: impl Into<String>,
        credentials: Credentials,
        connector: Arc<dyn ShellConnector>,
        driver: Arc<dyn ApplianceDriver>,
    ) -> Self {
        Self {
            name: name.into(),
            credentials,
            connector,
            driver,
            session: None,
            lifecycle: LifecycleStateMachine::new(),
            timing: ShellTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: ShellTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        self.credentials.host()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn driver(&self) -> Arc<dyn ApplianceDriver> {
        self.driver.clone()
    }

    pub fn timing(&self) -> &ShellTiming {
        &self.timing
    }

    pub fn state(&self) -> ApplianceState {
        self.lifecycle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().accepts_commands()
    }

    fn advance(&mut self, event: LifecycleEvent) -> Result<ApplianceState, ApplianceError> {
        match self.lifecycle.process_event(event) {
            Transition::Moved(state) => Ok(state),
            Transition::Invalid { from, event } => {
                Err(ApplianceError::InvalidState { from, event })
            }
        }
    }

    /// Run `before_connect`, open the shell, then run `after_connect`.
    ///
    /// A failing `after_connect` tears the session down again.
    pub async fn connect(&mut self) -> Result<(), ApplianceError> {
        self.advance(LifecycleEvent::ConnectRequested)?;
        let driver = self.driver.clone();
        info!(appliance = %self.name, kind = driver.kind(), host = %self.credentials.address(), "connecting");

        if let Err(e) = driver.before_connect(self).await {
            self.advance(LifecycleEvent::ConnectFailed)?;
            return Err(e);
        }

        let opened = ShellSession::connect(
            self.connector.as_ref(),
            &self.credentials,
            self.timing.connect_timeout,
        )
        .await;
        match opened {
            Ok(session) => self.session = Some(session),
            Err(e) => {
                warn!(appliance = %self.name, error = %e, "connect failed");
                self.advance(LifecycleEvent::ConnectFailed)?;
                return Err(e.into());
            }
        }
        self.advance(LifecycleEvent::ConnectSucceeded)?;

        if let Err(e) = driver.after_connect(self).await {
            warn!(appliance = %self.name, error = %e, "after_connect hook failed");
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Log out and close the session. The session is closed on every path;
    /// hook failures are logged. A no-op when not connected.
    pub async fn disconnect(&mut self) {
        let driver = self.driver.clone();

        if self.is_connected() {
            if let Err(e) = driver.before_disconnect(self).await {
                debug!(appliance = %self.name, error = %e, "before_disconnect hook failed");
            }
        }

        if self.advance(LifecycleEvent::DisconnectRequested).is_err() {
            // Never connected; nothing to tear down
            return;
        }

        if let Some(mut session) = self.session.take() {
            session.close().await;
        }

        if let Err(e) = driver.after_disconnect(self).await {
            debug!(appliance = %self.name, error = %e, "after_disconnect hook failed");
        }
        let _ = self.advance(LifecycleEvent::DisconnectCompleted);
        info!(appliance = %self.name, "disconnected");
    }

    /// Connect, run `f`, and disconnect whatever `f` returned
    pub async fn with_session<T, F>(&mut self, f: F) -> Result<T, ApplianceError>
    where
        F: for<'a> FnOnce(&'a mut Appliance) -> BoxFuture<'a, Result<T, ApplianceError>>,
    {
        self.connect().await?;
        let result = f(self).await;
        self.disconnect().await;
        result
    }

    fn session_mut(&mut self, command: &str) -> Result<&mut ShellSession, CommandError> {
        if !self.is_connected() {
            return Err(CommandError::new(command, ShellError::NotConnected));
        }
        self.session
            .as_mut()
            .ok_or_else(|| CommandError::new(command, ShellError::NotConnected))
    }

    /// Send a line without reading a response
    pub async fn send_line(&mut self, text: &str) -> Result<(), CommandError> {
        debug!(appliance = %self.name, command = text, "send");
        self.session_mut(text)?
            .send(text)
            .await
            .map_err(|e| CommandError::new(text, e))
    }

    /// Send `cmd` and capture its output. Missing output is an empty string.
    pub async fn send_command(&mut self, cmd: &str) -> Result<String, CommandError> {
        self.round_trip(cmd, cmd).await
    }

    /// Like [`Appliance::send_command`], but the text never reaches logs or errors
    pub async fn send_secret(&mut self, secret: &str) -> Result<String, CommandError> {
        self.round_trip(secret, REDACTED).await
    }

    /// Send `cmd`, showing `shown` in its place in logs and errors
    pub async fn send_masked(&mut self, cmd: &str, shown: &str) -> Result<String, CommandError> {
        self.round_trip(cmd, shown).await
    }

    async fn round_trip(&mut self, text: &str, shown: &str) -> Result<String, CommandError> {
        let wait = self.timing.command_wait;
        let budget = self.timing.command_read_bytes;
        let name = self.name.clone();

        let session = self.session_mut(shown)?;
        debug!(appliance = %name, command = shown, "send command");
        session
            .send(text)
            .await
            .map_err(|e| CommandError::new(shown, e))?;
        let output = session
            .read_available(budget, wait)
            .await
            .map_err(|e| CommandError::new(shown, e))?
            .unwrap_or_default();

        debug!(appliance = %name, command = shown, bytes = output.len(), "response");
        Ok(output)
    }

    /// Read whatever is pending without sending anything
    pub async fn read_pending(&mut self) -> Result<String, CommandError> {
        let wait = self.timing.command_wait;
        let budget = self.timing.command_read_bytes;
        let session = self.session_mut("<read>")?;
        Ok(session
            .read_available(budget, wait)
            .await
            .map_err(|e| CommandError::new("<read>", e))?
            .unwrap_or_default())
    }

    /// Watch output until `success` or `failure` appears or the budget runs out.
    ///
    /// Text accumulates across polls so a marker split between reads is
    /// still found. If both markers are present the earlier one wins.
    pub async fn wait_for_completion(
        &mut self,
        success: &str,
        failure: &str,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Result<Completion, CommandError> {
        let budget = self.timing.completion_read_bytes;
        let name = self.name.clone();
        let mut seen = String::new();

        for poll in 1..=max_polls {
            sleep(poll_interval).await;

            let session = self.session_mut("<wait>")?;
            if let Some(chunk) = session
                .read_available(budget, Duration::ZERO)
                .await
                .map_err(|e| CommandError::new("<wait>", e))?
            {
                seen.push_str(&chunk);
            }

            let outcome = match (seen.find(success), seen.find(failure)) {
                (Some(s), Some(f)) => Some(s < f),
                (Some(_), None) => Some(true),
                (None, Some(_)) => Some(false),
                (None, None) => None,
            };

            if let Some(succeeded) = outcome {
                debug!(appliance = %name, poll, succeeded, "completion marker seen");
                let message = if succeeded {
                    format!("completed: found \"{}\"", success)
                } else {
                    format!("failed: found \"{}\"", failure)
                };
                return Ok(Completion {
                    success: succeeded,
                    timed_out: false,
                    message,
                    output: seen,
                });
            }
            debug!(appliance = %name, poll, max_polls, "no completion marker yet");
        }

        warn!(appliance = %name, max_polls, "stopped watching, outcome unknown");
        Ok(Completion {
            success: false,
            timed_out: true,
            message: TIMEOUT_UNKNOWN.to_string(),
            output: seen,
        })
    }

    /// [`Appliance::wait_for_completion`] with the driver's markers and budget
    pub async fn wait_for_markers(
        &mut self,
        markers: &Markers,
        budget: PollBudget,
    ) -> Result<Completion, CommandError> {
        self.wait_for_completion(
            &markers.success,
            &markers.failure,
            budget.interval,
            budget.max_polls,
        )
        .await
    }
}
