//! Per-appliance policy: commands, markers, parsers and lifecycle hooks

use std::time::Duration;

use async_trait::async_trait;
use labdash_shared::{CommandError, ResetOutcome, StatusRecord};
use serde::{Deserialize, Serialize};

use super::error::ApplianceError;
use super::lifecycle::Appliance;

/// Substrings that end a long-running operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub success: String,
    pub failure: String,
}

impl Markers {
    pub fn new(success: impl Into<String>, failure: impl Into<String>) -> Self {
        Self {
            success: success.into(),
            failure: failure.into(),
        }
    }
}

/// How long to watch a long-running operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub interval: Duration,
    pub max_polls: u32,
}

impl PollBudget {
    pub fn new(interval: Duration, max_polls: u32) -> Self {
        Self {
            interval,
            max_polls,
        }
    }

    /// Upper bound on time spent watching
    pub fn total(&self) -> Duration {
        self.interval * self.max_polls
    }
}

/// Per-appliance replacements for driver defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverOverrides {
    #[serde(default)]
    pub status_command: Option<String>,
    #[serde(default)]
    pub success_marker: Option<String>,
    #[serde(default)]
    pub failure_marker: Option<String>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub max_polls: Option<u32>,
}

impl DriverOverrides {
    pub(crate) fn status_command(&self, default: &str) -> String {
        self.status_command
            .clone()
            .unwrap_or_else(|| default.to_string())
    }

    pub(crate) fn markers(&self, success: &str, failure: &str) -> Markers {
        Markers::new(
            self.success_marker.as_deref().unwrap_or(success),
            self.failure_marker.as_deref().unwrap_or(failure),
        )
    }

    pub(crate) fn budget(&self, default: PollBudget) -> PollBudget {
        PollBudget {
            interval: self
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(default.interval),
            max_polls: self.max_polls.unwrap_or(default.max_polls),
        }
    }
}

/// Which backup a restore should apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreArgs {
    BackupId(String),
    File {
        file: String,
        repository: String,
        key: String,
    },
    Path(String),
}

/// Policy object for one appliance type.
///
/// The hooks run inside [`Appliance::connect`] and
/// [`Appliance::disconnect`]; `after_connect` and `before_disconnect` run
/// while the appliance accepts commands.
#[async_trait]
pub trait ApplianceDriver: Send + Sync {
    /// Short type name used in logs
    fn kind(&self) -> &'static str;

    /// Command whose output `parse_status` understands
    fn status_command(&self) -> &str;

    /// Parse probe output. No match yields [`StatusRecord::not_found`].
    fn parse_status(&self, host: &str, output: &str) -> StatusRecord;

    /// Restore command text for `args`
    fn restore_command(&self, args: &RestoreArgs) -> Result<String, ApplianceError>;

    /// How the restore command appears in logs and errors
    fn restore_display(&self, command: &str) -> String {
        command.to_string()
    }

    fn markers(&self) -> &Markers;

    fn poll_budget(&self) -> PollBudget;

    /// Sent before the session closes; `None` skips logout
    fn logout_command(&self) -> Option<&str> {
        Some("exit")
    }

    async fn before_connect(&self, _appliance: &mut Appliance) -> Result<(), ApplianceError> {
        Ok(())
    }

    async fn after_connect(&self, _appliance: &mut Appliance) -> Result<(), ApplianceError> {
        Ok(())
    }

    async fn before_disconnect(&self, appliance: &mut Appliance) -> Result<(), ApplianceError> {
        if let Some(logout) = self.logout_command() {
            appliance.send_line(logout).await?;
        }
        Ok(())
    }

    async fn after_disconnect(&self, _appliance: &mut Appliance) -> Result<(), ApplianceError> {
        Ok(())
    }

    /// Answer interactive prompts found in `output`; returns the final output
    async fn answer_prompts(
        &self,
        _appliance: &mut Appliance,
        output: String,
    ) -> Result<String, CommandError> {
        Ok(output)
    }

    /// Answer the prompts a restore command raises. Drivers whose restore
    /// must prompt fail here when it does not.
    async fn answer_restore_prompts(
        &self,
        appliance: &mut Appliance,
        output: String,
    ) -> Result<String, ApplianceError> {
        Ok(self.answer_prompts(appliance, output).await?)
    }

    /// Checks run before a restore is issued. `Some` ends the restore early.
    async fn pre_restore(
        &self,
        _appliance: &mut Appliance,
        _args: &RestoreArgs,
    ) -> Result<Option<ResetOutcome>, ApplianceError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_fall_back_to_defaults() {
        let overrides = DriverOverrides {
            success_marker: Some("ALL DONE".into()),
            poll_interval_secs: Some(5),
            ..Default::default()
        };

        let markers = overrides.markers("ok", "bad");
        assert_eq!(markers, Markers::new("ALL DONE", "bad"));

        let budget = overrides.budget(PollBudget::new(Duration::from_secs(30), 10));
        assert_eq!(budget.interval, Duration::from_secs(5));
        assert_eq!(budget.max_polls, 10);
        assert_eq!(budget.total(), Duration::from_secs(50));
        assert_eq!(overrides.status_command("show clock"), "show clock");
    }
}
