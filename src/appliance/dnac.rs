//! DNA Center: maglev restore history and restore apply

use std::time::Duration;

use async_trait::async_trait;
use labdash_shared::{CommandError, StatusRecord};
use tracing::debug;

use super::driver::{ApplianceDriver, DriverOverrides, Markers, PollBudget, RestoreArgs};
use super::error::ApplianceError;
use super::lifecycle::Appliance;

const HISTORY_COMMAND: &str = "maglev restore history";
const FINALIZE_STEP: &str = "RESTORE.FINALIZE_RESTORE";

/// maglev asks for the cluster admin credentials before some commands
const USERNAME_PROMPT: &str = "[administration] username for";
const PASSWORD_PROMPT: &str = "password for";

pub struct DnacDriver {
    status_command: String,
    markers: Markers,
    budget: PollBudget,
}

impl DnacDriver {
    pub fn new(overrides: &DriverOverrides) -> Self {
        Self {
            status_command: overrides.status_command(HISTORY_COMMAND),
            markers: overrides.markers("Restore completed successfully", "Restore failed"),
            budget: overrides.budget(PollBudget::new(Duration::from_secs(30), 240)),
        }
    }
}

#[async_trait]
impl ApplianceDriver for DnacDriver {
    fn kind(&self) -> &'static str {
        "dnac"
    }

    fn status_command(&self) -> &str {
        &self.status_command
    }

    /// Uses the last finalize line: `<date> <time> <restore id> <step> <status>`
    fn parse_status(&self, host: &str, output: &str) -> StatusRecord {
        let Some(line) = output.lines().rev().find(|l| l.contains(FINALIZE_STEP)) else {
            return StatusRecord::not_found(host);
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [date, time, restore_id, _step, status, ..] => StatusRecord {
                last_restore: format!("{} {}", date, time),
                restore_id: restore_id.to_string(),
                status: status.to_string(),
                ..StatusRecord::not_found(host)
            },
            _ => StatusRecord::not_found(host),
        }
    }

    fn restore_command(&self, args: &RestoreArgs) -> Result<String, ApplianceError> {
        match args {
            RestoreArgs::BackupId(id) => Ok(format!("maglev restore apply {}", id)),
            other => Err(ApplianceError::Unsupported(format!(
                "dnac restores by backup id, got {:?}",
                other
            ))),
        }
    }

    fn markers(&self) -> &Markers {
        &self.markers
    }

    fn poll_budget(&self) -> PollBudget {
        self.budget
    }

    async fn answer_prompts(
        &self,
        appliance: &mut Appliance,
        output: String,
    ) -> Result<String, CommandError> {
        let mut output = output;
        if output.contains(USERNAME_PROMPT) {
            debug!(appliance = appliance.name(), "answering maglev username prompt");
            let username = appliance.credentials().username().to_string();
            output = appliance.send_command(&username).await?;
        }
        if output.contains(PASSWORD_PROMPT) {
            debug!(appliance = appliance.name(), "answering maglev password prompt");
            let secret = appliance.credentials().secret().to_string();
            output = appliance.send_secret(&secret).await?;
        }
        Ok(output)
    }

    /// `maglev restore apply` always asks for the admin password first
    async fn answer_restore_prompts(
        &self,
        appliance: &mut Appliance,
        output: String,
    ) -> Result<String, ApplianceError> {
        let mut output = output;
        if output.contains(USERNAME_PROMPT) {
            let username = appliance.credentials().username().to_string();
            output = appliance.send_command(&username).await?;
        }
        if !output.contains(PASSWORD_PROMPT) {
            return Err(ApplianceError::OperationFailed(format!(
                "restore on {} did not prompt for the admin password: {}",
                appliance.name(),
                output.trim()
            )));
        }
        Ok(self.answer_prompts(appliance, output).await?)
    }
}
