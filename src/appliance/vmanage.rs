//! vManage: NMS configuration-db status and restore from a path

use std::time::Duration;

use async_trait::async_trait;
use labdash_shared::StatusRecord;

use super::driver::{ApplianceDriver, DriverOverrides, Markers, PollBudget, RestoreArgs};
use super::error::ApplianceError;
use super::lifecycle::Appliance;

const STATUS_COMMAND: &str = "request nms configuration-db status";
const STATUS_FIELD: &str = "Status:";
const LAST_RESTORE_FIELD: &str = "Last restore:";

pub struct VmanageDriver {
    status_command: String,
    markers: Markers,
    budget: PollBudget,
}

impl VmanageDriver {
    pub fn new(overrides: &DriverOverrides) -> Self {
        Self {
            status_command: overrides.status_command(STATUS_COMMAND),
            markers: overrides.markers("Successfully restored database", "Failed to restore"),
            budget: overrides.budget(PollBudget::new(Duration::from_secs(30), 40)),
        }
    }
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (_, value) = line.split_once(name)?;
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

#[async_trait]
impl ApplianceDriver for VmanageDriver {
    fn kind(&self) -> &'static str {
        "vmanage"
    }

    fn status_command(&self) -> &str {
        &self.status_command
    }

    fn parse_status(&self, host: &str, output: &str) -> StatusRecord {
        let Some(status) = output.lines().find_map(|l| field(l, STATUS_FIELD)) else {
            return StatusRecord::not_found(host);
        };

        let mut record = StatusRecord {
            status: status.to_string(),
            ..StatusRecord::not_found(host)
        };

        if let Some(when) = output.lines().find_map(|l| field(l, LAST_RESTORE_FIELD)) {
            record.last_restore = when.to_string();
        }
        let restore_path = output
            .lines()
            .filter(|l| l.to_ascii_lowercase().contains("restor"))
            .flat_map(str::split_whitespace)
            .find(|token| token.starts_with('/'));
        if let Some(path) = restore_path {
            record.restore_file = path.to_string();
        }
        record
    }

    fn restore_command(&self, args: &RestoreArgs) -> Result<String, ApplianceError> {
        match args {
            RestoreArgs::Path(path) => Ok(format!(
                "request nms configuration-db restore path {}",
                path
            )),
            other => Err(ApplianceError::Unsupported(format!(
                "vmanage restores from a path, got {:?}",
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

    /// The prompt only appears after a first newline
    async fn after_connect(&self, appliance: &mut Appliance) -> Result<(), ApplianceError> {
        appliance.send_command("").await?;
        Ok(())
    }
}
