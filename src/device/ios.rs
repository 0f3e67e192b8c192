//! IOS driver: paging off after login, `exit` before logout

use std::time::Duration;

use async_trait::async_trait;
use labdash_shared::StatusRecord;

use crate::appliance::{
    Appliance, ApplianceDriver, ApplianceError, Markers, PollBudget, RestoreArgs,
};

pub const COPY_DONE: &str = "bytes copied";
pub const COPY_ERROR: &str = "%Error";

pub struct IosDriver {
    markers: Markers,
    budget: PollBudget,
}

impl IosDriver {
    pub fn new() -> Self {
        Self {
            markers: Markers::new(COPY_DONE, COPY_ERROR),
            budget: PollBudget::new(Duration::from_secs(2), 30),
        }
    }

    /// Budget for watching a `copy` finish
    pub fn with_copy_budget(mut self, budget: PollBudget) -> Self {
        self.budget = budget;
        self
    }
}

impl Default for IosDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApplianceDriver for IosDriver {
    fn kind(&self) -> &'static str {
        "ios"
    }

    fn status_command(&self) -> &str {
        "show version"
    }

    fn parse_status(&self, host: &str, output: &str) -> StatusRecord {
        match output.lines().map(str::trim).find(|l| l.contains("Version")) {
            Some(line) => StatusRecord {
                status: line.to_string(),
                ..StatusRecord::not_found(host)
            },
            None => StatusRecord::not_found(host),
        }
    }

    fn restore_command(&self, _args: &RestoreArgs) -> Result<String, ApplianceError> {
        Err(ApplianceError::Unsupported(
            "network devices are reset by copy and reload".into(),
        ))
    }

    fn markers(&self) -> &Markers {
        &self.markers
    }

    fn poll_budget(&self) -> PollBudget {
        self.budget
    }

    async fn after_connect(&self, appliance: &mut Appliance) -> Result<(), ApplianceError> {
        appliance.send_command("terminal length 0").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_line() {
        let out = "show version\nCisco IOS XE Software, Version 17.03.04a\nCisco IOS Software [Amsterdam]\n";
        let rec = IosDriver::new().parse_status("10.0.0.5", out);
        assert_eq!(rec.status, "Cisco IOS XE Software, Version 17.03.04a");
        assert!(IosDriver::new()
            .restore_command(&RestoreArgs::Path("flash:/x".into()))
            .is_err());
    }
}
