//! Appliance without restore support; reports the first line of a probe

use std::time::Duration;

use async_trait::async_trait;
use labdash_shared::StatusRecord;

use super::driver::{ApplianceDriver, DriverOverrides, Markers, PollBudget, RestoreArgs};
use super::error::ApplianceError;

const DEFAULT_PROBE: &str = "show version";

pub struct GenericDriver {
    status_command: String,
    markers: Markers,
    budget: PollBudget,
}

impl GenericDriver {
    pub fn new(overrides: &DriverOverrides) -> Self {
        Self {
            status_command: overrides.status_command(DEFAULT_PROBE),
            markers: overrides.markers("SUCCESS", "FAILURE"),
            budget: overrides.budget(PollBudget::new(Duration::from_secs(10), 6)),
        }
    }
}

#[async_trait]
impl ApplianceDriver for GenericDriver {
    fn kind(&self) -> &'static str {
        "generic"
    }

    fn status_command(&self) -> &str {
        &self.status_command
    }

    fn parse_status(&self, host: &str, output: &str) -> StatusRecord {
        let line = output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && *line != self.status_command);

        match line {
            Some(line) => StatusRecord {
                status: line.to_string(),
                ..StatusRecord::not_found(host)
            },
            None => StatusRecord::not_found(host),
        }
    }

    fn restore_command(&self, _args: &RestoreArgs) -> Result<String, ApplianceError> {
        Err(ApplianceError::Unsupported(
            "generic appliances cannot be restored".into(),
        ))
    }

    fn markers(&self) -> &Markers {
        &self.markers
    }

    fn poll_budget(&self) -> PollBudget {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_skips_echo_and_blank_lines() {
        let driver = GenericDriver::new(&DriverOverrides::default());
        let out = "show version\r\n\r\nCisco IOS XE Software, Version 17.03.04a\r\nuptime is 2 weeks\r\n";
        let rec = driver.parse_status("10.9.9.9", out);
        assert_eq!(rec.status, "Cisco IOS XE Software, Version 17.03.04a");
        assert_eq!(rec.host, "10.9.9.9");
        assert_eq!(rec.last_restore, labdash_shared::NONE_FOUND);
    }

    #[test]
    fn test_empty_output_is_not_found() {
        let driver = GenericDriver::new(&DriverOverrides {
            status_command: Some("uptime".into()),
            ..Default::default()
        });
        assert_eq!(driver.status_command(), "uptime");
        assert_eq!(driver.parse_status("h", "uptime\n\n"), StatusRecord::not_found("h"));
    }

    #[test]
    fn test_restore_unsupported() {
        let driver = GenericDriver::new(&DriverOverrides::default());
        let err = driver
            .restore_command(&RestoreArgs::BackupId("x".into()))
            .unwrap_err();
        assert!(matches!(err, ApplianceError::Unsupported(_)));
    }
}
