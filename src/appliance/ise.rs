//! Identity Services Engine: restore from a repository with an encryption key

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use labdash_shared::{ResetOutcome, StatusRecord, NONE_FOUND};
use regex::Regex;
use tracing::{info, warn};

use super::driver::{ApplianceDriver, DriverOverrides, Markers, PollBudget, RestoreArgs};
use super::error::ApplianceError;
use super::lifecycle::Appliance;

const HISTORY_COMMAND: &str = "show restore history";
const RESUME_PROMPT: &str = "press <Enter> to start a new one";
pub const MISSING_BACKUP: &str = "Backup file doesn't exist.";

/// `[<when>: ]restore <file> from repository <repo>: <status>`
static HISTORY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?P<when>.+?):\s+)?restore\s+(?P<file>\S+)\s+from\s+repository\s+(?P<repo>\S+?):\s*(?P<status>.+?)\s*$",
    )
    .expect("valid restore history pattern")
});

pub struct IseDriver {
    status_command: String,
    markers: Markers,
    budget: PollBudget,
}

impl IseDriver {
    pub fn new(overrides: &DriverOverrides) -> Self {
        Self {
            status_command: overrides.status_command(HISTORY_COMMAND),
            markers: overrides.markers("Application restore completed", "restore failed"),
            budget: overrides.budget(PollBudget::new(Duration::from_secs(60), 60)),
        }
    }
}

#[async_trait]
impl ApplianceDriver for IseDriver {
    fn kind(&self) -> &'static str {
        "ise"
    }

    fn status_command(&self) -> &str {
        &self.status_command
    }

    fn parse_status(&self, host: &str, output: &str) -> StatusRecord {
        let Some(caps) = output.lines().rev().find_map(|l| HISTORY_LINE.captures(l)) else {
            return StatusRecord::not_found(host);
        };

        StatusRecord {
            last_restore: caps
                .name("when")
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_else(|| NONE_FOUND.to_string()),
            restore_file: caps["file"].to_string(),
            status: caps["status"].to_string(),
            ..StatusRecord::not_found(host)
        }
    }

    fn restore_command(&self, args: &RestoreArgs) -> Result<String, ApplianceError> {
        match args {
            RestoreArgs::File {
                file,
                repository,
                key,
            } => Ok(format!(
                "restore {} repository {} encryption-key plain {}",
                file, repository, key
            )),
            other => Err(ApplianceError::Unsupported(format!(
                "ise restores from a repository file, got {:?}",
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

    /// Dismiss the resume-session prompt and disable paging
    async fn after_connect(&self, appliance: &mut Appliance) -> Result<(), ApplianceError> {
        let banner = appliance.read_pending().await?;
        if banner.contains(RESUME_PROMPT) {
            info!(appliance = appliance.name(), "starting a new cli session");
            appliance.send_command("").await?;
        }
        appliance.send_command("terminal length 0").await?;
        Ok(())
    }

    /// The backup file must be listed in its repository
    async fn pre_restore(
        &self,
        appliance: &mut Appliance,
        args: &RestoreArgs,
    ) -> Result<Option<ResetOutcome>, ApplianceError> {
        let RestoreArgs::File {
            file, repository, ..
        } = args
        else {
            return Ok(None);
        };

        let listing = appliance
            .send_command(&format!("show repository {}", repository))
            .await?;
        if listing.lines().any(|l| l.trim() == file) {
            return Ok(None);
        }

        warn!(appliance = appliance.name(), file = %file, repository = %repository, "backup file not in repository");
        Ok(Some(ResetOutcome::failed(appliance.name(), MISSING_BACKUP)))
    }

    /// The encryption key never reaches logs
    fn restore_display(&self, command: &str) -> String {
        match command.rsplit_once(' ') {
            Some((head, _key)) => format!("{} <redacted>", head),
            None => command.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::testing::{appliance_with, fast_timing};
    use crate::transport::ScriptedConnector;
    use std::sync::Arc;

    fn driver() -> IseDriver {
        IseDriver::new(&DriverOverrides::default())
    }

    #[test]
    fn test_parse_last_history_line() {
        let out = "\
show restore history
Tue Mar 16 09:12:40 UTC 2021: restore old-CFG10-210301.tar.gpg from repository labdash-ftp: failed
Wed Mar 17 18:13:01 UTC 2021: restore Ready-for-DNAC-demo-CFG10-210317-1813.tar.gpg from repository labdash-ftp: success
ise-1/admin#";
        let rec = driver().parse_status("10.1.100.21", out);
        assert_eq!(rec.last_restore, "Wed Mar 17 18:13:01 UTC 2021");
        assert_eq!(rec.restore_file, "Ready-for-DNAC-demo-CFG10-210317-1813.tar.gpg");
        assert_eq!(rec.status, "success");
        assert_eq!(rec.restore_id, NONE_FOUND);
    }

    #[test]
    fn test_parse_line_without_timestamp() {
        let rec = driver().parse_status("h", "restore a.tar.gpg from repository r1: in progress\n");
        assert_eq!(rec.last_restore, NONE_FOUND);
        assert_eq!(rec.restore_file, "a.tar.gpg");
        assert_eq!(rec.status, "in progress");
    }

    #[test]
    fn test_parse_no_history() {
        let rec = driver().parse_status("h", "% No restore history found\n");
        assert_eq!(rec, StatusRecord::not_found("h"));
    }

    #[test]
    fn test_restore_command() {
        let args = RestoreArgs::File {
            file: "cfg.tar.gpg".into(),
            repository: "labdash-ftp".into(),
            key: "C1sco123".into(),
        };
        let cmd = driver().restore_command(&args).unwrap();
        assert_eq!(
            cmd,
            "restore cfg.tar.gpg repository labdash-ftp encryption-key plain C1sco123"
        );
        assert!(!driver().restore_display(&cmd).contains("C1sco123"));
    }

    #[tokio::test]
    async fn test_after_connect_dismisses_resume_prompt() {
        let connector = ScriptedConnector::new().banner(
            "You have an existing session. Type 'resume' to continue it or press <Enter> to start a new one\n",
        );
        let mut app = appliance_with(&connector, Arc::new(driver()), "admin", "pw")
            .with_timing(fast_timing());

        app.connect().await.unwrap();
        assert_eq!(connector.sent(), vec!["", "terminal length 0"]);
    }

    #[tokio::test]
    async fn test_pre_restore_missing_file() {
        let connector = ScriptedConnector::new()
            .reply("show repository labdash-ftp", "other.tar.gpg\nolder.tar.gpg\n");
        let mut app = appliance_with(&connector, Arc::new(driver()), "admin", "pw")
            .with_timing(fast_timing());
        app.connect().await.unwrap();

        let args = RestoreArgs::File {
            file: "cfg.tar.gpg".into(),
            repository: "labdash-ftp".into(),
            key: "k".into(),
        };
        let outcome = driver().pre_restore(&mut app, &args).await.unwrap().unwrap();
        assert!(!outcome.reset);
        assert_eq!(outcome.message, MISSING_BACKUP);
    }
}
