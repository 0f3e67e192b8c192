//! Lab network devices: default-config checks, reset by reload, backups

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::future::BoxFuture;
use labdash_shared::{
    timing, BackupOutcome, CommandError, ConfigState, Credentials, DeviceStatus, ResetOutcome,
};
use regex::Regex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::diff::{diff, ConfigBlock, DiffExcludes};
use super::ios::{IosDriver, COPY_DONE, COPY_ERROR};
use crate::appliance::{Appliance, ApplianceError, Completion, PollBudget, ShellTiming};
use crate::transport::ShellConnector;

const FALLBACK_DIR: &str = "flash:";
const ABSENT_MARKERS: &[&str] = &["No such file", "%Error", "Error opening"];
const DESTINATION_PROMPT: &str = "Destination filename";
const CONFIRM_PROMPT: &str = "[confirm]";
const SAVE_PROMPT: &str = "Save? [yes/no]";
const COPY_OK: &str = "[OK]";

static DIRECTORY_OF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Directory of (?P<fs>[\w-]+):").expect("valid directory pattern")
});

/// `   17  -rw-   1204  Mar 3 2022 10:00:00 +00:00  default.cfg`
static LISTING_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*\d+\s+[-dlrwx]{4,}\s+\d+\s+.*?(?P<name>\S+)\s*$")
        .expect("valid listing pattern")
});

static CLI_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.-]+(\(config[^)]*\))?[#>]\s*$").expect("valid prompt pattern"));

/// Lab-wide settings shared by every network device
#[derive(Debug, Clone)]
pub struct LabSettings {
    /// File name of the default configuration on each device's flash
    pub default_cfg_file: String,
    pub backup_prefix: String,
    pub reload_sleep: Duration,
    pub reload_timeout: Duration,
    pub reconnect_interval: Duration,
    pub copy_budget: PollBudget,
    pub excludes: DiffExcludes,
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            default_cfg_file: "default.cfg".into(),
            backup_prefix: "labdash_backup_".into(),
            reload_sleep: Duration::from_secs(timing::RELOAD_SLEEP_SECS),
            reload_timeout: Duration::from_secs(timing::RELOAD_TIMEOUT_SECS),
            reconnect_interval: Duration::from_secs(10),
            copy_budget: PollBudget::new(Duration::from_secs(2), 30),
            excludes: DiffExcludes::default(),
        }
    }
}

/// Join a file system prefix such as `flash:` and a file name
pub fn flash_path(dir: &str, file: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), file)
}

/// Drop the echoed command and bare prompt lines from CLI output
fn strip_cli_noise(output: &str, command: &str) -> String {
    output
        .lines()
        .filter(|l| l.trim() != command && !CLI_PROMPT.is_match(l.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// An IOS device reached over SSH
pub struct NetworkDevice {
    appliance: Appliance,
    settings: Arc<LabSettings>,
    default_dir: Option<String>,
}

impl NetworkDevice {
    pub fn new(
        name: impl Into<String>,
        credentials: Credentials,
        connector: Arc<dyn ShellConnector>,
        default_dir: Option<String>,
        settings: Arc<LabSettings>,
    ) -> Self {
        let driver = IosDriver::new().with_copy_budget(settings.copy_budget);
        Self {
            appliance: Appliance::new(name, credentials, connector, Arc::new(driver)),
            settings,
            default_dir,
        }
    }

    pub fn with_timing(mut self, timing: ShellTiming) -> Self {
        self.appliance = self.appliance.with_timing(timing);
        self
    }

    pub fn name(&self) -> &str {
        self.appliance.name()
    }

    pub fn host(&self) -> &str {
        self.appliance.host()
    }

    pub fn is_connected(&self) -> bool {
        self.appliance.is_connected()
    }

    pub async fn connect(&mut self) -> Result<(), ApplianceError> {
        self.appliance.connect().await
    }

    pub async fn disconnect(&mut self) {
        self.appliance.disconnect().await
    }

    /// Connect, run `f`, and disconnect whatever `f` returned
    pub async fn with_session<T, F>(&mut self, f: F) -> Result<T, ApplianceError>
    where
        F: for<'a> FnOnce(&'a mut NetworkDevice) -> BoxFuture<'a, Result<T, ApplianceError>>,
    {
        self.appliance.connect().await?;
        let result = f(self).await;
        self.appliance.disconnect().await;
        result
    }

    /// Configured directory, else the file system `dir` lists, else `flash:`
    pub async fn default_dir(&mut self) -> Result<String, CommandError> {
        if let Some(dir) = &self.default_dir {
            return Ok(dir.clone());
        }
        let output = self.appliance.send_command("dir").await?;
        let dir = DIRECTORY_OF
            .captures(&output)
            .map(|caps| format!("{}:", &caps["fs"]))
            .unwrap_or_else(|| FALLBACK_DIR.to_string());
        debug!(device = self.name(), dir = %dir, "default directory");
        self.default_dir = Some(dir.clone());
        Ok(dir)
    }

    pub async fn default_cfg_path(&mut self) -> Result<String, CommandError> {
        let dir = self.default_dir().await?;
        Ok(flash_path(&dir, &self.settings.default_cfg_file))
    }

    pub async fn file_exists(&mut self, path: &str) -> Result<bool, CommandError> {
        let output = self.appliance.send_command(&format!("dir {}", path)).await?;
        if ABSENT_MARKERS.iter().any(|m| output.contains(m)) {
            return Ok(false);
        }
        let file = path.rsplit(['/', ':']).next().unwrap_or(path);
        // The echoed `dir` command names the file too; only a listing entry counts
        Ok(LISTING_ENTRY
            .captures_iter(&output)
            .any(|caps| &caps["name"] == file))
    }

    pub async fn default_cfg_exists(&mut self) -> Result<bool, CommandError> {
        let path = self.default_cfg_path().await?;
        let exists = self.file_exists(&path).await?;
        info!(device = self.name(), path = %path, exists, "default config on flash");
        Ok(exists)
    }

    pub async fn running_config(&mut self) -> Result<String, CommandError> {
        let command = "show running-config";
        let output = self.appliance.send_command(command).await?;
        Ok(strip_cli_noise(&output, command))
    }

    pub async fn config_from_file(&mut self, path: &str) -> Result<String, CommandError> {
        let command = format!("more {}", path);
        let output = self.appliance.send_command(&command).await?;
        Ok(strip_cli_noise(&output, &command))
    }

    /// Diff of the running configuration against the default on flash.
    /// Empty when they match.
    pub async fn running_default_diff(&mut self) -> Result<String, ApplianceError> {
        let path = self.default_cfg_path().await?;
        if !self.file_exists(&path).await? {
            return Err(self.missing_default(&path));
        }
        self.diff_against(&path).await
    }

    async fn diff_against(&mut self, path: &str) -> Result<String, ApplianceError> {
        let running = ConfigBlock::parse(&self.running_config().await?);
        let default = ConfigBlock::parse(&self.config_from_file(path).await?);
        let d = diff(&running, &default, &self.settings.excludes);
        debug!(device = self.name(), lines = d.lines().count(), "running/default diff");
        Ok(d)
    }

    fn missing_default(&self, path: &str) -> ApplianceError {
        ApplianceError::OperationFailed(format!(
            "default config {} not found on {}",
            path,
            self.name()
        ))
    }

    /// `default` when the running configuration matches the default on flash
    pub async fn status(&mut self) -> Result<DeviceStatus, ApplianceError> {
        info!(device = self.name(), "getting status");
        let mut status = DeviceStatus::new(self.name(), self.host());

        let path = self.default_cfg_path().await?;
        let exists = self.file_exists(&path).await?;
        status.default_cfg_on_flash = Some(exists);
        if !exists {
            status.error = Some(self.missing_default(&path).to_string());
            return Ok(status);
        }

        let d = self.diff_against(&path).await?;
        status.status = Some(if d.is_empty() {
            ConfigState::Default
        } else {
            ConfigState::Configured
        });
        Ok(status)
    }

    /// Copy the default configuration to startup and reload.
    /// A device already at its default configuration is left alone.
    pub async fn reset(&mut self) -> Result<ResetOutcome, ApplianceError> {
        let name = self.name().to_string();
        let d = self.running_default_diff().await?;
        if d.is_empty() {
            info!(device = %name, "already at default configuration");
            return Ok(ResetOutcome::skipped(name, "running configuration matches default"));
        }

        let path = self.default_cfg_path().await?;
        info!(device = %name, path = %path, "resetting to default configuration");
        let copied = self.copy(&path, "startup-config").await?;
        if copied.timed_out {
            return Ok(ResetOutcome::unknown(name, copied.message));
        }

        self.reload().await?;
        if self.wait_for_reload().await {
            Ok(ResetOutcome::completed(name, format!("reloaded with {}", path)))
        } else {
            Ok(ResetOutcome::unknown(
                name,
                format!(
                    "no response within {}s of reload",
                    self.settings.reload_timeout.as_secs()
                ),
            ))
        }
    }

    /// Copy the running configuration to `<dir>/<prefix><customer_id>.cfg`
    pub async fn backup(&mut self, customer_id: &str) -> Result<BackupOutcome, ApplianceError> {
        let dir = self.default_dir().await?;
        let file = format!("{}{}.cfg", self.settings.backup_prefix, customer_id);
        let path = flash_path(&dir, &file);
        info!(device = self.name(), path = %path, "backing up running configuration");

        self.copy("running-config", &path).await?;
        let on_flash = self.file_exists(&path).await?;
        if !on_flash {
            warn!(device = self.name(), path = %path, "backup not found on flash after copy");
        }
        Ok(BackupOutcome {
            target: self.name().to_string(),
            file: path,
            on_flash,
        })
    }

    /// `copy <from> <to>`, accepting the default destination.
    /// A `%Error` is a failure; no marker within the budget is `timed_out`.
    async fn copy(&mut self, from: &str, to: &str) -> Result<Completion, ApplianceError> {
        let command = format!("copy {} {}", from, to);
        let mut output = self.appliance.send_command(&command).await?;
        for _ in 0..3 {
            if !(output.contains(DESTINATION_PROMPT) || output.contains(CONFIRM_PROMPT)) {
                break;
            }
            output = self.appliance.send_command("").await?;
        }

        if let Some(line) = output.lines().find(|l| l.contains(COPY_ERROR)) {
            return Err(ApplianceError::OperationFailed(format!(
                "{}: {}",
                command,
                line.trim()
            )));
        }
        if output.contains(COPY_DONE) || output.contains(COPY_OK) {
            return Ok(Completion {
                success: true,
                timed_out: false,
                message: format!("{} done", command),
                output,
            });
        }

        let driver = self.appliance.driver();
        let completion = self
            .appliance
            .wait_for_markers(driver.markers(), driver.poll_budget())
            .await?;
        if !completion.success && !completion.timed_out {
            return Err(ApplianceError::OperationFailed(format!(
                "{}: {}",
                command, completion.message
            )));
        }
        Ok(completion)
    }

    /// Issue `reload` without saving and drop the session
    async fn reload(&mut self) -> Result<(), ApplianceError> {
        info!(device = self.name(), "reloading");
        let mut output = self.appliance.send_command("reload").await?;
        if output.contains(SAVE_PROMPT) {
            output = self.appliance.send_command("no").await?;
        }
        if !output.contains(CONFIRM_PROMPT) {
            return Err(ApplianceError::OperationFailed(format!(
                "reload not confirmed: {}",
                output.trim()
            )));
        }
        self.appliance.send_line("").await?;
        self.appliance.disconnect().await;
        Ok(())
    }

    /// Sleep through the reload, then reconnect until the reload timeout.
    /// Returns whether the device came back.
    pub(crate) async fn wait_for_reload(&mut self) -> bool {
        let deadline = Instant::now() + self.settings.reload_timeout;
        sleep(self.settings.reload_sleep).await;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.appliance.connect().await {
                Ok(()) => {
                    info!(device = self.name(), attempts, "device back after reload");
                    return true;
                }
                Err(e) => debug!(device = self.name(), attempts, error = %e, "device not back yet"),
            }
            if Instant::now() + self.settings.reconnect_interval >= deadline {
                warn!(device = self.name(), attempts, "gave up waiting for reload");
                return false;
            }
            sleep(self.settings.reconnect_interval).await;
        }
    }
}

#[cfg(test)]
mod fixtures {
    use super::*;
    use crate::appliance::testing::fast_timing;
    use crate::transport::ScriptedConnector;

    pub const DEFAULT_DIR: &str = "flash:";
    pub const DEFAULT_PATH: &str = "flash:/default.cfg";

    pub const DEFAULT_CFG: &str = "\
Building configuration...

Current configuration : 1204 bytes
!
version 17.3
service timestamps debug datetime msec
!
hostname dev
!
interface GigabitEthernet1
 ip address dhcp
 negotiation auto
!
line vty 0 4
 login local
 transport input ssh
!
end
";

    pub const DIR_LISTING: &str = "\
Directory of flash:/default.cfg

   17  -rw-   1204  Mar 3 2022 10:00:00 +00:00  default.cfg

6286540800 bytes total (5312552960 bytes free)
";

    pub fn fast_settings() -> Arc<LabSettings> {
        Arc::new(LabSettings {
            reload_sleep: Duration::ZERO,
            reload_timeout: Duration::from_millis(200),
            reconnect_interval: Duration::from_millis(5),
            copy_budget: PollBudget::new(Duration::ZERO, 3),
            ..LabSettings::default()
        })
    }

    /// Device with the default config on flash and `running` as its running config
    pub fn scripted_device(name: &str, running: &str) -> ScriptedConnector {
        ScriptedConnector::new()
            .reply(format!("dir {}", DEFAULT_PATH), DIR_LISTING)
            .reply(
                "show running-config",
                format!("show running-config\n{}\n{}#", running, name),
            )
            .reply(
                format!("more {}", DEFAULT_PATH),
                format!("{}\n{}#", DEFAULT_CFG, name),
            )
            .reply(
                format!("copy {} startup-config", DEFAULT_PATH),
                "Destination filename [startup-config]? ",
            )
            .reply("", "1204 bytes copied in 0.312 secs (3859 bytes/sec)\n")
            .reply("reload", "Proceed with reload? [confirm]")
    }

    pub fn device(name: &str, connector: &ScriptedConnector) -> NetworkDevice {
        NetworkDevice::new(
            name,
            Credentials::new("10.0.0.5", 22, "cisco", "cisco"),
            Arc::new(connector.clone()),
            Some(DEFAULT_DIR.to_string()),
            fast_settings(),
        )
        .with_timing(fast_timing())
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::transport::ScriptedConnector;
    use labdash_shared::{RestoreOutcome, ShellError};

    #[tokio::test]
    async fn test_default_device_is_not_reset() {
        let connector = scripted_device("dev1", DEFAULT_CFG);
        let mut dev = device("dev1", &connector);

        let status = dev
            .with_session(|d| Box::pin(d.status()))
            .await
            .unwrap();
        assert_eq!(status.status, Some(ConfigState::Default));
        assert_eq!(status.default_cfg_on_flash, Some(true));

        let outcome = dev.with_session(|d| Box::pin(d.reset())).await.unwrap();
        assert!(!outcome.reset);
        assert_eq!(outcome.outcome, RestoreOutcome::Skipped);
        assert!(!connector.was_sent("reload"));
        assert!(!connector.sent().iter().any(|c| c.starts_with("copy ")));
    }

    #[tokio::test]
    async fn test_configured_device_is_copied_and_reloaded() {
        let running = DEFAULT_CFG.replace("hostname dev", "hostname customer-edge");
        let connector = scripted_device("dev2", &running);
        let mut dev = device("dev2", &connector);

        let outcome = dev.with_session(|d| Box::pin(d.reset())).await.unwrap();
        assert!(outcome.reset);
        assert_eq!(outcome.outcome, RestoreOutcome::Completed);
        assert!(connector.was_sent("copy flash:/default.cfg startup-config"));
        assert!(connector.was_sent("reload"));
        assert_eq!(connector.connects(), 2);
        assert!(!dev.is_connected());
    }

    #[tokio::test]
    async fn test_missing_default_is_reported_on_status() {
        let connector = ScriptedConnector::new().reply(
            "dir flash:/default.cfg",
            "%Error opening flash:/default.cfg (No such file or directory)",
        );
        let mut dev = device("dev3", &connector);

        let status = dev.with_session(|d| Box::pin(d.status())).await.unwrap();
        assert_eq!(status.default_cfg_on_flash, Some(false));
        assert!(status.status.is_none());
        assert!(status.error.unwrap().contains("not found"));

        let err = dev.with_session(|d| Box::pin(d.reset())).await.unwrap_err();
        assert!(matches!(err, ApplianceError::OperationFailed(_)));
    }

    #[tokio::test]
    async fn test_default_dir_parsed_from_listing() {
        let connector = ScriptedConnector::new().reply(
            "dir",
            "Directory of bootflash:/\n\n   11  drwx  16384  Mar 3 2022  lost+found\n",
        );
        let mut dev = NetworkDevice::new(
            "dev4",
            Credentials::new("10.0.0.6", 22, "cisco", "cisco"),
            Arc::new(connector.clone()),
            None,
            fast_settings(),
        )
        .with_timing(crate::appliance::testing::fast_timing());

        let dir = dev
            .with_session(|d| Box::pin(async move { Ok(d.default_dir().await?) }))
            .await
            .unwrap();
        assert_eq!(dir, "bootflash:");
        assert_eq!(flash_path(&dir, "default.cfg"), "bootflash:/default.cfg");
    }

    #[tokio::test]
    async fn test_file_exists_ignores_echoed_command() {
        let empty = "Directory of flash:/default.cfg\r\n\r\nNo files in directory\r\n\r\n6286540800 bytes total (5312552960 bytes free)\r\n";
        let connector = ScriptedConnector::new()
            .echo_commands()
            .reply(format!("dir {}", DEFAULT_PATH), empty)
            .reply("dir flash:/running.bak", DIR_LISTING.replace("default.cfg", "running.bak"));
        let mut dev = device("dev1", &connector);

        let (missing, present) = dev
            .with_session(|d| {
                Box::pin(async move {
                    let missing = d.file_exists(DEFAULT_PATH).await?;
                    let present = d.file_exists("flash:/running.bak").await?;
                    Ok((missing, present))
                })
            })
            .await
            .unwrap();
        assert!(!missing);
        assert!(present);
    }

    #[tokio::test]
    async fn test_backup_copies_and_verifies() {
        let connector = ScriptedConnector::new()
            .reply(
                "copy running-config flash:/labdash_backup_acme.cfg",
                "Destination filename [labdash_backup_acme.cfg]? ",
            )
            .reply("", "3021 bytes copied in 0.401 secs (7534 bytes/sec)\n")
            .reply(
                "dir flash:/labdash_backup_acme.cfg",
                "Directory of flash:/labdash_backup_acme.cfg\n\n   18  -rw-   3021  labdash_backup_acme.cfg\n",
            );
        let mut dev = device("dev1", &connector);

        let backup = dev
            .with_session(|d| Box::pin(d.backup("acme")))
            .await
            .unwrap();
        assert_eq!(backup.file, "flash:/labdash_backup_acme.cfg");
        assert!(backup.on_flash);
    }

    #[tokio::test]
    async fn test_copy_error_fails() {
        let connector = ScriptedConnector::new().reply(
            "copy running-config flash:/labdash_backup_acme.cfg",
            "%Error opening flash:/labdash_backup_acme.cfg (Permission denied)\n",
        );
        let mut dev = device("dev1", &connector);

        let err = dev
            .with_session(|d| Box::pin(d.backup("acme")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
    }

    #[tokio::test]
    async fn test_reload_wait_gives_up() {
        let mut connector = ScriptedConnector::new();
        for _ in 0..100 {
            connector = connector.fail_connect(ShellError::Unreachable {
                host: "10.0.0.5".into(),
                reason: "connection refused".into(),
            });
        }
        let mut dev = device("dev2", &connector);

        assert!(!dev.wait_for_reload().await);
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn test_reload_wait_retries_until_back() {
        let connector = ScriptedConnector::new()
            .fail_connect(ShellError::Unreachable {
                host: "10.0.0.5".into(),
                reason: "connection refused".into(),
            })
            .fail_connect(ShellError::Protocol("kex failed".into()));
        let mut dev = device("dev2", &connector);

        assert!(dev.wait_for_reload().await);
        assert_eq!(connector.connects(), 1);
        assert!(dev.is_connected());
        dev.disconnect().await;
    }

    #[test]
    fn test_strip_cli_noise() {
        let out = "show running-config\nhostname dev1\ndev1#";
        assert_eq!(strip_cli_noise(out, "show running-config"), "hostname dev1");
    }
}
