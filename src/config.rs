//! Configuration loading
//!
//! Merge order (later overrides earlier):
//! 1. Compiled defaults
//! 2. The TOML file passed on the command line, or `./labdash.toml`
//! 3. `LABDASH_*` environment variables for the `[lab]`, `[dispatch]` and
//!    `[shell]` sections

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use labdash_dispatch::DispatchConfig;
use labdash_shared::{timing, Credentials};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::appliance::{ApplianceDriver, ApplianceKind, DriverOverrides, RestoreArgs, ShellTiming};
use crate::device::{DiffExcludes, LabSettings};

pub const DEFAULT_CONFIG_FILE: &str = "labdash.toml";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("{section}.{name}: `{field}` must not be empty")]
    EmptyField {
        section: &'static str,
        name: String,
        field: &'static str,
    },

    #[error("invalid diff exclude pattern `{pattern}`: {source}")]
    InvalidExclude {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),

    #[error("`{0}` is configured as both an appliance and a device")]
    DuplicateTarget(String),
}

fn default_ssh_port() -> u16 {
    22
}

/// One infrastructure appliance (`[appliances.<name>]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplianceConfig {
    pub kind: ApplianceKind,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub backup_id: Option<String>,
    #[serde(default)]
    pub backup_path: Option<String>,
    #[serde(default)]
    pub backup_file: Option<String>,
    #[serde(default)]
    pub backup_repo: Option<String>,
    #[serde(default)]
    pub backup_key: Option<String>,
    #[serde(flatten)]
    pub overrides: DriverOverrides,
}

impl ApplianceConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.host, self.port, &self.username, &self.password)
    }

    pub fn driver(&self) -> Arc<dyn ApplianceDriver> {
        self.kind.driver(&self.overrides)
    }

    /// Backup to restore on reset; `None` when the kind's fields are missing
    pub fn restore_args(&self) -> Option<RestoreArgs> {
        match self.kind {
            ApplianceKind::Dnac => self.backup_id.clone().map(RestoreArgs::BackupId),
            ApplianceKind::Vmanage => self.backup_path.clone().map(RestoreArgs::Path),
            ApplianceKind::Ise => Some(RestoreArgs::File {
                file: self.backup_file.clone()?,
                repository: self.backup_repo.clone()?,
                key: self.backup_key.clone()?,
            }),
            ApplianceKind::Generic => None,
        }
    }
}

/// One lab network device (`[devices.<name>]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// File system holding the default config; discovered when unset
    #[serde(default)]
    pub default_dir: Option<String>,
}

impl DeviceConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.host, self.port, &self.username, &self.password)
    }
}

/// Network-device lab settings (`[lab]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub default_cfg_file: String,
    pub reload_sleep_secs: u64,
    pub reload_timeout_secs: u64,
    pub reconnect_interval_secs: u64,
    pub backup_prefix: String,
    /// Extra regexes; lines matching them are left out of config diffs
    pub diff_excludes: Vec<String>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            default_cfg_file: "default.cfg".into(),
            reload_sleep_secs: timing::RELOAD_SLEEP_SECS,
            reload_timeout_secs: timing::RELOAD_TIMEOUT_SECS,
            reconnect_interval_secs: 10,
            backup_prefix: "labdash_backup_".into(),
            diff_excludes: Vec::new(),
        }
    }
}

impl LabConfig {
    pub fn settings(&self) -> Result<LabSettings, ConfigError> {
        let excludes = DiffExcludes::new(&self.diff_excludes).map_err(|source| {
            ConfigError::InvalidExclude {
                pattern: self
                    .diff_excludes
                    .iter()
                    .find(|p| regex::Regex::new(p).is_err())
                    .cloned()
                    .unwrap_or_default(),
                source,
            }
        })?;

        Ok(LabSettings {
            default_cfg_file: self.default_cfg_file.clone(),
            backup_prefix: self.backup_prefix.clone(),
            reload_sleep: Duration::from_secs(self.reload_sleep_secs),
            reload_timeout: Duration::from_secs(self.reload_timeout_secs),
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            excludes,
            ..LabSettings::default()
        })
    }
}

/// Job cache and worker pool (`[dispatch]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub status_ttl_secs: u64,
    pub reset_ttl_secs: u64,
    pub status_timeout_secs: u64,
    pub reset_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// How long a job stays claimed without renewal by its process
    pub lease_secs: u64,
    /// SQLite job store; in-memory when unset
    pub store_path: Option<PathBuf>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            status_ttl_secs: timing::STATUS_TTL_SECS,
            reset_ttl_secs: timing::RESET_TTL_SECS,
            status_timeout_secs: timing::STATUS_TIMEOUT_SECS,
            reset_timeout_secs: timing::RESET_TIMEOUT_SECS,
            poll_interval_ms: timing::JOB_POLL_INTERVAL_MS,
            lease_secs: timing::JOB_LEASE_SECS,
            store_path: None,
        }
    }
}

impl DispatchSettings {
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn reset_ttl(&self) -> Duration {
        Duration::from_secs(self.reset_ttl_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            poll_interval: self.poll_interval(),
            lease: Duration::from_secs(self.lease_secs),
        }
    }
}

/// Shell waits (`[shell]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub connect_timeout_secs: u64,
    pub command_wait_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: timing::CONNECT_TIMEOUT_SECS,
            command_wait_ms: timing::COMMAND_READ_WAIT_MS,
        }
    }
}

impl ShellConfig {
    pub fn timing(&self) -> ShellTiming {
        ShellTiming {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            command_wait: Duration::from_millis(self.command_wait_ms),
            ..ShellTiming::default()
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabdashConfig {
    pub appliances: BTreeMap<String, ApplianceConfig>,
    pub devices: BTreeMap<String, DeviceConfig>,
    pub lab: LabConfig,
    pub dispatch: DispatchSettings,
    pub shell: ShellConfig,
}

impl LabdashConfig {
    /// Reject values no lab could run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, appliance) in &self.appliances {
            non_empty("appliances", name, "host", &appliance.host)?;
            non_empty("appliances", name, "username", &appliance.username)?;
            // An empty marker matches any output
            let overrides = &appliance.overrides;
            for (field, value) in [
                ("status_command", &overrides.status_command),
                ("success_marker", &overrides.success_marker),
                ("failure_marker", &overrides.failure_marker),
            ] {
                if let Some(value) = value {
                    non_empty("appliances", name, field, value)?;
                }
            }
            if self.devices.contains_key(name) {
                return Err(ConfigError::DuplicateTarget(name.clone()));
            }
        }
        for (name, device) in &self.devices {
            non_empty("devices", name, "host", &device.host)?;
            non_empty("devices", name, "username", &device.username)?;
        }
        if self.dispatch.workers == 0 {
            return Err(ConfigError::Zero("dispatch.workers"));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::Zero("dispatch.queue_capacity"));
        }
        let dispatch = &self.dispatch;
        for (field, value) in [
            ("dispatch.poll_interval_ms", dispatch.poll_interval_ms),
            ("dispatch.status_ttl_secs", dispatch.status_ttl_secs),
            ("dispatch.reset_ttl_secs", dispatch.reset_ttl_secs),
            ("dispatch.status_timeout_secs", dispatch.status_timeout_secs),
            ("dispatch.reset_timeout_secs", dispatch.reset_timeout_secs),
            ("dispatch.lease_secs", dispatch.lease_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }
        self.lab.settings()?;
        Ok(())
    }
}

fn non_empty(
    section: &'static str,
    name: &str,
    field: &'static str,
    value: &str,
) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyField {
            section,
            name: name.to_string(),
            field,
        });
    }
    Ok(())
}

/// Load from `path` (or `./labdash.toml`) with env overrides, then validate
pub fn load_config(path: Option<&Path>) -> Result<LabdashConfig, ConfigError> {
    let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let config: LabdashConfig = Figment::new()
        .merge(Serialized::defaults(LabdashConfig::default()))
        .merge(Toml::file(file))
        .merge(env_provider())
        .extract()
        .map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

/// Load from TOML text without env overrides. Used by tests.
pub fn load_config_from_str(toml: &str) -> Result<LabdashConfig, ConfigError> {
    let config: LabdashConfig = Figment::new()
        .merge(Serialized::defaults(LabdashConfig::default()))
        .merge(Toml::string(toml))
        .extract()
        .map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

/// `LABDASH_DISPATCH_WORKERS` -> `dispatch.workers`
fn env_provider() -> Env {
    Env::prefixed("LABDASH_").map(|key| {
        key.as_str()
            .replacen("dispatch_", "dispatch.", 1)
            .replacen("lab_", "lab.", 1)
            .replacen("shell_", "shell.", 1)
            .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAB: &str = r#"
[appliances.dnac]
kind = "dnac"
host = "10.10.20.85"
username = "maglev"
password = "Maglev123"
backup_id = "ee84abae-a11b-45c6-94c3-d578cfe888f6"

[appliances.ise]
kind = "ise"
host = "10.1.100.21"
username = "admin"
password = "C1sco12345"
backup_file = "Ready-for-DNAC-demo-CFG10-210317-1813.tar.gpg"
backup_repo = "labdash-ftp"
backup_key = "C1sco12345"
success_marker = "% Application restore successful"
max_polls = 90

[appliances.vmanage]
kind = "vmanage"
host = "10.10.20.90"
port = 8022
username = "admin"
backup_path = "/home/admin/vmanage-db.tar.gz"

[devices.csr1000v-1]
host = "10.10.20.48"
username = "developer"
password = "C1sco12345"
default_dir = "bootflash:"

[lab]
reload_sleep_secs = 120
diff_excludes = ["^hostname"]

[dispatch]
workers = 2
store_path = "/var/lib/labdash/jobs.db"
"#;

    #[test]
    fn test_defaults() {
        let config = LabdashConfig::default();
        assert!(config.appliances.is_empty());
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.dispatch.status_ttl(), Duration::from_secs(60));
        assert_eq!(config.dispatch.reset_ttl(), Duration::from_secs(3600));
        assert_eq!(config.lab.reload_timeout_secs, 1200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_full_lab() {
        let config = load_config_from_str(LAB).unwrap();

        let ise = &config.appliances["ise"];
        assert_eq!(ise.kind, ApplianceKind::Ise);
        assert_eq!(ise.port, 22);
        assert_eq!(
            ise.overrides.success_marker.as_deref(),
            Some("% Application restore successful")
        );
        assert_eq!(ise.overrides.max_polls, Some(90));
        assert_eq!(ise.driver().markers().success, "% Application restore successful");
        assert!(matches!(ise.restore_args(), Some(RestoreArgs::File { .. })));

        let vmanage = &config.appliances["vmanage"];
        assert_eq!(vmanage.port, 8022);
        assert_eq!(vmanage.password, "");
        assert_eq!(
            vmanage.restore_args(),
            Some(RestoreArgs::Path("/home/admin/vmanage-db.tar.gz".into()))
        );

        let csr = &config.devices["csr1000v-1"];
        assert_eq!(csr.default_dir.as_deref(), Some("bootflash:"));
        assert_eq!(csr.credentials().address(), "10.10.20.48:22");

        assert_eq!(config.lab.reload_sleep_secs, 120);
        assert_eq!(config.lab.reload_timeout_secs, 1200);
        assert_eq!(config.dispatch.workers, 2);
        assert_eq!(config.dispatch.reset_timeout_secs, 3600);
        assert_eq!(
            config.dispatch.store_path,
            Some(PathBuf::from("/var/lib/labdash/jobs.db"))
        );
    }

    #[test]
    fn test_lab_settings_from_config() {
        let config = load_config_from_str(LAB).unwrap();
        let settings = config.lab.settings().unwrap();
        assert_eq!(settings.reload_sleep, Duration::from_secs(120));
        assert!(settings.excludes.is_excluded("hostname dev2"));
        assert!(settings.excludes.is_excluded("!"));
    }

    #[test]
    fn test_ise_without_key_has_no_restore() {
        let config = load_config_from_str(
            r#"
[appliances.ise]
kind = "ise"
host = "10.1.100.21"
username = "admin"
backup_file = "a.tar.gpg"
"#,
        )
        .unwrap();
        assert!(config.appliances["ise"].restore_args().is_none());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = load_config_from_str(
            r#"
[appliances.nx]
kind = "nexus"
host = "10.0.0.1"
username = "admin"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_empty_host_rejected() {
        let err = load_config_from_str(
            r#"
[devices.dev1]
host = ""
username = "cisco"
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::EmptyField { section: "devices", field: "host", .. }
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = load_config_from_str("[dispatch]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Zero("dispatch.workers")));
    }

    #[test]
    fn test_empty_marker_rejected() {
        let err = load_config_from_str(
            r#"
[appliances.dnac]
kind = "dnac"
host = "10.10.20.85"
username = "maglev"
backup_id = "b7c2"
success_marker = ""
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::EmptyField { section: "appliances", field: "success_marker", .. }
        ));

        let err = load_config_from_str(
            "[appliances.v]\nkind = \"vmanage\"\nhost = \"h\"\nusername = \"u\"\nfailure_marker = \" \"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyField { field: "failure_marker", .. }));
    }

    #[test]
    fn test_zero_ttl_and_timeouts_rejected() {
        for field in [
            "status_ttl_secs",
            "reset_ttl_secs",
            "status_timeout_secs",
            "reset_timeout_secs",
            "lease_secs",
        ] {
            let err = load_config_from_str(&format!("[dispatch]\n{} = 0\n", field)).unwrap_err();
            assert!(
                matches!(err, ConfigError::Zero(name) if name == format!("dispatch.{}", field)),
                "{} accepted",
                field
            );
        }
    }

    #[test]
    fn test_bad_exclude_rejected() {
        let err = load_config_from_str("[lab]\ndiff_excludes = [\"(\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidExclude { .. }));
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let err = load_config_from_str(
            r#"
[appliances.dev1]
kind = "generic"
host = "10.0.0.1"
username = "admin"

[devices.dev1]
host = "10.0.0.2"
username = "cisco"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTarget(name) if name == "dev1"));
    }
}
