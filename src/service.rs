//! Lab operations mapped onto dispatched jobs
//!
//! Every request becomes a job keyed `{target}_{operation}`, so repeated
//! requests share one execution and its cached result.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use labdash_dispatch::{DispatchError, Dispatcher, JobSpec, JobTask};
use labdash_shared::{DeviceStatus, JobError, JobOutput, JobRecord, JobState, StatusRecord};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::appliance::{ops, Appliance, RestoreArgs, ShellTiming};
use crate::config::{ApplianceConfig, DeviceConfig, LabdashConfig};
use crate::device::{LabSettings, NetworkDevice};
use crate::transport::ShellConnector;

static CUSTOMER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid customer id pattern"));

/// Errors returned before or while dispatching a lab operation
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("{0} is not a network device")]
    NotADevice(String),

    #[error("{0} has no restore configured")]
    ResetUnsupported(String),

    #[error("invalid customer id `{0}`")]
    InvalidCustomerId(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// One configured target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSummary {
    pub name: String,
    pub host: String,
    pub kind: String,
}

/// Best-effort status of the whole lab
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabStatus {
    pub appliances: BTreeMap<String, StatusRecord>,
    pub devices: BTreeMap<String, DeviceStatus>,
    /// Targets whose status job was still running when the wait ended
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<String>,
}

enum Target<'a> {
    Appliance(&'a ApplianceConfig),
    Device(&'a DeviceConfig),
}

pub fn job_id(target: &str, operation: &str) -> String {
    format!("{}_{}", target, operation)
}

/// Lab-facing API over the dispatcher
pub struct LabService {
    config: Arc<LabdashConfig>,
    lab: Arc<LabSettings>,
    connector: Arc<dyn ShellConnector>,
    dispatcher: Arc<Dispatcher>,
    timing: ShellTiming,
}

impl LabService {
    pub fn new(
        config: LabdashConfig,
        lab: LabSettings,
        connector: Arc<dyn ShellConnector>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let timing = config.shell.timing();
        Self {
            config: Arc::new(config),
            lab: Arc::new(lab),
            connector,
            dispatcher,
            timing,
        }
    }

    pub fn with_timing(mut self, timing: ShellTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn target(&self, name: &str) -> Result<Target<'_>, ServiceError> {
        if let Some(appliance) = self.config.appliances.get(name) {
            return Ok(Target::Appliance(appliance));
        }
        if let Some(device) = self.config.devices.get(name) {
            return Ok(Target::Device(device));
        }
        Err(ServiceError::UnknownTarget(name.to_string()))
    }

    /// Every appliance and network device with its host
    pub fn list(&self) -> Vec<TargetSummary> {
        let appliances = self.config.appliances.iter().map(|(name, a)| TargetSummary {
            name: name.clone(),
            host: a.host.clone(),
            kind: a.kind.to_string(),
        });
        let devices = self.config.devices.iter().map(|(name, d)| TargetSummary {
            name: name.clone(),
            host: d.host.clone(),
            kind: "ios".to_string(),
        });
        appliances.chain(devices).collect()
    }

    /// Cached or fresh status of one target; blocks until it is known
    pub async fn status(&self, target: &str) -> Result<JobRecord, ServiceError> {
        let spec = self.status_spec(target)?;
        let record = self
            .dispatcher
            .run_to_completion(&spec.id, spec.task, spec.timeout, spec.ttl)
            .await?;
        Ok(record)
    }

    /// Status of every target. Unreachable targets carry an inline error.
    pub async fn lab_status(&self) -> Result<LabStatus, ServiceError> {
        let names: Vec<String> = self
            .config
            .appliances
            .keys()
            .chain(self.config.devices.keys())
            .cloned()
            .collect();
        let specs = names
            .iter()
            .map(|name| self.status_spec(name))
            .collect::<Result<Vec<_>, _>>()?;

        let batch = self
            .dispatcher
            .wait_for_all(specs, self.config.dispatch.status_timeout())
            .await?;

        let mut lab = LabStatus {
            pending: batch.pending.clone(),
            ..LabStatus::default()
        };
        for name in &names {
            let record = batch.records.get(&job_id(name, "status"));
            match self.target(name)? {
                Target::Appliance(a) => {
                    let status = appliance_status_of(record, &a.host);
                    lab.appliances.insert(name.clone(), status);
                }
                Target::Device(d) => {
                    let status = device_status_of(record, name, &d.host);
                    lab.devices.insert(name.clone(), status);
                }
            }
        }
        if !lab.pending.is_empty() {
            warn!(pending = ?lab.pending, "lab status incomplete");
        }
        Ok(lab)
    }

    /// Restore an appliance or reset a device to its default configuration.
    /// With `wait` false the current job record is returned at once.
    pub async fn reset(&self, target: &str, wait: bool) -> Result<JobRecord, ServiceError> {
        let id = job_id(target, "reset");
        let task = match self.target(target)? {
            Target::Appliance(a) => {
                let args = a
                    .restore_args()
                    .ok_or_else(|| ServiceError::ResetUnsupported(target.to_string()))?;
                let appliance = self.appliance(target, a);
                JobTask::new(move || restore_appliance(appliance, args))
            }
            Target::Device(d) => {
                let device = self.device(target, d);
                JobTask::new(move || reset_device(device))
            }
        };
        info!(job_id = %id, wait, "reset requested");
        self.submit(&id, task, wait).await
    }

    /// Copy a device's running configuration to flash for `customer_id`
    pub async fn backup(
        &self,
        device: &str,
        customer_id: &str,
        wait: bool,
    ) -> Result<JobRecord, ServiceError> {
        if !CUSTOMER_ID.is_match(customer_id) {
            return Err(ServiceError::InvalidCustomerId(customer_id.to_string()));
        }
        let Target::Device(d) = self.target(device)? else {
            return Err(ServiceError::NotADevice(device.to_string()));
        };

        let id = job_id(device, &format!("backup_{}", customer_id));
        let device = self.device(device, d);
        let customer_id = customer_id.to_string();
        let task = JobTask::new(move || backup_device(device, customer_id));
        self.submit(&id, task, wait).await
    }

    /// Job status document; [`DispatchError::JobNotFound`] for unknown ids
    pub async fn job(&self, id: &str) -> Result<Value, ServiceError> {
        Ok(self.dispatcher.job_status(id).await?)
    }

    async fn submit(&self, id: &str, task: JobTask, wait: bool) -> Result<JobRecord, ServiceError> {
        let timeout = self.config.dispatch.reset_timeout();
        let ttl = self.config.dispatch.reset_ttl();
        let record = if wait {
            self.dispatcher
                .run_to_completion(id, task, timeout, ttl)
                .await?
        } else {
            self.dispatcher.enqueue(id, task, timeout, ttl).await?
        };
        Ok(record)
    }

    fn status_spec(&self, name: &str) -> Result<JobSpec, ServiceError> {
        let task = match self.target(name)? {
            Target::Appliance(a) => {
                let appliance = self.appliance(name, a);
                JobTask::new(move || appliance_status(appliance))
            }
            Target::Device(d) => {
                let device = self.device(name, d);
                JobTask::new(move || device_status(device))
            }
        };
        Ok(JobSpec::new(
            job_id(name, "status"),
            task,
            self.config.dispatch.status_timeout(),
            self.config.dispatch.status_ttl(),
        ))
    }

    fn appliance(&self, name: &str, config: &ApplianceConfig) -> Appliance {
        Appliance::new(
            name,
            config.credentials(),
            self.connector.clone(),
            config.driver(),
        )
        .with_timing(self.timing)
    }

    fn device(&self, name: &str, config: &DeviceConfig) -> NetworkDevice {
        NetworkDevice::new(
            name,
            config.credentials(),
            self.connector.clone(),
            config.default_dir.clone(),
            self.lab.clone(),
        )
        .with_timing(self.timing)
    }
}

async fn appliance_status(mut appliance: Appliance) -> Result<JobOutput, JobError> {
    let status = appliance
        .with_session(|a| Box::pin(ops::fetch_status(a)))
        .await?;
    Ok(JobOutput::Status(status))
}

async fn restore_appliance(mut appliance: Appliance, args: RestoreArgs) -> Result<JobOutput, JobError> {
    let outcome = appliance
        .with_session(|a| Box::pin(async move { ops::restore(a, &args).await }))
        .await?;
    Ok(JobOutput::Reset(outcome))
}

async fn device_status(mut device: NetworkDevice) -> Result<JobOutput, JobError> {
    let status = device.with_session(|d| Box::pin(d.status())).await?;
    Ok(JobOutput::Device(status))
}

async fn reset_device(mut device: NetworkDevice) -> Result<JobOutput, JobError> {
    let outcome = device.with_session(|d| Box::pin(d.reset())).await?;
    Ok(JobOutput::Reset(outcome))
}

async fn backup_device(mut device: NetworkDevice, customer_id: String) -> Result<JobOutput, JobError> {
    let outcome = device
        .with_session(|d| Box::pin(async move { d.backup(&customer_id).await }))
        .await?;
    Ok(JobOutput::Backup(outcome))
}

fn failure_message(record: Option<&JobRecord>) -> String {
    match record.map(|r| &r.state) {
        Some(JobState::Failed(err)) => err.message.clone(),
        Some(JobState::Queued | JobState::Running) => "status still running".to_string(),
        Some(JobState::Finished(_)) => "unexpected job output".to_string(),
        None => "no status job".to_string(),
    }
}

fn appliance_status_of(record: Option<&JobRecord>, host: &str) -> StatusRecord {
    match record.and_then(JobRecord::output) {
        Some(JobOutput::Status(status)) => status.clone(),
        _ => StatusRecord::with_error(host, failure_message(record)),
    }
}

fn device_status_of(record: Option<&JobRecord>, name: &str, host: &str) -> DeviceStatus {
    match record.and_then(JobRecord::output) {
        Some(JobOutput::Device(status)) => status.clone(),
        _ => DeviceStatus {
            error: Some(failure_message(record)),
            ..DeviceStatus::new(name, host)
        },
    }
}
