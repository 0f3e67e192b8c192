//! labdash: inspect and reset lab appliances and network devices
//!
//! Appliances are driven through an interactive shell; every operation runs
//! as a cached, single-flight job on the `labdash-dispatch` worker pool.

pub mod appliance;
pub mod config;
pub mod device;
pub mod service;
pub mod shell;
pub mod transport;

pub use config::{load_config, LabdashConfig};
pub use service::{LabService, LabStatus, ServiceError};
