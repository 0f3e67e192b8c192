//! Appliances driven through an interactive shell
//!
//! [`Appliance`] owns the connect/disconnect lifecycle and the command
//! primitives. Everything that differs between appliance types lives behind
//! [`ApplianceDriver`]: probe and restore commands, completion markers,
//! output parsers and the lifecycle hooks.

mod driver;
pub mod dnac;
mod error;
pub mod generic;
pub mod ise;
mod lifecycle;
pub mod ops;
pub mod vmanage;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use dnac::DnacDriver;
pub use driver::{ApplianceDriver, DriverOverrides, Markers, PollBudget, RestoreArgs};
pub use error::ApplianceError;
pub use generic::GenericDriver;
pub use ise::IseDriver;
pub use lifecycle::{Appliance, Completion, ShellTiming, TIMEOUT_UNKNOWN};
pub use vmanage::VmanageDriver;

/// Appliance types with a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplianceKind {
    Dnac,
    Ise,
    Vmanage,
    Generic,
}

impl ApplianceKind {
    pub fn driver(&self, overrides: &DriverOverrides) -> Arc<dyn ApplianceDriver> {
        match self {
            ApplianceKind::Dnac => Arc::new(DnacDriver::new(overrides)),
            ApplianceKind::Ise => Arc::new(IseDriver::new(overrides)),
            ApplianceKind::Vmanage => Arc::new(VmanageDriver::new(overrides)),
            ApplianceKind::Generic => Arc::new(GenericDriver::new(overrides)),
        }
    }
}

impl fmt::Display for ApplianceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApplianceKind::Dnac => "dnac",
            ApplianceKind::Ise => "ise",
            ApplianceKind::Vmanage => "vmanage",
            ApplianceKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use labdash_shared::Credentials;

    use super::{Appliance, ApplianceDriver, ShellTiming};
    use crate::transport::ScriptedConnector;

    /// Waits short enough for scripted shells
    pub fn fast_timing() -> ShellTiming {
        ShellTiming {
            connect_timeout: Duration::from_secs(1),
            command_wait: Duration::from_millis(2),
            ..ShellTiming::default()
        }
    }

    pub fn appliance_with(
        connector: &ScriptedConnector,
        driver: Arc<dyn ApplianceDriver>,
        username: &str,
        secret: &str,
    ) -> Appliance {
        Appliance::new(
            "lab-appliance",
            Credentials::new("10.20.30.40", 22, username, secret),
            Arc::new(connector.clone()),
            driver,
        )
    }
}
