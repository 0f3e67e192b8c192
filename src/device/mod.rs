//! Lab network devices

pub mod diff;
mod ios;
mod network;

pub use diff::{ConfigBlock, DiffExcludes, DEFAULT_EXCLUDES};
pub use ios::IosDriver;
pub use network::{flash_path, LabSettings, NetworkDevice};
