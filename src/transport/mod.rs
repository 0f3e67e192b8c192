pub mod scripted;
pub mod ssh;
pub mod traits;

pub use scripted::ScriptedConnector;
pub use ssh::{SshChannel, SshConnector};
pub use traits::{ShellChannel, ShellConnector};
