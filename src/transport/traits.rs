//! Transport trait abstraction for pluggable shell backends

use async_trait::async_trait;
use bytes::Bytes;
use labdash_shared::{Credentials, ShellError};

/// An interactive shell channel that can write and read bytes
#[async_trait]
pub trait ShellChannel: Send {
    /// Write `data`, returning how many bytes the transport accepted
    async fn write(&mut self, data: &[u8]) -> Result<usize, ShellError>;

    /// Non-blocking read of up to `max` bytes. `None` when nothing is ready.
    fn try_read(&mut self, max: usize) -> Option<Bytes>;

    /// Close the channel gracefully
    async fn close(&mut self) -> Result<(), ShellError>;
}

/// Factory for opening shell channels
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Authenticate and open an interactive shell, returning the channel
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn ShellChannel>, ShellError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
