//! SSH transport over russh
//!
//! The russh channel is owned by a pump task. Received bytes are forwarded
//! on an unbounded channel so readiness checks never block; writes and close
//! requests travel the other way with a oneshot acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use labdash_shared::{timing, Credentials, ShellError};
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::transport::traits::{ShellChannel, ShellConnector};

const PTY_TERM: &str = "vt100";
const PTY_COLS: u32 = 200;
const PTY_ROWS: u32 = 48;

struct HostKeyPolicy;

#[async_trait]
impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    // Lab appliances are re-imaged often and their host keys change with
    // each rebuild, so any key is accepted.
    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens interactive SSH shells with password authentication
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(timing::CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open(&self, credentials: &Credentials) -> Result<SshChannel, ShellError> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(
            config,
            (credentials.host(), credentials.port()),
            HostKeyPolicy,
        )
        .await
        .map_err(|e| ShellError::Unreachable {
            host: credentials.address(),
            reason: e.to_string(),
        })?;

        let authenticated = handle
            .authenticate_password(credentials.username(), credentials.secret())
            .await
            .map_err(|e| ShellError::Protocol(e.to_string()))?;
        if !authenticated {
            return Err(ShellError::AuthFailure {
                host: credentials.address(),
                username: credentials.username().to_string(),
            });
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ShellError::Protocol(format!("channel open: {}", e)))?;
        channel
            .request_pty(false, PTY_TERM, PTY_COLS, PTY_ROWS, 0, 0, &[])
            .await
            .map_err(|e| ShellError::Protocol(format!("pty request: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| ShellError::Protocol(format!("shell request: {}", e)))?;

        let (command_tx, command_rx) = mpsc::channel(16);
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let host = credentials.address();
        tokio::spawn(async move {
            pump(host, handle, channel, command_rx, data_tx).await;
        });

        Ok(SshChannel {
            command_tx,
            data_rx,
            pending: BytesMut::new(),
        })
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn ShellChannel>, ShellError> {
        info!(host = %credentials.address(), username = credentials.username(), "opening ssh shell");
        match timeout(self.connect_timeout, self.open(credentials)).await {
            Ok(Ok(channel)) => Ok(Box::new(channel)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ShellError::Unreachable {
                host: credentials.address(),
                reason: format!("no shell after {}s", self.connect_timeout.as_secs()),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "SSH"
    }
}

enum PumpCommand {
    Write {
        data: Vec<u8>,
        ack: oneshot::Sender<Result<usize, ShellError>>,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

/// Shell channel backed by a russh session
pub struct SshChannel {
    command_tx: mpsc::Sender<PumpCommand>,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    pending: BytesMut,
}

#[async_trait]
impl ShellChannel for SshChannel {
    async fn write(&mut self, data: &[u8]) -> Result<usize, ShellError> {
        let (ack, done) = oneshot::channel();
        self.command_tx
            .send(PumpCommand::Write {
                data: data.to_vec(),
                ack,
            })
            .await
            .map_err(|_| ShellError::TransportClosed("ssh session ended".into()))?;
        done.await
            .map_err(|_| ShellError::TransportClosed("ssh session ended".into()))?
    }

    fn try_read(&mut self, max: usize) -> Option<Bytes> {
        while let Ok(chunk) = self.data_rx.try_recv() {
            self.pending.extend_from_slice(&chunk);
        }
        if self.pending.is_empty() || max == 0 {
            return None;
        }
        let n = max.min(self.pending.len());
        Some(self.pending.split_to(n).freeze())
    }

    async fn close(&mut self) -> Result<(), ShellError> {
        let (ack, done) = oneshot::channel();
        if self.command_tx.send(PumpCommand::Close { ack }).await.is_ok() {
            let _ = done.await;
        }
        Ok(())
    }
}

/// Owns the russh channel until the remote side or the caller closes it
async fn pump(
    host: String,
    handle: Handle<HostKeyPolicy>,
    mut channel: russh::Channel<client::Msg>,
    mut command_rx: mpsc::Receiver<PumpCommand>,
    data_tx: mpsc::UnboundedSender<Bytes>,
) {
    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(PumpCommand::Write { data, ack }) => {
                    let len = data.len();
                    let result = channel
                        .data(&data[..])
                        .await
                        .map(|_| len)
                        .map_err(|e| ShellError::TransportClosed(e.to_string()));
                    let failed = result.is_err();
                    let _ = ack.send(result);
                    if failed {
                        break;
                    }
                }
                Some(PumpCommand::Close { ack }) => {
                    let _ = channel.eof().await;
                    let _ = handle
                        .disconnect(Disconnect::ByApplication, "", "en")
                        .await;
                    debug!(host = %host, "ssh session closed");
                    let _ = ack.send(());
                    return;
                }
                None => break,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    let _ = data_tx.send(Bytes::copy_from_slice(&data));
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    let _ = data_tx.send(Bytes::copy_from_slice(&data));
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    warn!(host = %host, "remote closed the shell");
                    break;
                }
                Some(_) => {}
            },
        }
    }

    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await;
}
