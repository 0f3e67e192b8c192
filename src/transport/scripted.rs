//! Scripted transport that replays captured shell transcripts
//!
//! Each command maps to a queue of replies; the n-th send of a command gets
//! the n-th reply and the last reply repeats. A reply may be split into
//! chunks: the first is readable at once, the rest are released one per
//! empty read, which mimics output that trickles in while a long-running
//! operation progresses.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use labdash_shared::{Credentials, ShellError};
use tracing::debug;

use crate::transport::traits::{ShellChannel, ShellConnector};

#[derive(Debug, Default)]
struct ScriptState {
    banner: Option<String>,
    replies: HashMap<String, Vec<Vec<String>>>,
    served: HashMap<String, usize>,
    connect_failures: VecDeque<ShellError>,
    echo: bool,
    short_writes: bool,
    sent: Vec<String>,
    connects: usize,
}

impl ScriptState {
    fn next_reply(&mut self, command: &str) -> Vec<String> {
        let Some(replies) = self.replies.get(command) else {
            return Vec::new();
        };
        let served = self.served.entry(command.to_string()).or_insert(0);
        let idx = (*served).min(replies.len().saturating_sub(1));
        *served += 1;
        replies.get(idx).cloned().unwrap_or_default()
    }
}

/// Connector whose shells answer from a fixed command table
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Text readable right after the shell opens
    pub fn banner(self, text: impl Into<String>) -> Self {
        self.state().banner = Some(text.into());
        self
    }

    /// Queue a reply for the next unanswered send of `command`
    pub fn reply(self, command: impl Into<String>, output: impl Into<String>) -> Self {
        self.reply_in_chunks(command, [output.into()])
    }

    /// Queue a reply delivered over several reads
    pub fn reply_in_chunks<I, S>(self, command: impl Into<String>, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks = chunks.into_iter().map(Into::into).collect();
        self.state()
            .replies
            .entry(command.into())
            .or_default()
            .push(chunks);
        self
    }

    /// Fail the next connect attempt with `err`
    pub fn fail_connect(self, err: ShellError) -> Self {
        self.state().connect_failures.push_back(err);
        self
    }

    /// Echo every command back before its reply, as a PTY does
    pub fn echo_commands(self) -> Self {
        self.state().echo = true;
        self
    }

    /// Accept one byte less than requested on every write
    pub fn short_writes(self) -> Self {
        self.state().short_writes = true;
        self
    }

    /// Every line written so far, across all shells, without terminators
    pub fn sent(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    /// Whether `command` was ever sent
    pub fn was_sent(&self, command: &str) -> bool {
        self.state().sent.iter().any(|c| c == command)
    }

    /// Number of successful connects
    pub fn connects(&self) -> usize {
        self.state().connects
    }
}

#[async_trait]
impl ShellConnector for ScriptedConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn ShellChannel>, ShellError> {
        let mut state = self.state();
        if let Some(err) = state.connect_failures.pop_front() {
            debug!(host = %credentials.address(), error = %err, "scripted connect failure");
            return Err(err);
        }
        state.connects += 1;

        let mut channel = ScriptedChannel {
            state: self.state.clone(),
            readable: BytesMut::new(),
            trickle: VecDeque::new(),
            closed: false,
        };
        if let Some(banner) = &state.banner {
            channel.readable.extend_from_slice(banner.as_bytes());
        }
        Ok(Box::new(channel))
    }

    fn name(&self) -> &'static str {
        "Scripted"
    }
}

struct ScriptedChannel {
    state: Arc<Mutex<ScriptState>>,
    readable: BytesMut,
    trickle: VecDeque<String>,
    closed: bool,
}

#[async_trait]
impl ShellChannel for ScriptedChannel {
    async fn write(&mut self, data: &[u8]) -> Result<usize, ShellError> {
        if self.closed {
            return Err(ShellError::TransportClosed("scripted shell closed".into()));
        }

        let text = String::from_utf8_lossy(data);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for line in text.lines() {
            let command = line.trim_end_matches('\r').to_string();
            if state.echo {
                self.readable.extend_from_slice(command.as_bytes());
                self.readable.extend_from_slice(b"\r\n");
            }
            let mut chunks = state.next_reply(&command).into_iter();
            if let Some(first) = chunks.next() {
                self.readable.extend_from_slice(first.as_bytes());
            }
            self.trickle.extend(chunks);
            state.sent.push(command);
        }

        if state.short_writes {
            Ok(data.len().saturating_sub(1))
        } else {
            Ok(data.len())
        }
    }

    fn try_read(&mut self, max: usize) -> Option<Bytes> {
        if self.readable.is_empty() {
            let chunk = self.trickle.pop_front()?;
            self.readable.extend_from_slice(chunk.as_bytes());
        }
        if self.readable.is_empty() || max == 0 {
            return None;
        }
        let n = max.min(self.readable.len());
        Some(self.readable.split_to(n).freeze())
    }

    async fn close(&mut self) -> Result<(), ShellError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("10.0.0.5", 22, "admin", "secret")
    }

    #[tokio::test]
    async fn test_reply_and_banner() {
        let connector = ScriptedConnector::new()
            .banner("Welcome\n")
            .reply("show clock", "12:00:00\n");
        let mut channel = connector.connect(&creds()).await.unwrap();

        assert_eq!(channel.try_read(100).unwrap(), Bytes::from_static(b"Welcome\n"));
        assert!(channel.try_read(100).is_none());

        assert_eq!(channel.write(b"show clock\n").await.unwrap(), 11);
        assert_eq!(channel.try_read(100).unwrap(), Bytes::from_static(b"12:00:00\n"));
        assert_eq!(connector.sent(), vec!["show clock".to_string()]);
    }

    #[tokio::test]
    async fn test_successive_replies_then_repeat() {
        let connector = ScriptedConnector::new()
            .reply("status", "one")
            .reply("status", "two");
        let mut channel = connector.connect(&creds()).await.unwrap();

        for expected in ["one", "two", "two"] {
            channel.write(b"status\n").await.unwrap();
            assert_eq!(channel.try_read(100).unwrap(), Bytes::from(expected));
        }
    }

    #[tokio::test]
    async fn test_chunks_trickle_one_per_empty_read() {
        let connector =
            ScriptedConnector::new().reply_in_chunks("restore", ["started\n", "50%\n", "done\n"]);
        let mut channel = connector.connect(&creds()).await.unwrap();
        channel.write(b"restore\n").await.unwrap();

        assert_eq!(channel.try_read(100).unwrap(), Bytes::from_static(b"started\n"));
        assert_eq!(channel.try_read(100).unwrap(), Bytes::from_static(b"50%\n"));
        assert_eq!(channel.try_read(2).unwrap(), Bytes::from_static(b"do"));
        assert_eq!(channel.try_read(100).unwrap(), Bytes::from_static(b"ne\n"));
        assert!(channel.try_read(100).is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_then_success() {
        let connector = ScriptedConnector::new().fail_connect(ShellError::Unreachable {
            host: "10.0.0.5:22".into(),
            reason: "reloading".into(),
        });

        assert!(connector.connect(&creds()).await.is_err());
        assert!(connector.connect(&creds()).await.is_ok());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_writes() {
        let connector = ScriptedConnector::new();
        let mut channel = connector.connect(&creds()).await.unwrap();
        channel.close().await.unwrap();
        assert!(matches!(
            channel.write(b"x\n").await,
            Err(ShellError::TransportClosed(_))
        ));
    }
}
