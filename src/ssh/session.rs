//! Remote session abstraction
//!
//! `RemoteSession` is everything a `Connection` needs from one authenticated
//! session: command execution, file transfer, direct-tcpip channels and
//! teardown. `SshSession` is the russh-backed implementation.

use std::path::Path;

use async_trait::async_trait;
use russh::ChannelMsg;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, OnceCell};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::handle_owner::{HandleController, PingResult};
use crate::sftp::{SftpError, SftpTransfer};

/// Capacity of the per-command output channel
const EXEC_CHANNEL_CAPACITY: usize = 64;

/// Byte stream bridged to a remote `host:port`
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

pub type BoxedTunnelStream = Box<dyn TunnelStream>;

/// Incremental output of a running command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
}

/// One live, authenticated session to a node
///
/// Implementations need not be safe for arbitrary interleaving of multi-step
/// operations; `Connection` serializes callers.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Start `command`; output arrives on the returned channel until it closes
    async fn exec(&self, command: &str) -> Result<mpsc::Receiver<ExecEvent>, SshError>;

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<u64, SftpError>;

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<u64, SftpError>;

    /// Equivalent of `mkdir -p`
    async fn create_dir_all(&self, remote_path: &str) -> Result<(), SftpError>;

    /// Every regular file below `remote_dir` (recursive), as full remote paths
    async fn list_files(&self, remote_dir: &str) -> Result<Vec<String>, SftpError>;

    /// Open a channel to `host:port` as seen from the node
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<BoxedTunnelStream, SshError>;

    async fn ping(&self) -> bool;

    async fn close(&self);

    /// Fires when the transport goes away; `None` if the session cannot tell
    fn subscribe_disconnect(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

/// russh-backed session
pub struct SshSession {
    node: String,
    handle_controller: HandleController,
    /// Opened on first transfer
    sftp: OnceCell<SftpTransfer>,
}

impl SshSession {
    pub fn new(node: impl Into<String>, handle_controller: HandleController) -> Self {
        Self {
            node: node.into(),
            handle_controller,
            sftp: OnceCell::new(),
        }
    }

    async fn sftp(&self) -> Result<&SftpTransfer, SftpError> {
        self.sftp
            .get_or_try_init(|| SftpTransfer::open(&self.handle_controller, &self.node))
            .await
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<mpsc::Receiver<ExecEvent>, SshError> {
        let mut channel = self.handle_controller.open_session_channel().await?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to execute command: {}", e)))?;

        let (tx, rx) = mpsc::channel(EXEC_CHANNEL_CAPACITY);
        let node = self.node.clone();

        tokio::spawn(async move {
            loop {
                let event = match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => ExecEvent::Stdout(data.to_vec()),
                    // ext=1 is stderr
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        ExecEvent::Stderr(data.to_vec())
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        ExecEvent::ExitStatus(exit_status)
                    }
                    Some(ChannelMsg::Eof) => continue,
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => continue,
                };
                if tx.send(event).await.is_err() {
                    debug!("Exec output receiver for {} dropped", node);
                    break;
                }
            }
            let _ = channel.close().await;
        });

        Ok(rx)
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<u64, SftpError> {
        self.sftp().await?.upload_file(local_path, remote_path).await
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<u64, SftpError> {
        self.sftp().await?.download_file(remote_path, local_path).await
    }

    async fn create_dir_all(&self, remote_path: &str) -> Result<(), SftpError> {
        self.sftp().await?.create_dir_all(remote_path).await
    }

    async fn list_files(&self, remote_dir: &str) -> Result<Vec<String>, SftpError> {
        self.sftp().await?.list_files(remote_dir).await
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<BoxedTunnelStream, SshError> {
        let channel = self
            .handle_controller
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn ping(&self) -> bool {
        match self.handle_controller.ping().await {
            PingResult::Ok => true,
            PingResult::Timeout => {
                warn!("Keepalive for {} timed out", self.node);
                false
            }
            PingResult::IoError => false,
        }
    }

    async fn close(&self) {
        if let Some(sftp) = self.sftp.get() {
            sftp.close().await;
        }
        self.handle_controller.disconnect().await;
        info!("SSH session for {} closed", self.node);
    }

    fn subscribe_disconnect(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.handle_controller.subscribe_disconnect())
    }
}
