//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for the russh `Handle`.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through a `HandleController`, which sends commands over an mpsc channel.
//! Channel opens, keepalives and disconnects therefore reach the session one
//! at a time, in arrival order, without an `Arc<Mutex<Handle>>`.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "db0".into());
//! let channel = controller.open_session_channel().await?;
//! ```

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Keepalive check outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time; the link may recover
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (exec, SFTP subsystem)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (local forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Keepalive check
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the sender). Any holder has full control of the
/// session, so keep it inside the crate.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the owner task exits
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Create a controller around an existing sender
    ///
    /// Used by tests. In production, use `spawn_handle_owner_task`.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Subscribe to SSH disconnect notifications
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Open a direct-tcpip channel to `host:port` as seen from the remote node
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Probe the connection with an SSH keepalive
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns a controller. `node` is used for logging.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, node: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        #[allow(unused_mut)]
        let mut handle = handle;

        info!("Handle owner task started for {}", node);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    debug!("Keepalive check for {}", node);
                    let result = match tokio::time::timeout(
                        std::time::Duration::from_secs(5),
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(russh::Error::Disconnect)) => {
                            warn!("Keepalive found {} disconnected", node);
                            PingResult::IoError
                        }
                        Ok(Err(e)) => {
                            warn!("Keepalive error for {}: {}", node, e);
                            PingResult::Timeout
                        }
                        Err(_) => {
                            warn!("Keepalive timeout for {} (5s)", node);
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for {}", node);
                    break;
                }
            }
        }

        // Wake forwards and anything else waiting on this session
        let _ = disconnect_tx_clone.send(());

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", node);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Drain all pending commands, returning Disconnected to each caller
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
