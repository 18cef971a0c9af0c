//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through the
//! node's session. Example: local:9042 -> db0's localhost:9042

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ssh::{RemoteSession, SshError};

/// Idle timeout for forwarded connections (5 minutes)
const FORWARD_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How long `stop` waits for bridged sockets to wind down
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Local port forwarding configuration
#[derive(Debug, Clone)]
pub struct LocalForward {
    /// Local address to bind to (e.g. "0.0.0.0")
    pub bind_address: String,
    /// Local port; 0 asks the OS for an ephemeral port
    pub local_port: u16,
    /// Remote host to connect to, as seen from the node (e.g. "localhost")
    pub remote_host: String,
    /// Remote port to connect to
    pub remote_port: u16,
    /// Bridged sockets idle longer than this are closed
    pub idle_timeout: Duration,
}

impl LocalForward {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            idle_timeout: FORWARD_IDLE_TIMEOUT,
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn local_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.local_port)
    }
}

/// Statistics for a port forward
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (client -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> client)
    pub bytes_received: u64,
}

/// Serializable snapshot of one running forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardInfo {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub stats: ForwardStats,
}

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    /// Forward configuration
    pub config: LocalForward,
    /// Actual bound address (port differs from the request when it was 0)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: broadcast::Sender<()>,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LocalForwardHandle {
    /// Stop accepting, close bridged sockets and release the local port
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return;
        };

        info!("Stopping local port forward on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(());

        if let Err(e) = task.await {
            warn!("Local port forward task on {} failed: {}", self.bound_addr, e);
        }

        let start = std::time::Instant::now();
        while self.stats.read().active_connections > 0 {
            if start.elapsed() > STOP_DRAIN_TIMEOUT {
                warn!(
                    "Timeout waiting for {} active connections to close on {}",
                    self.stats.read().active_connections,
                    self.bound_addr
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Check if the forward is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared running flag; cleared when the accept loop exits for any reason
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn local_port(&self) -> u16 {
        self.bound_addr.port()
    }

    /// Get current statistics
    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }

    pub fn info(&self) -> ForwardInfo {
        ForwardInfo {
            local_port: self.local_port(),
            remote_host: self.config.remote_host.clone(),
            remote_port: self.config.remote_port,
            stats: self.stats(),
        }
    }
}

/// Start local port forwarding
///
/// Binds the listener before returning, so bind failures surface to the
/// caller. A background task then:
/// 1. Accepts connections on the local address
/// 2. Opens a direct-tcpip channel through the session for each one
/// 3. Bridges data in both directions until either side closes
pub async fn start_local_forward(
    session: Arc<dyn RemoteSession>,
    config: LocalForward,
) -> Result<LocalForwardHandle, SshError> {
    let disconnect_rx = session.subscribe_disconnect();

    let local_addr = config.local_addr();
    let listener = TcpListener::bind(&local_addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => SshError::ConnectionFailed(format!(
            "Port already in use: {}. Another application may be using this port.",
            local_addr
        )),
        std::io::ErrorKind::PermissionDenied => SshError::ConnectionFailed(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            local_addr
        )),
        std::io::ErrorKind::AddrNotAvailable => SshError::ConnectionFailed(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            local_addr
        )),
        _ => SshError::ConnectionFailed(format!("Failed to bind to {}: {}", local_addr, e)),
    })?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to get bound address: {}", e)))?;

    info!(
        "Started local port forward: {} -> {}:{}",
        bound_addr, config.remote_host, config.remote_port
    );

    let running = Arc::new(AtomicBool::new(true));
    let (stop_tx, _) = broadcast::channel::<()>(1);
    let stop_rx = stop_tx.subscribe();
    let stats = Arc::new(parking_lot::RwLock::new(ForwardStats::default()));

    let task = tokio::spawn(accept_loop(
        listener,
        session,
        config.clone(),
        running.clone(),
        (stop_tx.clone(), stop_rx),
        disconnect_rx,
        stats.clone(),
    ));

    Ok(LocalForwardHandle {
        config,
        bound_addr,
        running,
        stop_tx,
        stats,
        task: parking_lot::Mutex::new(Some(task)),
    })
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<dyn RemoteSession>,
    config: LocalForward,
    running: Arc<AtomicBool>,
    (stop_tx, mut stop_rx): (broadcast::Sender<()>, broadcast::Receiver<()>),
    mut disconnect_rx: Option<broadcast::Receiver<()>>,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
) {
    loop {
        tokio::select! {
            _ = wait_disconnect(&mut disconnect_rx) => {
                info!("Local port forward stopped: SSH disconnected");
                // Bridged sockets die with the session
                let _ = stop_tx.send(());
                break;
            }

            _ = stop_rx.recv() => {
                info!("Local port forward stopped by request");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }

                        // Disable Nagle's algorithm for low-latency forwarding
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        debug!("Accepted connection from {} for forward", peer_addr);

                        {
                            let mut s = stats.write();
                            s.connection_count += 1;
                            s.active_connections += 1;
                        }

                        let session = session.clone();
                        let remote_host = config.remote_host.clone();
                        let remote_port = config.remote_port;
                        let idle_timeout = config.idle_timeout;
                        let stats_for_conn = stats.clone();
                        let conn_stop_rx = stop_tx.subscribe();

                        tokio::spawn(async move {
                            let result = handle_forward_connection(
                                session,
                                stream,
                                &remote_host,
                                remote_port,
                                idle_timeout,
                                conn_stop_rx,
                                stats_for_conn.clone(),
                            )
                            .await;

                            {
                                let mut s = stats_for_conn.write();
                                s.active_connections = s.active_connections.saturating_sub(1);
                            }

                            if let Err(e) = result {
                                warn!("Forward connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    info!("Local port forward task exited");
}

/// Resolves when the session reports disconnect; never resolves without a receiver
async fn wait_disconnect(rx: &mut Option<broadcast::Receiver<()>>) {
    match rx {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Handle a single forwarded connection
async fn handle_forward_connection(
    session: Arc<dyn RemoteSession>,
    mut local_stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
    idle_timeout: Duration,
    mut stop_rx: broadcast::Receiver<()>,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
) -> Result<(), SshError> {
    let remote_stream = session.open_direct_tcpip(remote_host, remote_port).await?;

    debug!("Opened channel for forward to {}:{}", remote_host, remote_port);

    let (mut local_read, mut local_write) = local_stream.split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote_stream);

    let stats_for_send = stats.clone();
    let stats_for_recv = stats;

    // Local -> Remote with idle timeout
    let local_to_remote = async {
        let mut buf = vec![0u8; 32768];
        loop {
            match tokio::time::timeout(idle_timeout, local_read.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if let Err(e) = remote_write.write_all(&buf[..n]).await {
                        debug!("Channel write error: {}", e);
                        break;
                    }
                    stats_for_send.write().bytes_sent += n as u64;
                }
                Ok(Err(e)) => {
                    debug!("Local read error: {}", e);
                    break;
                }
                Err(_) => {
                    debug!("Local read idle timeout ({}s), closing forward connection", idle_timeout.as_secs());
                    break;
                }
            }
        }
        // Signal EOF to remote
        let _ = remote_write.shutdown().await;
    };

    // Remote -> Local with idle timeout
    let remote_to_local = async {
        let mut buf = vec![0u8; 32768];
        loop {
            match tokio::time::timeout(idle_timeout, remote_read.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    debug!("Channel EOF received");
                    break;
                }
                Ok(Ok(n)) => {
                    if let Err(e) = local_write.write_all(&buf[..n]).await {
                        debug!("Local write error: {}", e);
                        break;
                    }
                    stats_for_recv.write().bytes_received += n as u64;
                }
                Ok(Err(e)) => {
                    debug!("Channel read error: {}", e);
                    break;
                }
                Err(_) => {
                    debug!("Remote read idle timeout ({}s), closing forward connection", idle_timeout.as_secs());
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = local_to_remote => {}
        _ = remote_to_local => {}
        _ = stop_rx.recv() => {
            debug!("Forward connection closed by stop request");
        }
    }

    debug!("Forward connection closed");
    Ok(())
}
