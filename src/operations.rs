//! Remote Operations
//!
//! Facade used by the rest of the tool. Resolves the node's connection
//! through the connection manager, runs the operation, and reports failures
//! to the output sink before returning them.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::RemoteConfig;
use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::error::Result;
use crate::forwarding::{TunnelInfo, TunnelManager};
use crate::node::NodeIdentity;
use crate::output::OutputSink;
use crate::response::Response;

pub struct RemoteOperations {
    connections: Arc<ConnectionManager>,
    tunnels: TunnelManager,
    sink: Arc<dyn OutputSink>,
}

impl RemoteOperations {
    /// SSH-backed operations; fails if the key pair cannot be loaded
    pub fn new(config: RemoteConfig, sink: Arc<dyn OutputSink>) -> Result<Self> {
        let connections = Arc::new(ConnectionManager::new(config, sink.clone())?);
        Ok(Self::with_connection_manager(connections, sink))
    }

    pub fn with_connection_manager(
        connections: Arc<ConnectionManager>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            tunnels: TunnelManager::new(connections.clone()),
            connections,
            sink,
        }
    }

    fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.sink.error("Remote operation failed", Some(e));
        }
        result
    }

    /// Connection for `identity`, opening it if needed
    pub async fn connection(&self, identity: &NodeIdentity) -> Result<Arc<Connection>> {
        let result = self.connections.get_connection(identity).await;
        self.report(result)
    }

    pub async fn execute(
        &self,
        identity: &NodeIdentity,
        command: &str,
        capture_output: bool,
        sensitive: bool,
    ) -> Result<Response> {
        let connection = self.connection(identity).await?;
        let result = connection.execute(command, capture_output, sensitive).await;
        self.report(result)
    }

    pub async fn upload(&self, identity: &NodeIdentity, local: &Path, remote: &str) -> Result<()> {
        let connection = self.connection(identity).await?;
        let result = connection.upload_file(local, remote).await;
        self.report(result)
    }

    pub async fn upload_directory(
        &self,
        identity: &NodeIdentity,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<()> {
        let connection = self.connection(identity).await?;
        let result = connection.upload_directory(local_dir, remote_dir).await;
        self.report(result)
    }

    pub async fn download(&self, identity: &NodeIdentity, remote: &str, local: &Path) -> Result<()> {
        let connection = self.connection(identity).await?;
        let result = connection.download_file(remote, local).await;
        self.report(result)
    }

    /// Returns the downloaded paths relative to `remote_dir`
    pub async fn download_directory(
        &self,
        identity: &NodeIdentity,
        remote_dir: &str,
        local_dir: &Path,
        include: &[String],
        exclude: &[String],
    ) -> Result<Vec<String>> {
        let connection = self.connection(identity).await?;
        let result = connection
            .download_directory(remote_dir, local_dir, include, exclude)
            .await;
        self.report(result)
    }

    /// Open (or reuse) a tunnel and return its local port
    ///
    /// `remote_host` defaults to `localhost`; `local_port` defaults to an
    /// OS-assigned port.
    pub async fn open_tunnel(
        &self,
        identity: &NodeIdentity,
        remote_port: u16,
        remote_host: Option<&str>,
        local_port: Option<u16>,
    ) -> Result<u16> {
        let result = self
            .tunnels
            .create_tunnel(identity, remote_port, remote_host, local_port)
            .await;
        let tunnel = self.report(result)?;
        self.sink.message(&format!(
            "Tunnel to {}:{} on {} listening on local port {}",
            tunnel.remote_host(),
            tunnel.remote_port(),
            identity,
            tunnel.local_port()
        ));
        Ok(tunnel.local_port())
    }

    /// Close the tunnel for `identity` and `remote_port`, if there is one
    pub async fn close_tunnel(&self, identity: &NodeIdentity, remote_port: u16) {
        if let Some(tunnel) = self.tunnels.get_tunnel(identity, remote_port) {
            self.tunnels.close_tunnel(&tunnel).await;
        }
    }

    pub fn tunnels(&self) -> Vec<TunnelInfo> {
        self.tunnels.list()
    }

    /// Close every tunnel, then every connection
    pub async fn shutdown(&self) {
        info!("Shutting down remote operations");
        self.tunnels.close().await;
        self.connections.stop().await;
    }
}
