//! Tunnel values
//!
//! A tunnel is a local forward opened on behalf of the tunnel manager. It is
//! cached by node and remote port only; the remote host and the local port
//! are not part of the key.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::Connection;
use crate::node::NodeIdentity;

/// Remote host used when the caller does not name one
pub const DEFAULT_REMOTE_HOST: &str = "localhost";

/// Cache key for tunnels
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub node: NodeIdentity,
    pub remote_port: u16,
}

impl TunnelKey {
    pub fn new(node: NodeIdentity, remote_port: u16) -> Self {
        Self { node, remote_port }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.remote_port)
    }
}

/// Serializable snapshot of a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub id: String,
    pub node: NodeIdentity,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// One live local-to-remote tunnel
pub struct Tunnel {
    id: String,
    key: TunnelKey,
    remote_host: String,
    local_port: u16,
    created_at: DateTime<Utc>,
    active: AtomicBool,
    /// Cleared by the forward itself when its accept loop exits
    forward_running: Arc<AtomicBool>,
    connection: Arc<Connection>,
}

impl Tunnel {
    pub(crate) fn new(
        key: TunnelKey,
        remote_host: impl Into<String>,
        local_port: u16,
        forward_running: Arc<AtomicBool>,
        connection: Arc<Connection>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            key,
            remote_host: remote_host.into(),
            local_port,
            created_at: Utc::now(),
            active: AtomicBool::new(true),
            forward_running,
            connection,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.key.node
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.key.remote_port
    }

    /// Bound local port (OS-assigned when 0 was requested)
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// False once closed, once the forward stopped, or once the owning
    /// connection has gone away
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
            && self.forward_running.load(Ordering::SeqCst)
            && !self.connection.is_closed()
    }

    /// Stop the underlying forward and mark the tunnel inactive
    ///
    /// Only the first call touches the forward, so a stale instance can never
    /// stop a newer forward bound to the same local port.
    pub(crate) async fn shutdown(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.connection.close_local_port_forward(self.local_port).await;
        }
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id.clone(),
            node: self.key.node.clone(),
            remote_host: self.remote_host.clone(),
            remote_port: self.key.remote_port,
            local_port: self.local_port,
            active: self.is_active(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("remote_host", &self.remote_host)
            .field("local_port", &self.local_port)
            .field("active", &self.is_active())
            .finish()
    }
}
