//! Tunnel Manager
//!
//! Caches tunnels by (node, remote port). Creation is single-flight per key:
//! concurrent callers share one forward and the first request's remote host
//! and local port win. Tunnels whose forward or connection has gone away are
//! evicted on the next request.
//!
//! `close` bumps a shutdown epoch. A creation that started before the bump
//! tears down whatever it opened and fails with `Closed`, so nothing outlives
//! the shutdown uncached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::tunnel::{Tunnel, TunnelInfo, TunnelKey, DEFAULT_REMOTE_HOST};
use crate::connection_manager::ConnectionManager;
use crate::error::{RemoteError, Result};
use crate::node::NodeIdentity;

type TunnelCell = Arc<OnceCell<Result<Arc<Tunnel>>>>;

pub struct TunnelManager {
    connections: Arc<ConnectionManager>,
    tunnels: DashMap<TunnelKey, TunnelCell>,
    epoch: AtomicU64,
}

impl TunnelManager {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            tunnels: DashMap::new(),
            epoch: AtomicU64::new(0),
        }
    }

    /// Tunnel to `remote_host:remote_port` on `identity`, opening it on first use
    ///
    /// `remote_host` defaults to `localhost` and `local_port` to 0 (OS
    /// chooses). A cached tunnel for the same node and remote port is
    /// returned as-is, even if `remote_host` differs.
    pub async fn create_tunnel(
        &self,
        identity: &NodeIdentity,
        remote_port: u16,
        remote_host: Option<&str>,
        local_port: Option<u16>,
    ) -> Result<Arc<Tunnel>> {
        let remote_host = remote_host.unwrap_or(DEFAULT_REMOTE_HOST);
        let local_port = local_port.unwrap_or(0);
        let key = TunnelKey::new(identity.clone(), remote_port);
        let epoch = self.epoch.load(Ordering::SeqCst);

        loop {
            let cell = self
                .tunnels
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let outcome = cell
                .get_or_init(|| self.open(key.clone(), remote_host, local_port, epoch))
                .await;

            match outcome {
                Ok(tunnel) if !tunnel.is_active() => {
                    debug!("Evicting inactive tunnel {}", key);
                    tunnel.shutdown().await;
                    self.tunnels
                        .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
                    if self.epoch.load(Ordering::SeqCst) != epoch {
                        return Err(self.closed_error(&key));
                    }
                }
                Ok(tunnel) => {
                    if tunnel.remote_host() != remote_host {
                        debug!(
                            "Tunnel {} already targets {}, ignoring requested host {}",
                            key,
                            tunnel.remote_host(),
                            remote_host
                        );
                    }
                    return Ok(tunnel.clone());
                }
                Err(e) => {
                    self.tunnels
                        .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
                    return Err(e.clone());
                }
            }
        }
    }

    fn closed_error(&self, key: &TunnelKey) -> RemoteError {
        RemoteError::Closed {
            node: key.node.alias.clone(),
        }
    }

    async fn open(
        &self,
        key: TunnelKey,
        remote_host: &str,
        local_port: u16,
        epoch: u64,
    ) -> Result<Arc<Tunnel>> {
        let connection = self.connections.get_connection(&key.node).await?;
        let (bound, running) = connection
            .start_forward(local_port, remote_host, key.remote_port)
            .await?;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Tunnel manager closed while opening {}, releasing port {}", key, bound);
            connection.close_local_port_forward(bound).await;
            return Err(self.closed_error(&key));
        }

        info!(
            "Tunnel open: local {} -> {}:{} on {}",
            bound, remote_host, key.remote_port, key.node
        );
        Ok(Arc::new(Tunnel::new(key, remote_host, bound, running, connection)))
    }

    /// Cached active tunnel, without opening one
    pub fn get_tunnel(&self, identity: &NodeIdentity, remote_port: u16) -> Option<Arc<Tunnel>> {
        let key = TunnelKey::new(identity.clone(), remote_port);
        let cell = self.tunnels.get(&key)?.value().clone();
        match cell.get() {
            Some(Ok(tunnel)) if tunnel.is_active() => Some(tunnel.clone()),
            _ => None,
        }
    }

    /// Stop `tunnel` and drop it from the cache
    ///
    /// Only this exact instance is removed; a newer tunnel for the same key
    /// stays cached.
    pub async fn close_tunnel(&self, tunnel: &Arc<Tunnel>) {
        tunnel.shutdown().await;
        self.tunnels.remove_if(tunnel.key(), |_, cell| {
            matches!(cell.get(), Some(Ok(cached)) if Arc::ptr_eq(cached, tunnel))
        });
        info!("Tunnel {} closed (local port {})", tunnel.key(), tunnel.local_port());
    }

    /// Stop and forget every tunnel, including ones still being opened
    pub async fn close(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let keys: Vec<TunnelKey> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;

        for key in keys {
            let Some((_, cell)) = self.tunnels.remove(&key) else {
                continue;
            };
            // Waits out a creation in flight; an idle cell is sealed as closed
            let outcome = cell
                .get_or_init(|| async { Err(self.closed_error(&key)) })
                .await;
            if let Ok(tunnel) = outcome {
                tunnel.shutdown().await;
                closed += 1;
            }
        }

        info!("Tunnel manager closed {} tunnels", closed);
    }

    /// Snapshot of every open tunnel, ordered by local port
    pub fn list(&self) -> Vec<TunnelInfo> {
        let mut infos: Vec<TunnelInfo> = self
            .tunnels
            .iter()
            .filter_map(|entry| match entry.value().get() {
                Some(Ok(tunnel)) => Some(tunnel.info()),
                _ => None,
            })
            .collect();
        infos.sort_by_key(|info| info.local_port);
        infos
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
