//! Connection Manager
//!
//! Caches one `Connection` per `NodeIdentity`. Creation is single-flight:
//! concurrent callers for the same node share one connect attempt and its
//! outcome. A failed attempt leaves no entry behind, so the next caller
//! tries again.
//!
//! `stop` bumps a shutdown epoch and waits out connects still in flight, so a
//! session opened across a stop is closed rather than leaked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::RemoteConfig;
use crate::connection::Connection;
use crate::error::{RemoteError, Result};
use crate::node::NodeIdentity;
use crate::output::OutputSink;
use crate::ssh::{RemoteSession, SshConnector};

/// Opens sessions to nodes
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &NodeIdentity) -> Result<Arc<dyn RemoteSession>>;
}

type ConnectionCell = Arc<OnceCell<Result<Arc<Connection>>>>;

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    sink: Arc<dyn OutputSink>,
    config: RemoteConfig,
    connections: DashMap<NodeIdentity, ConnectionCell>,
    epoch: AtomicU64,
}

impl ConnectionManager {
    /// SSH-backed manager; the key pair is loaded here, once
    pub fn new(config: RemoteConfig, sink: Arc<dyn OutputSink>) -> Result<Self> {
        let connector = SshConnector::new(config.clone())?;
        Ok(Self {
            connector: Arc::new(connector),
            sink,
            config,
            connections: DashMap::new(),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn with_connector(connector: Arc<dyn Connector>, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            connector,
            sink,
            config: RemoteConfig::default(),
            connections: DashMap::new(),
            epoch: AtomicU64::new(0),
        }
    }

    /// Replace the settings used for new connections
    pub fn with_config(mut self, config: RemoteConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Cached connection for `identity`, connecting on first use
    pub async fn get_connection(&self, identity: &NodeIdentity) -> Result<Arc<Connection>> {
        let epoch = self.epoch.load(Ordering::SeqCst);

        loop {
            let cell = self
                .connections
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let outcome = cell.get_or_init(|| self.connect(identity, epoch)).await;

            match outcome {
                Ok(connection) if connection.is_closed() => {
                    // Closed behind our back; drop it and connect again
                    debug!("Evicting closed connection to {}", identity);
                    connection.close().await;
                    self.connections
                        .remove_if(identity, |_, current| Arc::ptr_eq(current, &cell));
                    if self.epoch.load(Ordering::SeqCst) != epoch {
                        return Err(closed_error(identity));
                    }
                }
                Ok(connection) => return Ok(connection.clone()),
                Err(e) => {
                    self.connections
                        .remove_if(identity, |_, current| Arc::ptr_eq(current, &cell));
                    return Err(e.clone());
                }
            }
        }
    }

    async fn connect(&self, identity: &NodeIdentity, epoch: u64) -> Result<Arc<Connection>> {
        self.sink.message(&format!(
            "Connecting to {} ({})",
            identity,
            identity.ssh_address()
        ));

        let session = tokio::time::timeout(
            self.config.connect_timeout(),
            self.connector.connect(identity),
        )
        .await
        .map_err(|_| RemoteError::Timeout {
            node: identity.alias.clone(),
            secs: self.config.connect_timeout_secs,
        })??;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Connection manager stopped while connecting to {}", identity);
            session.close().await;
            return Err(closed_error(identity));
        }

        info!("Connected to {}", identity);
        Ok(Arc::new(Connection::new(
            identity.clone(),
            session,
            self.sink.clone(),
            &self.config,
        )))
    }

    /// Cached live connection, without connecting
    pub fn get(&self, identity: &NodeIdentity) -> Option<Arc<Connection>> {
        let cell = self.connections.get(identity)?.value().clone();
        match cell.get() {
            Some(Ok(connection)) if !connection.is_closed() => Some(connection.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Nodes with an established connection
    pub fn identities(&self) -> Vec<NodeIdentity> {
        self.connections
            .iter()
            .filter(|entry| matches!(entry.value().get(), Some(Ok(_))))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Close every cached connection and empty the cache, including
    /// connections still being established
    pub async fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let keys: Vec<NodeIdentity> = self.connections.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;

        for key in keys {
            let Some((_, cell)) = self.connections.remove(&key) else {
                continue;
            };
            let outcome = cell
                .get_or_init(|| async { Err(closed_error(&key)) })
                .await;
            if let Ok(connection) = outcome {
                connection.close().await;
                closed += 1;
            }
        }

        info!("Connection manager stopped, closed {} connections", closed);
    }
}

fn closed_error(identity: &NodeIdentity) -> RemoteError {
    RemoteError::Closed {
        node: identity.alias.clone(),
    }
}
