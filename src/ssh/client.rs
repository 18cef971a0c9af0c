//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::*;
use tracing::{debug, info};

use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::keys::KeyPairBundle;
use super::session::{RemoteSession, SshSession};
use crate::config::RemoteConfig;
use crate::connection_manager::Connector;
use crate::error::RemoteError;
use crate::node::NodeIdentity;

/// Opens authenticated sessions to fleet nodes with the shared key pair
pub struct SshConnector {
    config: RemoteConfig,
    keys: KeyPairBundle,
}

impl SshConnector {
    /// Load the key pair once; fails fast if it cannot be read
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let keys = KeyPairBundle::load(&config.key_path, config.key_passphrase.as_deref())
            .map_err(|e| RemoteError::Key(e.to_string()))?;
        Ok(Self { config, keys })
    }

    async fn open(&self, node: &NodeIdentity) -> Result<SshSession, SshError> {
        let addr = format!("{}:{}", node.ssh_address(), self.config.port);

        info!("Connecting to {} at {}", node, addr);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(self.config.keepalive_interval_secs)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(node.alias.clone());

        let mut handle = tokio::time::timeout(
            self.config.connect_timeout(),
            client::connect(Arc::new(ssh_config), addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed with {}", node);

        let key_with_hash = PrivateKeyWithHashAlg::new(self.keys.private_key(), None);
        let authenticated = handle
            .authenticate_publickey(&self.config.username, key_with_hash)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", node);

        let controller = spawn_handle_owner_task(handle, node.alias.clone());
        Ok(SshSession::new(node.alias.clone(), controller))
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, node: &NodeIdentity) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        let alias = node.alias.clone();
        match self.open(node).await {
            Ok(session) => Ok(Arc::new(session)),
            Err(SshError::Timeout(_)) => Err(RemoteError::Timeout {
                node: alias,
                secs: self.config.connect_timeout_secs,
            }),
            Err(SshError::AuthenticationFailed(reason)) => Err(RemoteError::Authentication {
                node: alias,
                reason,
            }),
            Err(e) => Err(RemoteError::Connect {
                node: alias,
                reason: e.to_string(),
            }),
        }
    }
}

/// Client handler for russh callbacks
///
/// Lab nodes are rebuilt with every cluster, so their host keys are never
/// stable; every key is accepted and its algorithm logged.
pub struct ClientHandler {
    node: String,
}

impl ClientHandler {
    pub fn new(node: String) -> Self {
        Self { node }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(
            "Accepting {} host key for {}",
            server_public_key.algorithm().as_str(),
            self.node
        );
        Ok(true)
    }
}
