//! Remote operations configuration
//!
//! Loaded once at startup. Every field has a default so a partial JSON file
//! (or none at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// Default connect timeout (60 seconds)
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;

/// Idle timeout for bridged tunnel sockets (5 minutes)
const DEFAULT_FORWARD_IDLE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Login user on every node
    #[serde(default = "default_username")]
    pub username: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Private key used for every node
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// Optional passphrase for the private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// SSH keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Address local tunnel listeners bind to
    #[serde(default = "default_forward_bind_address")]
    pub forward_bind_address: String,

    /// Bridged tunnel sockets idle longer than this are closed
    #[serde(default = "default_forward_idle_timeout")]
    pub forward_idle_timeout_secs: u64,
}

fn default_username() -> String {
    "ubuntu".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("id_rsa"))
        .unwrap_or_else(|| PathBuf::from("id_rsa"))
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_forward_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_forward_idle_timeout() -> u64 {
    DEFAULT_FORWARD_IDLE_TIMEOUT_SECS
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            port: default_port(),
            key_path: default_key_path(),
            key_passphrase: None,
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            forward_bind_address: default_forward_bind_address(),
            forward_idle_timeout_secs: default_forward_idle_timeout(),
        }
    }
}

impl RemoteConfig {
    /// Load configuration from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RemoteError> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RemoteError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, RemoteError> {
        serde_json::from_str(contents).map_err(|e| RemoteError::Config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn forward_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_idle_timeout_secs)
    }
}
