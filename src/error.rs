//! Crate-level error type
//!
//! Every failure that concerns a node carries the node alias so callers can
//! report which member of the fleet misbehaved.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("[{node}] connection failed: {reason}")]
    Connect { node: String, reason: String },

    #[error("[{node}] authentication failed: {reason}")]
    Authentication { node: String, reason: String },

    #[error("[{node}] connection timed out after {secs}s")]
    Timeout { node: String, secs: u64 },

    #[error("[{node}] {operation} failed: {reason}")]
    Transfer {
        node: String,
        operation: String,
        reason: String,
    },

    #[error("[{node}] could not bind local port {local_port}: {reason}")]
    TunnelBind {
        node: String,
        local_port: u16,
        reason: String,
    },

    #[error("[{node}] session error: {reason}")]
    Session { node: String, reason: String },

    #[error("[{node}] connection is closed")]
    Closed { node: String },

    #[error("Key error: {0}")]
    Key(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl RemoteError {
    /// Alias of the node this error concerns, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            RemoteError::Connect { node, .. }
            | RemoteError::Authentication { node, .. }
            | RemoteError::Timeout { node, .. }
            | RemoteError::Transfer { node, .. }
            | RemoteError::TunnelBind { node, .. }
            | RemoteError::Session { node, .. }
            | RemoteError::Closed { node } => Some(node),
            RemoteError::Key(_) | RemoteError::Config(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;
