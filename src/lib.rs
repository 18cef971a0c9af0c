//! labfleet - remote operations for short-lived lab clusters
//!
//! Opens and reuses authenticated SSH connections to fleet nodes, runs
//! commands, moves files and directories over SFTP, and multiplexes local
//! TCP tunnels through the same connections.
//!
//! Built on russh and russh-sftp. Entry point is [`RemoteOperations`].

pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod forwarding;
pub mod logging;
pub mod node;
pub mod operations;
pub mod output;
pub mod response;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

pub use config::RemoteConfig;
pub use connection::Connection;
pub use connection_manager::{ConnectionManager, Connector};
pub use error::{RemoteError, Result};
pub use forwarding::{Tunnel, TunnelInfo, TunnelManager};
pub use node::NodeIdentity;
pub use operations::RemoteOperations;
pub use output::{NullSink, OutputSink, TracingSink};
pub use response::Response;
