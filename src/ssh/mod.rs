//! SSH module - authenticated sessions to fleet nodes
//!
//! Built on the russh library.
//!
//! # Features
//! - Public-key authentication with one key pair shared by the whole fleet
//! - Single-owner task for the russh `Handle` (see `handle_owner`)
//! - `RemoteSession` trait: exec, SFTP transfers, direct-tcpip channels

mod client;
mod error;
mod handle_owner;
mod keys;
mod session;

pub use client::{ClientHandler, SshConnector};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use keys::KeyPairBundle;
pub use session::{BoxedTunnelStream, ExecEvent, RemoteSession, SshSession, TunnelStream};
