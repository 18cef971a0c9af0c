//! Port Forwarding Module
//!
//! Local-to-remote TCP tunnels through node sessions. Useful for reaching
//! cluster services (CQL, JMX, dashboards) that only listen inside the lab.

pub mod local;
pub mod manager;
pub mod tunnel;

pub use local::{start_local_forward, ForwardInfo, ForwardStats, LocalForward, LocalForwardHandle};
pub use manager::TunnelManager;
pub use tunnel::{Tunnel, TunnelInfo, TunnelKey, DEFAULT_REMOTE_HOST};
