//! Node identity
//!
//! The addressable identity of one fleet member. Owned by cluster state
//! discovery; treated here as an opaque cache key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one remote node
///
/// Two identities are equal iff every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    /// Address reachable from the operator's machine
    pub public_ip: String,
    /// Address inside the cluster network
    pub private_ip: String,
    /// Short alias, e.g. `db0` or `control0`
    pub alias: String,
    /// Placement zone
    pub availability_zone: String,
}

impl NodeIdentity {
    pub fn new(
        public_ip: impl Into<String>,
        private_ip: impl Into<String>,
        alias: impl Into<String>,
        availability_zone: impl Into<String>,
    ) -> Self {
        Self {
            public_ip: public_ip.into(),
            private_ip: private_ip.into(),
            alias: alias.into(),
            availability_zone: availability_zone.into(),
        }
    }

    /// Address used to open the SSH session
    pub fn ssh_address(&self) -> &str {
        &self.public_ip
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.alias)
    }
}
