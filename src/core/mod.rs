/// Core connection handling: dialing, pooling, authentication and the
/// per-client relay session.
pub mod auth;
pub mod connect;
pub mod pool;
pub mod session;
pub mod tls;

use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;

/// Role classification of a backend node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Write-capable node; exactly one per cluster
    Primary,
    /// Read-capable node
    Replica,
}

/// A named backend endpoint. Immutable after configuration load.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub role: NodeRole,
    pub host_port: String,
}

impl Node {
    pub fn from_config(name: &str, config: &NodeConfig) -> Self {
        Self {
            name: name.to_string(),
            role: config.role,
            host_port: config.host_port.clone(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }
}
