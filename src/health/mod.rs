/// Node reachability monitoring.
///
/// Observational only: transitions are logged for operators, and routing is
/// left entirely to the pool registry. A node that stops answering shows up
/// here long before its pooled connections start failing queries.
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::HealthConfig;
use crate::core::Node;

/// Health status of a backend node
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy node
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Periodic TCP-dial health checks over the configured node inventory.
pub struct NodeMonitor {
    nodes: Vec<Node>,
    interval: Duration,
    check_timeout: Duration,
}

impl NodeMonitor {
    pub fn new(nodes: Vec<Node>, config: &HealthConfig) -> Self {
        Self {
            nodes,
            interval: Duration::from_secs(config.interval_sec),
            check_timeout: Duration::from_secs(config.timeout_sec),
        }
    }

    /// Dial the node once and classify the outcome.
    pub async fn check_node(&self, node: &Node) -> HealthStatus {
        match timeout(self.check_timeout, TcpStream::connect(&node.host_port)).await {
            Ok(Ok(_)) => HealthStatus::Healthy,
            Ok(Err(e)) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
            Err(_) => HealthStatus::Timeout,
        }
    }

    /// Run continuous health checking, logging status transitions.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut statuses: HashMap<String, HealthStatus> = HashMap::new();

        loop {
            ticker.tick().await;

            for node in &self.nodes {
                let status = self.check_node(node).await;
                let previous = statuses.get(&node.name);

                match (&status, previous) {
                    (current, Some(previous)) if current == previous => {
                        tracing::trace!(node = %node.name, status = %status, "node status unchanged");
                    }
                    (HealthStatus::Healthy, _) => {
                        tracing::info!(node = %node.name, "node is reachable");
                    }
                    (status, _) => {
                        tracing::warn!(node = %node.name, status = %status, "node is unreachable");
                    }
                }

                statuses.insert(node.name.clone(), status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeRole;
    use tokio::net::TcpListener;

    fn monitor(nodes: Vec<Node>) -> NodeMonitor {
        NodeMonitor::new(
            nodes,
            &HealthConfig {
                interval_sec: 10,
                timeout_sec: 1,
            },
        )
    }

    fn node(name: &str, host_port: String) -> Node {
        Node {
            name: name.to_string(),
            role: NodeRole::Replica,
            host_port,
        }
    }

    #[tokio::test]
    async fn test_check_node_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let monitor = monitor(Vec::new());
        let status = monitor.check_node(&node("replica1", addr)).await;
        assert!(status.is_healthy());
    }

    #[tokio::test]
    async fn test_check_node_unreachable() {
        // nothing listens on this port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let monitor = monitor(Vec::new());
        let status = monitor.check_node(&node("replica1", addr)).await;
        assert!(!status.is_healthy());
    }
}
