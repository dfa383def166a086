pub mod config;
pub mod error;
/// Compuerta - transparent PostgreSQL cluster proxy
///
/// Compuerta terminates client connections, optionally negotiates an
/// encrypted transport, authenticates clients against the cluster, and
/// relays wire-protocol frames to backend connections drawn from
/// role-partitioned pools: writes go to the primary, annotated reads to the
/// replicas, and multi-statement blocks stay pinned to one backend.
pub mod core;
pub mod health;
pub mod protocol;
pub mod stats;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::core::pool::{BackendConnection, ConnectionPool, PoolRegistry};
use crate::core::session::{Session, SessionContext};
use crate::core::tls::{NoUpgrade, StreamUpgrader};
use crate::core::{auth, connect, Node};
use crate::error::{ProxyError, ProxyResult};
use crate::health::NodeMonitor;
use crate::stats::StatsRegistry;

/// Top-level proxy instance: owns the pool registry, the stats registry and
/// the accept loop. One session task is spawned per accepted client; the
/// sessions share the registries and otherwise run independently.
pub struct Proxy {
    config: Config,
    registry: Arc<PoolRegistry>,
    stats: Arc<StatsRegistry>,
    upgrader: Arc<dyn StreamUpgrader>,
}

impl Proxy {
    /// Create a proxy with the default (refusing) transport upgrader.
    pub fn new(config: Config) -> Self {
        Self::with_upgrader(config, Arc::new(NoUpgrade))
    }

    /// Create a proxy with an injected transport upgrader.
    pub fn with_upgrader(config: Config, upgrader: Arc<dyn StreamUpgrader>) -> Self {
        Self {
            config,
            registry: Arc::new(PoolRegistry::new()),
            stats: Arc::new(StatsRegistry::new()),
            upgrader,
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared per-node query counters.
    pub fn stats(&self) -> Arc<StatsRegistry> {
        Arc::clone(&self.stats)
    }

    /// Shared role-partitioned pool registry.
    pub fn registry(&self) -> Arc<PoolRegistry> {
        Arc::clone(&self.registry)
    }

    fn nodes(&self) -> Vec<Node> {
        self.config
            .nodes
            .iter()
            .map(|(name, node_config)| Node::from_config(name, node_config))
            .collect()
    }

    fn primary_node(&self) -> ProxyResult<Node> {
        self.nodes()
            .into_iter()
            .find(Node::is_primary)
            .ok_or_else(|| ProxyError::internal("no primary node configured"))
    }

    /// Seed every node's pool with up to `capacity` authenticated
    /// connections and register the pools under their roles. A node that
    /// cannot be dialed or authenticated starts under capacity; that is
    /// logged, not fatal.
    pub async fn setup_pools(&self) -> ProxyResult<()> {
        let capacity = self.config.pool.capacity;

        for node in self.nodes() {
            let pool = Arc::new(ConnectionPool::new(node.name.clone(), capacity));

            for _ in 0..capacity {
                info!("Connecting to node '{}' at {}...", node.name, node.host_port);
                match self.seed_connection(&node).await {
                    Ok(connection) => {
                        pool.add(connection).await;
                        info!(
                            "Successfully connected to '{}' at '{}'",
                            node.name, node.host_port
                        );
                    }
                    Err(err) => {
                        error!("Error establishing connection to node '{}'", node.name);
                        error!("Error: {}", err);
                    }
                }
            }

            let seeded = pool.size().await;
            if seeded < capacity {
                warn!(
                    "Pool for node '{}' started with {}/{} connections",
                    node.name, seeded, capacity
                );
            }

            self.registry.add_pool(node.role, pool).await;
        }

        Ok(())
    }

    /// Dial one backend connection, negotiate SSL when enabled, and run the
    /// startup/authentication exchange. Only fully authenticated
    /// connections are pooled.
    async fn seed_connection(&self, node: &Node) -> ProxyResult<BackendConnection> {
        let credentials = &self.config.credentials;

        let mut stream =
            connect::connect(&node.host_port, &credentials.ssl, self.upgrader.as_ref()).await?;

        let startup = protocol::create_startup_message(
            &credentials.username,
            &credentials.database,
            &credentials.options,
        );
        connect::send(&mut stream, &startup).await?;

        let challenge = connect::receive(&mut stream).await?;
        let authenticated =
            auth::handle_authentication_request(&mut stream, &challenge, credentials).await?;
        if !authenticated {
            return Err(ProxyError::auth(format!(
                "authentication failed for node '{}'",
                node.name
            )));
        }

        Ok(BackendConnection::new(stream, node.name.clone()))
    }

    /// Serve clients on an already bound listener. Pools must be seeded
    /// first.
    pub async fn serve(&self, listener: TcpListener) -> ProxyResult<()> {
        let context = Arc::new(SessionContext {
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
            credentials: self.config.credentials.clone(),
            primary: self.primary_node()?,
            upgrader: Arc::clone(&self.upgrader),
            backend_read_timeout: self
                .config
                .server
                .backend_read_timeout_sec
                .map(Duration::from_secs),
        });

        let monitor = NodeMonitor::new(self.nodes(), &self.config.health);
        tokio::spawn(monitor.run());
        tokio::spawn(
            Arc::clone(&self.stats)
                .run_reporter(Duration::from_secs(self.config.health.interval_sec)),
        );

        info!("Listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;

            if let Err(err) = stream.set_nodelay(true) {
                warn!("Failed to configure client stream: {}", err);
            }

            let session = Session::new(Arc::clone(&context), addr.to_string());
            tokio::spawn(session.run(Box::new(stream)));
        }
    }

    /// Seed the pools, bind the configured address and serve until the
    /// listener fails.
    pub async fn run(&self) -> ProxyResult<()> {
        self.setup_pools().await?;
        let listener = TcpListener::bind(&self.config.server.listen_addr).await?;
        self.serve(listener).await
    }
}
