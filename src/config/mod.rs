/// Configuration management for compuerta

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::core::NodeRole;

/// Main compuerta configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Connection pool configuration
    pub pool: PoolConfig,
    /// Backend node inventory, keyed by node name
    pub nodes: HashMap<String, NodeConfig>,
    /// Credentials the proxy connects and validates clients with
    pub credentials: Credentials,
    /// Health check configuration
    pub health: HealthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// Number of worker threads
    pub worker_threads: Option<usize>,
    /// Optional deadline for backend reads during a response drain, in
    /// seconds. Unset preserves fully blocking drain semantics.
    pub backend_read_timeout_sec: Option<u64>,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of connections seeded per node
    pub capacity: usize,
}

/// A single backend node entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Role of the node: primary (write-capable) or replica (read-capable)
    pub role: NodeRole,
    /// host:port address of the node
    pub host_port: String,
}

/// Credentials used for backend connections and client validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub database: String,
    /// Extra startup parameters forwarded to the backend
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// Encrypted-transport settings
    pub ssl: SslConfig,
}

/// Encrypted-transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    /// Negotiate SSL with backends and offer it to clients
    pub enable: bool,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Health check interval in seconds
    pub interval_sec: u64,
    /// Health check timeout in seconds
    pub timeout_sec: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            "primary".to_string(),
            NodeConfig {
                role: NodeRole::Primary,
                host_port: "127.0.0.1:5432".to_string(),
            },
        );

        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:5433".to_string(),
                worker_threads: None, // Use system default
                backend_read_timeout_sec: None,
            },
            pool: PoolConfig { capacity: 5 },
            nodes,
            credentials: Credentials {
                username: "postgres".to_string(),
                password: "postgres".to_string(),
                database: "postgres".to_string(),
                options: HashMap::new(),
                ssl: SslConfig { enable: false },
            },
            health: HealthConfig {
                interval_sec: 10,
                timeout_sec: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "listen_addr cannot be empty".to_string(),
            ));
        }

        // Capacity of at least one per node is a startup precondition of the
        // relay loop.
        if self.pool.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "pool capacity must be greater than 0".to_string(),
            ));
        }

        if self.nodes.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one backend node is required".to_string(),
            ));
        }

        for (name, node) in &self.nodes {
            crate::utils::parse_socket_addr(&node.host_port).map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Invalid host_port for node '{}': {}",
                    name, node.host_port
                ))
            })?;
        }

        let primaries = self
            .nodes
            .values()
            .filter(|n| n.role == NodeRole::Primary)
            .count();
        if primaries != 1 {
            return Err(ConfigError::ValidationError(format!(
                "exactly one primary node is required, found {}",
                primaries
            )));
        }

        if self.credentials.username.is_empty() || self.credentials.database.is_empty() {
            return Err(ConfigError::ValidationError(
                "credentials username and database cannot be empty".to_string(),
            ));
        }

        if self.health.interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health check interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.health.timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health check timeout_sec must be greater than 0".to_string(),
            ));
        }

        if self.health.timeout_sec >= self.health.interval_sec {
            return Err(ConfigError::ValidationError(
                "health check timeout_sec must be less than interval_sec".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let mut nodes = HashMap::new();
        nodes.insert(
            "primary".to_string(),
            NodeConfig {
                role: NodeRole::Primary,
                host_port: "10.0.1.10:5432".to_string(),
            },
        );
        nodes.insert(
            "replica1".to_string(),
            NodeConfig {
                role: NodeRole::Replica,
                host_port: "10.0.1.11:5432".to_string(),
            },
        );
        nodes.insert(
            "replica2".to_string(),
            NodeConfig {
                role: NodeRole::Replica,
                host_port: "10.0.1.12:5432".to_string(),
            },
        );

        let config = Config {
            nodes,
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
