/// Unified error handling for the compuerta proxy.
///
/// One error type covers the whole relay core: transport failures, protocol
/// violations, authentication failures, configuration problems and the SSL
/// negotiation outcomes. End-of-stream during normal operation is a clean
/// termination, not a failure; `is_disconnect` lets callers tell the two
/// apart.
use std::fmt;
use std::io;
use std::net::AddrParseError;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Network-related errors, including end-of-stream
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire-protocol violations
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backend connection errors
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Client or backend authentication failures
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// The backend answered the SSL probe with the refusal byte
    #[error("the backend does not allow SSL connections")]
    SslRefused,

    /// The backend answered the SSL probe with neither the acceptance nor
    /// the refusal byte
    #[error("unexpected SSL negotiation response: {0:#04x}")]
    UnexpectedSslResponse(u8),

    /// Transport-upgrade failures
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParse(#[from] AddrParseError),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        ProxyError::Backend {
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        ProxyError::Auth {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        ProxyError::Protocol(message.into())
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(message: S) -> Self {
        ProxyError::Tls {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        ProxyError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        ProxyError::Internal {
            message: message.into(),
        }
    }

    /// The peer closed its end of the stream. Clean termination during
    /// normal operation and benign mid-handshake.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ProxyError::Network(e) if e.kind() == io::ErrorKind::UnexpectedEof
        )
    }

    /// Check if this error is recoverable (a later attempt may succeed)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProxyError::Network(_) | ProxyError::Backend { .. } | ProxyError::Timeout { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ProxyError::Config(_) => ErrorSeverity::Critical,
            ProxyError::Internal { .. } => ErrorSeverity::Critical,
            ProxyError::Network(_) => ErrorSeverity::Warning,
            ProxyError::Backend { .. } => ErrorSeverity::Warning,
            ProxyError::Timeout { .. } => ErrorSeverity::Warning,
            ProxyError::SslRefused => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
        }
    }
}
