//! Error types for the VeloxMQ transport layer

use crate::tls::TlsError;

/// Main error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum VeloxmqError {
    /// The connection has been closed and accepts no further writes
    #[error("connection is closed")]
    ConnectionClosed,

    /// A wait on the transport was interrupted before it could complete
    #[error("interrupted while waiting for the transport")]
    Interrupted,

    /// Connection establishment failed
    #[error("connect error: {message}")]
    Connect { message: String },

    /// A bounded wait elapsed
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// TLS setup or handshake errors
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VeloxmqError {
    /// Create a new connect error
    pub fn connect<S: Into<String>>(message: S) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout { .. } | Self::Interrupted | Self::Io(_)
        )
    }

    /// Check if this error indicates a dead or unusable connection
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::ConnectionClosed | Self::Io(_)
        )
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
