//! Error types for gateway-client

use thiserror::Error;

use crate::protocol::{ErrorCode, OriginalError};

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayClientError>;

/// Coarse classification of a [`GatewayClientError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Auth,
    Timeout,
    Gateway,
}

/// Errors surfaced to callers of the Gateway client
#[derive(Debug, Clone, Error)]
pub enum GatewayClientError {
    /// Transport failure, non-auth handshake rejection, or not-connected precondition
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Handshake rejected for authentication reasons
    #[error("Authentication failed: {message}")]
    Auth {
        code: Option<ErrorCode>,
        message: String,
    },

    /// A handshake, request, ack, or completion deadline elapsed
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The Gateway answered with a structured error
    #[error("Gateway error {code}: {message}")]
    Gateway {
        code: ErrorCode,
        message: String,
        original: Option<OriginalError>,
    },
}

impl GatewayClientError {
    /// Create a Connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// The error used when `disconnect()` sweeps outstanding waits
    pub fn connection_closed() -> Self {
        Self::connection("Connection closed")
    }

    /// The error used when a call is attempted without a live connection
    pub fn not_connected() -> Self {
        Self::connection("Not connected to gateway")
    }

    /// Create a Timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a Gateway error without translation metadata
    pub fn gateway(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self::Gateway {
            code: code.into(),
            message: message.into(),
            original: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Gateway { .. } => ErrorKind::Gateway,
        }
    }

    /// Auth failures are connection failures too; this checks for either
    pub fn is_connection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Auth)
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::connection(err.to_string())
    }
}
