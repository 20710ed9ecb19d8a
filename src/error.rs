//! Error types for tokendb-gateway

use std::io::ErrorKind;

use thiserror::Error;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum ProxyError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed, truncated or unexpected frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Token invalid, permission denied, bad proof or backend rejected credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Dial or handshake failure towards the real database
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Socket failure while relaying an established session
    #[error("Relay error: {0}")]
    Relay(String),

    /// Recording or storage failure (never fatal to the relay)
    #[error("Audit sink error: {0}")]
    AuditSink(String),

    /// Control plane transport or response error
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Result type alias for ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Whether the client should be told its credentials were rejected.
    ///
    /// Control plane failures count as authentication failures at the
    /// protocol boundary; the client never learns why resolution failed.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ProxyError::Auth(_) | ProxyError::ControlPlane(_))
    }

    /// Whether this error is the peer going away rather than a real fault.
    pub fn is_peer_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::AuditSink(err.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::ControlPlane(err.to_string())
    }
}
