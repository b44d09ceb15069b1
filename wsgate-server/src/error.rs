//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] wsgate_protocol::ProtocolError),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("server already running")]
    AlreadyRunning,

    #[error("unknown connection: {0}")]
    UnknownConnection(u64),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}
