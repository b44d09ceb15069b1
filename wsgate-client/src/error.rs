//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] wsgate_protocol::ProtocolError),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Disconnected,

    #[error("operation timeout")]
    Timeout,

    #[error("request dropped ({})", if *.sent { "sent, reply unknown" } else { "never sent" })]
    Dropped { sent: bool },

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Timeout
                | ClientError::Disconnected
                | ClientError::Dropped { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_display_distinguishes_direction() {
        let unsent = ClientError::Dropped { sent: false };
        assert!(unsent.to_string().contains("never sent"));
        let sent = ClientError::Dropped { sent: true };
        assert!(sent.to_string().contains("reply unknown"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::Disconnected.is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());
        assert!(!ClientError::Handshake("x".into()).is_retryable());
    }
}
