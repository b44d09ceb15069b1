//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing, handshaking or decoding envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid opcode: {0:#x}")]
    InvalidOpCode(u8),

    #[error("reserved bits set in frame header: {0:#x}")]
    ReservedBitsSet(u8),

    #[error("control frame violates RFC 6455: {0}")]
    BadControlFrame(&'static str),

    #[error("continuation frame without an initiating data frame")]
    UnexpectedContinuation,

    #[error("data frame received while a fragmented message is in progress")]
    InterleavedDataFrame,

    #[error("mask violation: {0}")]
    MaskViolation(&'static str),

    #[error("malformed HTTP message: {0}")]
    BadHttp(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("envelope decode failed: {0}")]
    Decode(String),

    #[error("envelope encode failed: {0}")]
    Encode(String),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100,
            max: 50,
        };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::InvalidOpCode(0x5);
        assert!(err.to_string().contains("0x5"));

        let err = ProtocolError::BadControlFrame("fragmented");
        assert!(err.to_string().contains("fragmented"));

        let err = ProtocolError::BadHttp("missing request line".into());
        assert!(err.to_string().contains("missing request line"));

        let err = ProtocolError::Decode("not a 3-element array".into());
        assert!(err.to_string().contains("3-element"));
    }
}
