//! Close status codes (RFC 6455 section 7.4).

/// Reason an endpoint gives when closing the connection.
///
/// The close payload carries the code as a 2-byte big-endian integer,
/// optionally followed by a UTF-8 reason string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure; the purpose of the connection has been fulfilled.
    Normal,
    /// The endpoint is going away (server shutdown, page navigation).
    Away,
    /// A protocol violation was detected.
    Protocol,
    /// The endpoint received a data type it cannot accept.
    Unsupported,
    /// No status code was present in the close frame.
    Status,
    /// The connection dropped without a close frame.
    Abnormal,
    /// Payload data was inconsistent with the message type.
    Invalid,
    /// A policy violation, when no more specific code applies.
    Policy,
    /// The message was too big to process.
    Size,
    /// The client required an extension the server did not negotiate.
    Extension,
    /// An unexpected internal error on the sending side.
    Error,
    /// Any other code (reserved ranges, IANA or application codes).
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_known_codes() {
        for code in [1000u16, 1001, 1002, 1007, 1008, 1009, 1011] {
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
    }

    #[test]
    fn test_other_codes() {
        assert_eq!(CloseCode::from(4000), CloseCode::Other(4000));
        assert_eq!(u16::from(CloseCode::Other(3999)), 3999);
    }
}
