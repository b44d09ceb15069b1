//! HTTP/1.1 upgrade handshake: incremental parsing, key generation and the
//! accept-key transform (RFC 6455 section 4).

use crate::error::ProtocolError;
use crate::{WS_GUID, WS_VERSION};
use base64::prelude::*;
use sha1::{Digest, Sha1};

/// Largest HTTP head (start line + headers) accepted before the parser
/// rejects the peer.
const MAX_HTTP_HEAD: usize = 16 * 1024;

/// Sub-protocol token mirrored back when the client offers none.
pub const DEFAULT_PROTOCOL: &str = "wsgate";

/// Generates a `Sec-WebSocket-Key`: base64 of 16 random bytes.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(nonce)
}

/// Computes `Sec-WebSocket-Accept` = base64(sha1(key ++ GUID)).
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Incremental parser for exactly one HTTP/1.1 message (the upgrade request
/// on the server, the upgrade response on the client).
///
/// [`parse`](Self::parse) is fed the connection's receive buffer and returns
/// the byte count consumed once the message boundary is reached, so any
/// residual bytes can be replayed as WebSocket frames. Header names are
/// folded to lowercase at insertion.
#[derive(Debug, Default)]
pub struct HttpParser {
    method: Option<String>,
    path: Option<String>,
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    complete: bool,
}

impl HttpParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to parse one complete HTTP message from the front of `buf`.
    ///
    /// Returns `Ok(Some(consumed))` when the message (head plus any
    /// `Content-Length` body) is complete, `Ok(None)` if more bytes are
    /// needed, or `Err` on malformed input.
    pub fn parse(&mut self, buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
        let head_end = match find_terminator(buf) {
            Some(pos) => pos,
            None => {
                if buf.len() > MAX_HTTP_HEAD {
                    return Err(ProtocolError::BadHttp("header section too large".into()));
                }
                return Ok(None);
            }
        };

        let head = std::str::from_utf8(&buf[..head_end])
            .map_err(|_| ProtocolError::BadHttp("non-UTF-8 header section".into()))?;
        let mut lines = head.split("\r\n");

        let start = lines
            .next()
            .ok_or_else(|| ProtocolError::BadHttp("missing start line".into()))?;
        self.parse_start_line(start)?;

        self.headers.clear();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::BadHttp(format!("malformed header: {line}")))?;
            self.headers
                .push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        let body_len = match self.header("content-length") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| ProtocolError::BadHttp("invalid content-length".into()))?,
            None => 0,
        };

        let total = head_end + 4 + body_len;
        if buf.len() < total {
            return Ok(None);
        }

        self.body = buf[head_end + 4..total].to_vec();
        self.complete = true;
        Ok(Some(total))
    }

    fn parse_start_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        if let Some(rest) = line.strip_prefix("HTTP/1.1 ") {
            let code = rest
                .split_whitespace()
                .next()
                .and_then(|s| s.parse::<u16>().ok())
                .ok_or_else(|| ProtocolError::BadHttp("malformed status line".into()))?;
            self.status = Some(code);
            return Ok(());
        }

        let mut parts = line.split_whitespace();
        let method = parts.next();
        let path = parts.next();
        let version = parts.next();
        match (method, path, version) {
            (Some(m), Some(p), Some("HTTP/1.1")) => {
                self.method = Some(m.to_string());
                self.path = Some(p.to_string());
                Ok(())
            }
            _ => Err(ProtocolError::BadHttp(format!(
                "malformed request line: {line}"
            ))),
        }
    }

    /// Looks a header up by name (case-insensitive); first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Renders the client upgrade request for `GET <path>`.
pub fn client_request(
    host: &str,
    path: &str,
    key: &str,
    origin: Option<&str>,
    protocol: Option<&str>,
) -> String {
    let mut req = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: {WS_VERSION}\r\n"
    );
    if let Some(origin) = origin {
        req.push_str(&format!("Origin: {origin}\r\n"));
    }
    if let Some(protocol) = protocol {
        req.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    req.push_str("\r\n");
    req
}

/// Builds the `101 Switching Protocols` response for a parsed upgrade
/// request, mirroring the client's sub-protocol when offered.
pub fn server_response(request: &HttpParser) -> Result<String, ProtocolError> {
    let key = request
        .header("sec-websocket-key")
        .ok_or_else(|| ProtocolError::Handshake("missing Sec-WebSocket-Key".into()))?;

    let protocol = request
        .header("sec-websocket-protocol")
        // The offer may be a comma-separated list; mirror the first token.
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_PROTOCOL);

    Ok(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Sec-WebSocket-Version: {WS_VERSION}\r\n\
         Sec-WebSocket-Protocol: {protocol}\r\n\
         \r\n",
        accept_key(key)
    ))
}

/// Verifies the server's upgrade response against the key we sent.
pub fn verify_server_response(response: &HttpParser, key: &str) -> Result<(), ProtocolError> {
    match response.status() {
        Some(101) => {}
        Some(code) => {
            return Err(ProtocolError::Handshake(format!(
                "expected status 101, got {code}"
            )))
        }
        None => return Err(ProtocolError::Handshake("missing status line".into())),
    }

    let expected = accept_key(key);
    match response.header("sec-websocket-accept") {
        Some(got) if got == expected => Ok(()),
        Some(got) => Err(ProtocolError::Handshake(format!(
            "Sec-WebSocket-Accept mismatch: {got}"
        ))),
        None => Err(ProtocolError::Handshake(
            "missing Sec-WebSocket-Accept".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_example() {
        // The worked example from RFC 6455 section 1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_key_is_16_bytes() {
        let key = generate_key();
        let decoded = BASE64_STANDARD.decode(&key).unwrap();
        assert_eq!(decoded.len(), 16);
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn test_parse_request() {
        let raw = b"GET /chat HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let mut parser = HttpParser::new();
        let consumed = parser.parse(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert!(parser.is_complete());
        assert_eq!(parser.method(), Some("GET"));
        assert_eq!(parser.path(), Some("/chat"));
        assert_eq!(parser.header("host"), Some("example.com"));
        // Case-insensitive lookup.
        assert_eq!(parser.header("UPGRADE"), Some("websocket"));
    }

    #[test]
    fn test_parse_incremental() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n";
        let mut parser = HttpParser::new();
        for cut in [5usize, 20, 40] {
            assert!(parser.parse(&raw[..cut]).unwrap().is_none());
        }
        let consumed = parser.parse(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(parser.status(), Some(101));
    }

    #[test]
    fn test_residual_bytes_not_consumed() {
        let mut raw = b"GET / HTTP/1.1\r\nHost: h\r\nSec-WebSocket-Key: abc\r\n\r\n".to_vec();
        let head_len = raw.len();
        raw.extend_from_slice(&[0x81, 0x01, b'x']); // a frame right behind the head
        let mut parser = HttpParser::new();
        let consumed = parser.parse(&raw).unwrap().unwrap();
        assert_eq!(consumed, head_len);
    }

    #[test]
    fn test_body_routed_to_body_buffer() {
        let raw = b"GET / HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\n\r\nbody";
        let mut parser = HttpParser::new();
        let consumed = parser.parse(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(parser.body(), b"body");
        assert_eq!(parser.path(), Some("/"));
    }

    #[test]
    fn test_malformed_request_line() {
        let mut parser = HttpParser::new();
        let err = parser.parse(b"NONSENSE\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProtocolError::BadHttp(_)));
    }

    #[test]
    fn test_server_response_echoes_protocol() {
        let raw = b"GET / HTTP/1.1\r\nHost: h\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Protocol: chat, superchat\r\n\r\n";
        let mut parser = HttpParser::new();
        parser.parse(raw).unwrap().unwrap();
        let response = server_response(&parser).unwrap();
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(response.contains("Sec-WebSocket-Protocol: chat\r\n"));
    }

    #[test]
    fn test_server_response_default_protocol() {
        let raw = b"GET / HTTP/1.1\r\nHost: h\r\nSec-WebSocket-Key: abc\r\n\r\n";
        let mut parser = HttpParser::new();
        parser.parse(raw).unwrap().unwrap();
        let response = server_response(&parser).unwrap();
        assert!(response.contains(&format!("Sec-WebSocket-Protocol: {DEFAULT_PROTOCOL}")));
    }

    #[test]
    fn test_server_response_requires_key() {
        let raw = b"GET / HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut parser = HttpParser::new();
        parser.parse(raw).unwrap().unwrap();
        assert!(matches!(
            server_response(&parser),
            Err(ProtocolError::Handshake(_))
        ));
    }

    #[test]
    fn test_verify_server_response() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let good = format!(
            "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(key)
        );
        let mut parser = HttpParser::new();
        parser.parse(good.as_bytes()).unwrap().unwrap();
        assert!(verify_server_response(&parser, key).is_ok());
    }

    #[test]
    fn test_verify_rejects_bad_accept() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: XXX\r\n\r\n";
        let mut parser = HttpParser::new();
        parser.parse(raw).unwrap().unwrap();
        assert!(matches!(
            verify_server_response(&parser, "whatever"),
            Err(ProtocolError::Handshake(_))
        ));
    }

    #[test]
    fn test_verify_rejects_non_101() {
        let raw = b"HTTP/1.1 403 Forbidden\r\n\r\n";
        let mut parser = HttpParser::new();
        parser.parse(raw).unwrap().unwrap();
        assert!(matches!(
            verify_server_response(&parser, "k"),
            Err(ProtocolError::Handshake(_))
        ));
    }

    #[test]
    fn test_client_request_headers() {
        let req = client_request("example.com:9001", "/ws", "KEY", Some("http://example.com"), None);
        assert!(req.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(req.contains("Host: example.com:9001\r\n"));
        assert!(req.contains("Sec-WebSocket-Key: KEY\r\n"));
        assert!(req.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(req.contains("Origin: http://example.com\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }
}
