//! WebSocket client connection.

use crate::error::ClientError;
use crate::stream::ClientStream;
use crate::tls::{create_insecure_tls_connector, create_tls_connector};
use bytes::BytesMut;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;
use wsgate_protocol::{
    handshake, CloseCode, Frame, HttpParser, Message, OpCode, ProtocolError, Reassembler,
    DEFAULT_FRAGMENT_SIZE,
};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Server URL (`ws://` or `wss://`).
    pub url: String,
    /// Optional `Origin` header.
    pub origin: Option<String>,
    /// Optional `Sec-WebSocket-Protocol` offer.
    pub protocol: Option<String>,
    /// Connect and handshake timeout.
    pub connect_timeout: Duration,
    /// Per-operation read/write timeout.
    pub timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Payloads above this size are split into continuation frames.
    pub fragment_size: usize,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, system roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure_tls: bool,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            origin: None,
            protocol: None,
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            ca_cert_path: None,
            insecure_tls: false,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_insecure_tls(mut self) -> Self {
        self.insecure_tls = true;
        self
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Connecting,
    Handshaking,
    Connected,
    Closing,
}

/// Parsed connection target.
struct Target {
    host: String,
    port: u16,
    path: String,
    tls: bool,
    host_header: String,
}

fn parse_url(raw: &str) -> Result<Target, ClientError> {
    let url = Url::parse(raw).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    let tls = match url.scheme() {
        "ws" | "http" => false,
        "wss" | "https" => true,
        other => {
            return Err(ClientError::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )))
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| ClientError::InvalidUrl("missing host".into()))?
        .to_string();
    let default_port = if tls { 443 } else { 80 };
    let port = url.port().unwrap_or(default_port);

    let mut path = url.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let host_header = if port == default_port {
        host.clone()
    } else {
        format!("{host}:{port}")
    };

    Ok(Target {
        host,
        port,
        path,
        tls,
        host_header,
    })
}

/// An async WebSocket client.
///
/// All operations run on the caller's task; each socket read and write is
/// bounded by the configured per-operation timeout. A timeout returns to the
/// caller without closing the socket, so the operation can be retried.
pub struct WsClient {
    config: WsConfig,
    stream: Option<ClientStream>,
    rx: BytesMut,
    reassembler: Reassembler,
    state: ConnState,
    timeout: Duration,
}

impl WsClient {
    /// Creates a new client (not yet connected).
    pub fn new(config: WsConfig) -> Self {
        let timeout = config.timeout;
        Self {
            config,
            stream: None,
            rx: BytesMut::new(),
            reassembler: Reassembler::new(),
            state: ConnState::Closed,
            timeout,
        }
    }

    /// Connects the socket and performs the upgrade handshake.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let target = parse_url(&self.config.url)?;
        self.state = ConnState::Connecting;
        tracing::debug!("Connecting to {}:{}...", target.host, target.port);

        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| {
            self.state = ConnState::Closed;
            ClientError::Timeout
        })?
        .map_err(|e| {
            self.state = ConnState::Closed;
            ClientError::Io(e)
        })?;

        tcp_stream.set_nodelay(true).ok();

        let stream = if target.tls {
            let (connector, server_name) = if self.config.insecure_tls {
                tracing::warn!("Using insecure TLS (certificate verification disabled)");
                create_insecure_tls_connector(&target.host)?
            } else {
                create_tls_connector(self.config.ca_cert_path.as_deref(), &target.host)?
            };

            let tls_stream = connector
                .connect(server_name, tcp_stream)
                .await
                .map_err(|e| {
                    self.state = ConnState::Closed;
                    ClientError::TlsHandshake(e.to_string())
                })?;
            ClientStream::Tls { inner: tls_stream }
        } else {
            ClientStream::Tcp { inner: tcp_stream }
        };

        self.stream = Some(stream);
        self.rx.clear();
        self.reassembler = Reassembler::new();
        self.state = ConnState::Handshaking;

        match self.upgrade(&target).await {
            Ok(()) => {
                self.state = ConnState::Connected;
                tracing::debug!("WebSocket handshake complete");
                Ok(())
            }
            Err(e) => {
                self.stream = None;
                self.state = ConnState::Closed;
                Err(e)
            }
        }
    }

    /// Sends the upgrade request and verifies the response. Residual bytes
    /// behind the response head stay in the receive buffer as frame data.
    async fn upgrade(&mut self, target: &Target) -> Result<(), ClientError> {
        let key = handshake::generate_key();
        let request = handshake::client_request(
            &target.host_header,
            &target.path,
            &key,
            self.config.origin.as_deref(),
            self.config.protocol.as_deref(),
        );
        self.write_all(request.as_bytes()).await?;

        let mut parser = HttpParser::new();
        let consumed = loop {
            if let Some(consumed) = parser.parse(&self.rx)? {
                break consumed;
            }
            if self.fill(self.config.connect_timeout).await? == 0 {
                return Err(ClientError::Disconnected);
            }
        };

        handshake::verify_server_response(&parser, &key)
            .map_err(|e| ClientError::Handshake(e.to_string()))?;
        let _ = self.rx.split_to(consumed);
        Ok(())
    }

    /// Sends a frame, masking it (client role) if no key is set yet.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<(), ClientError> {
        if self.state != ConnState::Connected {
            return Err(ClientError::NotConnected);
        }
        let frame = if frame.mask.is_none() {
            frame.with_random_mask()
        } else {
            frame
        };
        let bytes = frame.encode()?;
        self.write_all(&bytes).await
    }

    /// Sends a text message.
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send_msg(Message::text(text.into().into_bytes())).await
    }

    /// Sends a binary message.
    pub async fn send_binary(&mut self, data: impl Into<bytes::Bytes>) -> Result<(), ClientError> {
        self.send_msg(Message::binary(data)).await
    }

    /// Sends a data message, fragmenting payloads above the configured cap.
    pub async fn send_msg(&mut self, message: Message) -> Result<(), ClientError> {
        let frame = match message.opcode {
            OpCode::Text => Frame::text(message.data),
            _ => Frame::binary(message.data),
        };
        for fragment in frame.into_fragments(self.config.fragment_size) {
            self.send_frame(fragment).await?;
        }
        Ok(())
    }

    /// Receives the next data frame.
    ///
    /// Control frames are handled inline: Ping is answered with a Pong
    /// carrying the same payload, Pong is discarded, and Close is echoed
    /// before the connection enters `Closing` and `Ok(None)` is returned.
    /// A read timeout also returns `Ok(None)`; the socket stays open. A
    /// protocol violation by the peer sends Close(1002) before surfacing
    /// the error.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>, ClientError> {
        if self.state != ConnState::Connected {
            return Err(ClientError::NotConnected);
        }

        loop {
            match Frame::decode(&mut self.rx) {
                Ok(Some(frame)) => {
                    // Server-to-client frames arrive unmasked (RFC 6455 5.1).
                    if frame.mask.is_some() {
                        let err = ProtocolError::MaskViolation("masked server frame");
                        self.fail_connection(&err).await;
                        return Err(err.into());
                    }
                    match frame.opcode {
                        OpCode::Ping => {
                            let pong = Frame::pong(frame.payload).with_random_mask().encode()?;
                            self.write_all(&pong).await?;
                        }
                        OpCode::Pong => {}
                        OpCode::Close => {
                            let code = frame.close_code().unwrap_or(CloseCode::Normal);
                            tracing::debug!("Close received: {}", u16::from(code));
                            let echo = Frame::close(code, "").with_random_mask().encode()?;
                            let _ = self.write_all(&echo).await;
                            self.state = ConnState::Closing;
                            return Ok(None);
                        }
                        _ => return Ok(Some(frame)),
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    self.fail_connection(&e).await;
                    return Err(e.into());
                }
            }

            match self.fill(self.timeout).await {
                Ok(0) => {
                    self.stream = None;
                    self.state = ConnState::Closed;
                    return Err(ClientError::Disconnected);
                }
                Ok(_) => {}
                Err(ClientError::Timeout) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Receives the next complete data message, reassembling fragments.
    /// A reassembly violation closes the connection with 1002.
    pub async fn recv_msg(&mut self) -> Result<Option<Message>, ClientError> {
        loop {
            let Some(frame) = self.recv_frame().await? else {
                return Ok(None);
            };
            match self.reassembler.push(frame) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => {}
                Err(e) => {
                    self.fail_connection(&e).await;
                    return Err(e.into());
                }
            }
        }
    }

    /// Answers a peer protocol violation: sends Close with the matching
    /// status code and leaves the connection unusable for data.
    async fn fail_connection(&mut self, err: &ProtocolError) {
        let code = match err {
            ProtocolError::FrameTooLarge { .. } => CloseCode::Size,
            ProtocolError::InvalidUtf8 => CloseCode::Invalid,
            _ => CloseCode::Protocol,
        };
        if let Ok(close) = Frame::close(code, "").with_random_mask().encode() {
            let _ = self.write_all(&close).await;
        }
        if self.stream.is_some() {
            self.state = ConnState::Closing;
        }
    }

    /// Sends Close(1000) and tears the connection down.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        if self.state == ConnState::Connected {
            let close = Frame::close(CloseCode::Normal, "")
                .with_random_mask()
                .encode()?;
            let _ = self.write_all(&close).await;
            self.state = ConnState::Closing;
        }

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.state = ConnState::Closed;
        Ok(())
    }

    /// Sets the per-operation timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Returns the connection state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    /// Reads once from the socket into the receive buffer, returning the
    /// byte count. A timeout leaves the socket open.
    async fn fill(&mut self, timeout: Duration) -> Result<usize, ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let mut buf = vec![0u8; self.config.read_buffer_size];
        match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => {
                self.rx.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::debug!("read error: {}", e);
                self.stream = None;
                self.state = ConnState::Closed;
                Err(ClientError::Disconnected)
            }
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        match tokio::time::timeout(self.timeout, stream.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::debug!("write error: {}", e);
                self.stream = None;
                self.state = ConnState::Closed;
                Err(ClientError::Disconnected)
            }
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_url_defaults() {
        let target = parse_url("ws://example.com/chat").unwrap();
        assert!(!target.tls);
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);
        assert_eq!(target.path, "/chat");
        assert_eq!(target.host_header, "example.com");
    }

    #[test]
    fn test_parse_url_explicit_port_and_query() {
        let target = parse_url("wss://example.com:9443/ws?token=x").unwrap();
        assert!(target.tls);
        assert_eq!(target.port, 9443);
        assert_eq!(target.path, "/ws?token=x");
        assert_eq!(target.host_header, "example.com:9443");
    }

    #[test]
    fn test_parse_url_http_aliases() {
        assert!(!parse_url("http://example.com/").unwrap().tls);
        assert!(parse_url("https://example.com/").unwrap().tls);
    }

    #[test]
    fn test_parse_url_rejects_other_schemes() {
        assert!(matches!(
            parse_url("ftp://example.com/"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_url("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_ops_require_connection() {
        let mut client = WsClient::new(WsConfig::new("ws://127.0.0.1:1/"));
        assert_eq!(client.state(), ConnState::Closed);
        assert!(matches!(
            tokio_test::block_on(client.send_text("x")),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            tokio_test::block_on(client.recv_frame()),
            Err(ClientError::NotConnected)
        ));
    }

    /// Minimal in-test server: performs the upgrade, then echoes data
    /// frames until the client closes.
    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut rx = BytesMut::new();
            let mut buf = [0u8; 4096];

            let mut parser = HttpParser::new();
            let consumed = loop {
                if let Some(consumed) = parser.parse(&rx).unwrap() {
                    break consumed;
                }
                let n = stream.read(&mut buf).await.unwrap();
                rx.extend_from_slice(&buf[..n]);
            };
            let response = handshake::server_response(&parser).unwrap();
            let _ = rx.split_to(consumed);
            stream.write_all(response.as_bytes()).await.unwrap();

            loop {
                while let Some(frame) = Frame::decode(&mut rx).unwrap() {
                    match frame.opcode {
                        OpCode::Close => {
                            let echo = Frame::close(CloseCode::Normal, "").encode().unwrap();
                            let _ = stream.write_all(&echo).await;
                            return;
                        }
                        OpCode::Ping => {
                            let pong = Frame::pong(frame.payload).encode().unwrap();
                            stream.write_all(&pong).await.unwrap();
                        }
                        OpCode::Pong => {}
                        _ => {
                            let out = Frame {
                                fin: frame.fin,
                                opcode: frame.opcode,
                                mask: None,
                                payload: frame.payload,
                            };
                            stream.write_all(&out.encode().unwrap()).await.unwrap();
                        }
                    }
                }
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                rx.extend_from_slice(&buf[..n]);
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_send_recv_disconnect() {
        let addr = spawn_echo_server().await;
        let mut client = WsClient::new(WsConfig::new(format!("ws://{addr}/ws")));
        client.connect().await.unwrap();
        assert!(client.is_connected());

        client.send_text("hello").await.unwrap();
        let msg = client.recv_msg().await.unwrap().unwrap();
        assert_eq!(msg.opcode, OpCode::Text);
        assert_eq!(msg.data.as_ref(), b"hello");

        client.disconnect().await.unwrap();
        assert_eq!(client.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_recv_discards_pong() {
        let addr = spawn_echo_server().await;
        let mut client = WsClient::new(WsConfig::new(format!("ws://{addr}/ws")));
        client.connect().await.unwrap();

        // The echo server answers a Ping with a Pong; recv must skip it and
        // hand back the data frame that follows.
        client.send_frame(Frame::ping(&b"tick"[..])).await.unwrap();
        client.send_text("after").await.unwrap();
        let msg = client.recv_msg().await.unwrap().unwrap();
        assert_eq!(msg.data.as_ref(), b"after");

        client.disconnect().await.unwrap();
    }

    /// Performs the server side of the upgrade on an accepted socket.
    async fn accept_upgrade(stream: &mut tokio::net::TcpStream, rx: &mut BytesMut) {
        let mut buf = [0u8; 4096];
        let mut parser = HttpParser::new();
        let consumed = loop {
            if let Some(consumed) = parser.parse(rx).unwrap() {
                break consumed;
            }
            let n = stream.read(&mut buf).await.unwrap();
            rx.extend_from_slice(&buf[..n]);
        };
        let response = handshake::server_response(&parser).unwrap();
        let _ = rx.split_to(consumed);
        stream.write_all(response.as_bytes()).await.unwrap();
    }

    /// Reads frames off the socket until a Close arrives, returning its code.
    async fn await_close(
        stream: &mut tokio::net::TcpStream,
        rx: &mut BytesMut,
    ) -> Option<CloseCode> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = Frame::decode(rx).unwrap() {
                if frame.opcode == OpCode::Close {
                    return frame.close_code();
                }
                continue;
            }
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return None;
            }
            rx.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_orphan_continuation_fails_connection_with_1002() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut rx = BytesMut::new();
            accept_upgrade(&mut stream, &mut rx).await;

            let stray = Frame::continuation("stray").encode().unwrap();
            stream.write_all(&stray).await.unwrap();

            await_close(&mut stream, &mut rx).await
        });

        let mut client = WsClient::new(WsConfig::new(format!("ws://{addr}/")));
        client.connect().await.unwrap();

        let err = client.recv_msg().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::UnexpectedContinuation)
        ));
        assert!(!client.is_connected());
        assert_eq!(server.await.unwrap(), Some(CloseCode::Protocol));
    }

    #[tokio::test]
    async fn test_masked_server_frame_fails_connection_with_1002() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut rx = BytesMut::new();
            accept_upgrade(&mut stream, &mut rx).await;

            let masked = Frame::text("wrong way").with_random_mask().encode().unwrap();
            stream.write_all(&masked).await.unwrap();

            await_close(&mut stream, &mut rx).await
        });

        let mut client = WsClient::new(WsConfig::new(format!("ws://{addr}/")));
        client.connect().await.unwrap();

        let err = client.recv_msg().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::MaskViolation(_))
        ));
        assert!(!client.is_connected());
        assert_eq!(server.await.unwrap(), Some(CloseCode::Protocol));
    }

    #[tokio::test]
    async fn test_handshake_mismatch_fails_connect() {
        // A server that answers with a wrong accept key.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let mut rx = BytesMut::new();
            let mut parser = HttpParser::new();
            loop {
                if parser.parse(&rx).unwrap().is_some() {
                    break;
                }
                let n = stream.read(&mut buf).await.unwrap();
                rx.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: bm90IHRoZSByaWdodCBrZXk=\r\n\r\n",
                )
                .await
                .unwrap();
        });

        let mut client = WsClient::new(WsConfig::new(format!("ws://{addr}/")));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Handshake(_)));
        assert_eq!(client.state(), ConnState::Closed);
    }
}
