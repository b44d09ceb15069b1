//! Worker pool: HTTP upgrade, frame decode and message dispatch.
//!
//! Each connection is pinned to one worker (`cid % pool_size`), so a
//! connection's parse state never moves between tasks and its messages are
//! handled strictly in arrival order.

use crate::registry::IoCmd;
use crate::server::ServerStats;
use crate::service::{Action, Outbox, Service};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use wsgate_protocol::{
    handshake, CloseCode, Frame, HttpParser, Message, OpCode, ProtocolError, Reassembler,
};

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

/// One unit of work for a connection's owning worker.
#[derive(Debug)]
pub struct WorkItem {
    pub cid: u64,
    pub event: ConnEvent,
}

/// What happened on the connection.
#[derive(Debug)]
pub enum ConnEvent {
    /// Bytes arrived from the peer.
    Data(Bytes),
    /// The peer closed the stream or the read failed.
    Eof,
}

/// Per-connection parse state, owned by exactly one worker.
struct ConnState {
    upgraded: bool,
    http: Option<HttpParser>,
    rx: BytesMut,
    reassembler: Reassembler,
}

impl ConnState {
    fn new() -> Self {
        Self {
            upgraded: false,
            http: Some(HttpParser::new()),
            rx: BytesMut::new(),
            reassembler: Reassembler::new(),
        }
    }
}

/// A worker task: pops items off its queue and drives the per-connection
/// upgrade and frame state machines, handing complete messages to the
/// [`Service`].
pub struct Worker<S: Service> {
    id: usize,
    service: Arc<S>,
    io_tx: mpsc::Sender<IoCmd>,
    fragment_size: usize,
    stats: Arc<ServerStats>,
    conns: HashMap<u64, ConnState>,
}

impl<S: Service> Worker<S> {
    pub fn new(
        id: usize,
        service: Arc<S>,
        io_tx: mpsc::Sender<IoCmd>,
        fragment_size: usize,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            id,
            service,
            io_tx,
            fragment_size,
            stats,
            conns: HashMap::new(),
        }
    }

    /// Runs until the work queue closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<WorkItem>) {
        while let Some(item) = rx.recv().await {
            match item.event {
                ConnEvent::Data(bytes) => self.on_data(item.cid, bytes).await,
                ConnEvent::Eof => {
                    self.conns.remove(&item.cid);
                    let _ = self.io_tx.send(IoCmd::Close { cid: item.cid }).await;
                }
            }
        }
        tracing::debug!("worker {} exiting", self.id);
    }

    async fn on_data(&mut self, cid: u64, bytes: Bytes) {
        let state = self.conns.entry(cid).or_insert_with(ConnState::new);
        state.rx.extend_from_slice(&bytes);
        let upgraded = state.upgraded;

        if !upgraded {
            match self.try_upgrade(cid).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    tracing::warn!("[cid={}] upgrade failed: {}", cid, e);
                    self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    self.conns.remove(&cid);
                    let _ = self
                        .io_tx
                        .send(IoCmd::CloseAfter {
                            cid,
                            bytes: Bytes::from_static(BAD_REQUEST),
                        })
                        .await;
                    return;
                }
            }
        }

        // Residual bytes received behind the upgrade request are frames.
        if let Err(e) = self.drain_frames(cid).await {
            tracing::warn!("[cid={}] protocol violation: {}", cid, e);
            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            self.conns.remove(&cid);
            let _ = self.close_with(cid, close_code_for(&e)).await;
        }
    }

    /// Feeds the HTTP parser; returns `Ok(true)` once the connection is
    /// upgraded (possibly with residual frame bytes left in `rx`).
    async fn try_upgrade(&mut self, cid: u64) -> Result<bool, ProtocolError> {
        let state = self
            .conns
            .get_mut(&cid)
            .ok_or_else(|| ProtocolError::Handshake("connection gone".into()))?;
        let parser = state.http.get_or_insert_with(HttpParser::new);

        let Some(consumed) = parser.parse(&state.rx)? else {
            return Ok(false);
        };

        let response = handshake::server_response(parser)?;
        let _ = state.rx.split_to(consumed);
        state.http = None;
        state.upgraded = true;

        tracing::info!("[cid={}] upgraded to WebSocket", cid);
        let _ = self
            .io_tx
            .send(IoCmd::Data {
                cid,
                bytes: Bytes::from(response.into_bytes()),
            })
            .await;
        Ok(true)
    }

    /// Decodes every complete frame buffered for the connection.
    async fn drain_frames(&mut self, cid: u64) -> Result<(), ProtocolError> {
        loop {
            let Some(state) = self.conns.get_mut(&cid) else {
                return Ok(());
            };
            let Some(frame) = Frame::decode(&mut state.rx)? else {
                return Ok(());
            };

            // Client-to-server frames must arrive masked (RFC 6455 5.1).
            if frame.mask.is_none() {
                return Err(ProtocolError::MaskViolation("unmasked client frame"));
            }

            match frame.opcode {
                OpCode::Close => {
                    let code = frame.close_code().unwrap_or(CloseCode::Normal);
                    tracing::debug!("[cid={}] close received: {}", cid, u16::from(code));
                    self.conns.remove(&cid);
                    self.close_with(cid, code).await;
                    return Ok(());
                }
                OpCode::Ping => {
                    let pong = Frame::pong(frame.payload).encode()?;
                    let _ = self
                        .io_tx
                        .send(IoCmd::Data {
                            cid,
                            bytes: pong.freeze(),
                        })
                        .await;
                }
                OpCode::Pong => {}
                _ => {
                    if let Some(message) = state.reassembler.push(frame)? {
                        self.stats.messages_in.fetch_add(1, Ordering::Relaxed);
                        self.dispatch(cid, message).await?;
                    }
                }
            }
        }
    }

    /// Invokes the handler under a recovery boundary and flushes its outbox.
    async fn dispatch(&mut self, cid: u64, message: Message) -> Result<(), ProtocolError> {
        let mut out = Outbox::new();
        let service = self.service.clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            service.process(cid, message, &mut out)
        }));
        if result.is_err() {
            tracing::error!("[cid={}] handler panicked, message dropped", cid);
            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        for (target, action) in out.drain() {
            match action {
                Action::Send(message) => {
                    let bytes = encode_message(message, self.fragment_size)?;
                    self.stats.messages_out.fetch_add(1, Ordering::Relaxed);
                    let _ = self.io_tx.send(IoCmd::Data { cid: target, bytes }).await;
                }
                Action::Close(code) => {
                    self.conns.remove(&target);
                    self.close_with(target, code).await;
                }
            }
        }
        Ok(())
    }

    async fn close_with(&self, cid: u64, code: CloseCode) {
        let bytes = match Frame::close(code, "").encode() {
            Ok(buf) => buf.freeze(),
            Err(_) => Bytes::new(),
        };
        let _ = self.io_tx.send(IoCmd::CloseAfter { cid, bytes }).await;
    }
}

/// Encodes a message into wire bytes in the server role (never masked),
/// splitting payloads above `fragment_size` into continuation frames.
pub fn encode_message(message: Message, fragment_size: usize) -> Result<Bytes, ProtocolError> {
    let frame = match message.opcode {
        OpCode::Text => Frame::text(message.data),
        _ => Frame::binary(message.data),
    };
    let mut buf = BytesMut::new();
    for fragment in frame.into_fragments(fragment_size) {
        fragment.encode_into(&mut buf)?;
    }
    Ok(buf.freeze())
}

fn close_code_for(err: &ProtocolError) -> CloseCode {
    match err {
        ProtocolError::FrameTooLarge { .. } => CloseCode::Size,
        ProtocolError::InvalidUtf8 => CloseCode::Invalid,
        _ => CloseCode::Protocol,
    }
}
