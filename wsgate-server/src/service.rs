//! The user-facing message handler trait.

use std::net::SocketAddr;
use wsgate_protocol::{CloseCode, Message};

/// Outbound action produced by a [`Service`].
#[derive(Debug, Clone)]
pub enum Action {
    /// Send a data message to the connection.
    Send(Message),
    /// Close the connection with the given status code.
    Close(CloseCode),
}

/// Collects the actions a handler produces while processing one message.
///
/// The owning worker encodes them after the handler returns and forwards
/// them to the writer task, so a handler never touches a stream directly.
#[derive(Debug, Default)]
pub struct Outbox {
    actions: Vec<(u64, Action)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a message for the given connection.
    pub fn send(&mut self, cid: u64, message: Message) {
        self.actions.push((cid, Action::Send(message)));
    }

    /// Queues a text message for the given connection.
    pub fn send_text(&mut self, cid: u64, text: impl Into<String>) {
        self.send(cid, Message::text(text.into().into_bytes()));
    }

    /// Queues a close for the given connection.
    pub fn close(&mut self, cid: u64, code: CloseCode) {
        self.actions.push((cid, Action::Close(code)));
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (u64, Action)> + '_ {
        self.actions.drain(..)
    }
}

/// Application handler invoked by the worker pool.
///
/// One message from one connection is processed by exactly one worker at a
/// time, and a connection's messages arrive in order. Handlers run on the
/// worker task, so they should not block.
pub trait Service: Send + Sync + 'static {
    /// Called when a connection is accepted, before any bytes are read.
    fn on_connect(&self, _cid: u64, _addr: SocketAddr) {}

    /// Called once when a connection is removed, whatever the cause.
    fn on_disconnect(&self, _cid: u64) {}

    /// Handles one complete data message.
    fn process(&self, cid: u64, message: Message, out: &mut Outbox);
}

/// A service that sends every message back to its sender. Useful for tests
/// and as a smoke-test handler.
#[derive(Debug, Default)]
pub struct EchoService;

impl Service for EchoService {
    fn process(&self, cid: u64, message: Message, out: &mut Outbox) {
        out.send(cid, message);
    }
}
