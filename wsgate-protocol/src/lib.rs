//! # wsgate-protocol
//!
//! Wire protocol implementation for wsgate.
//!
//! This crate provides:
//! - RFC 6455 frame encoding/decoding with client-side masking
//! - The HTTP/1.1 upgrade handshake (request, response, accept key)
//! - Message reassembly from fragmented data frames
//! - The structured-message envelope (MessagePack/JSON polymorphic)

pub mod close;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;

pub use close::CloseCode;
pub use envelope::{Envelope, Fields, WireFormat};
pub use error::ProtocolError;
pub use frame::{Frame, OpCode};
pub use handshake::{accept_key, generate_key, HttpParser};
pub use message::{Message, Reassembler};

/// GUID appended to the client key when computing `Sec-WebSocket-Accept`
/// (RFC 6455 section 4.2.2).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket protocol version carried in `Sec-WebSocket-Version`.
pub const WS_VERSION: u8 = 13;

/// Maximum accepted frame payload size (64 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Maximum payload carried by a control frame (RFC 6455 section 5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Default cap above which outbound messages are fragmented (1 MiB).
pub const DEFAULT_FRAGMENT_SIZE: usize = 1024 * 1024;
