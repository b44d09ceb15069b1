//! # wsgate-client
//!
//! WebSocket client for wsgate.
//!
//! This crate provides:
//! - Async WebSocket client with the full upgrade handshake
//! - Automatic Ping/Pong and Close handling during receive
//! - RPC invocation with tag correlation, reconnect and retry
//! - Optional TLS support

pub mod connection;
pub mod error;
pub mod rpc;
pub mod stream;
pub mod tls;

pub use connection::{ConnState, WsClient, WsConfig};
pub use error::ClientError;
pub use rpc::{gen_tag, RetryPolicy, RpcClient};
