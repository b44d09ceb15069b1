//! # wsgate-server
//!
//! WebSocket server for wsgate.
//!
//! This crate provides:
//! - TCP connection handling with async I/O and a fixed worker pool
//! - HTTP upgrade handling and WebSocket frame dispatch
//! - The `Service` trait for user message handlers
//! - Server-side RPC dispatch (modules and methods)
//! - Optional TLS support

pub mod config;
pub mod error;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod service;
pub mod stream;
pub mod tls;
pub mod worker;

pub use config::{Config, ConfigError, NetworkConfig, TlsConfig};
pub use error::ServerError;
pub use rpc::{Module, System, RC_ERROR, RC_OK};
pub use server::{ServerConfig, ServerHandle, ServerState, WsServer};
pub use service::{Action, EchoService, Outbox, Service};
