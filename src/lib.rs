//! tcpframe: packet framing over long-lived TCP connections
//!
//! This crate provides a small TCP/TLS server built around zero-allocation
//! packet framing: an incoming byte stream is automatically split into whole
//! application-level packets according to a pluggable framing protocol, and
//! each packet is handed to the application as a borrowed slice of the
//! connection's read buffer.
//!
//! # Architecture
//!
//! - Thread-per-connection by default, swappable through [`ForkingStrategy`]
//! - Pooled sockets and read buffers, no allocation on the hot path
//! - Separator and length-prefixed (VarInt/VarLong/fixed-width) framing
//! - Per-socket byte metering aggregated into server metrics once per tick
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tcpframe::{
//!     packet_framing_handler, start_and_block, FramingConfig, SeparatorFraming, Server,
//!     ServerConfig, Service, ThreadPerConnection,
//! };
//!
//! let server = Server::new("127.0.0.1:7000", ServerConfig::default());
//!
//! server.set_forking_strategy(ThreadPerConnection::new(packet_framing_handler(
//!     SeparatorFraming::new(b"\n"),
//!     |socket, packet| {
//!         let mut response = packet.to_vec();
//!         response.push(b'\n');
//!         let _ = socket.write_all(&response);
//!     },
//!     FramingConfig::default(),
//! )));
//!
//! start_and_block(vec![Arc::new(server) as Arc<dyn Service>]).unwrap();
//! ```

/// TCP/TLS client
pub mod client;

/// Configuration management for the server
pub mod config;

/// Error types and result aliases
pub mod error;

/// Forking strategies deciding how connections are executed
pub mod forking;

/// Framing protocols and the packet framing engine
pub mod framing;

/// Periodic housekeeping job
mod housekeeping;

/// I/O utilities: codec helpers, byte meters, object pooling
pub mod io;

/// Network layer: streams, listeners, sockets
pub mod network;

/// Aggregated server metrics
pub mod metrics;

/// Core server implementation
pub mod server;

/// Process-level service supervision
pub mod service;

pub use client::Client;
pub use config::ServerConfig;
pub use error::{is_broken_pipe, is_timeout, Error, Result};
pub use forking::{ForkingStrategy, PanicHandler, ThreadPerConnection};
pub use framing::{
    packet_framing_handler, FramingConfig, FramingProtocol, LengthPrefixedFraming, PrefixKind,
    SeparatorFraming,
};
pub use metrics::ServerMetrics;
pub use network::{CloseReason, Listener, NetListener, Socket, SocketRef, Stream, TlsStream};
pub use server::Server;
pub use service::{start_and_block, Service};
