//! A Tokio-native WebSocket protocol engine: RFC 6455 framing plus RFC 7692
//! `permessage-deflate`, on top of a plain `TcpStream` or a `rustls`-wrapped
//! one.
//!
//! [`server::start_server`]/[`server::start_server_with_config`] spin up a
//! listener and hand back an [`event::EventStream`] of connection lifecycle
//! and message events. [`handshake::client::connect`] dials a `ws://`/`wss://`
//! URL. Both hand off to [`connection::WsReader`]/[`connection::WsWriter`],
//! the split read/write halves of a negotiated connection.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod message;
mod request;
pub mod server;
pub mod stream;
mod utils;
