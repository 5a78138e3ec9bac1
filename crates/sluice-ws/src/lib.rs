//! Server-side WebSocket engine (RFC 6455) over blocking streams.
//!
//! ## Modules
//!
//! - [`frame`]: frame header codec, masking, and frame writing
//! - [`close`]: close codes and close frame payloads
//! - [`handshake`]: HTTP upgrade validation and `101` response
//! - [`connection`]: [`WebSocket`] lifecycle, read loop, and send path
//! - [`message`]: reassembled Text/Binary messages
//! - [`socket`]: the [`Socket`] transport trait
//! - [`config`]: per-connection settings
//! - [`error`]: error types
//!
//! A connection reads on a background thread and hands each complete
//! message to a callback; any thread may send through a shared handle.

pub mod close;
pub mod config;
pub mod connection;
pub mod error;
mod fragment;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod socket;

pub use close::{CloseCode, CloseFrame};
pub use config::WsConfig;
pub use connection::{ConnectionState, WebSocket};
pub use error::{HandshakeError, LifecycleError, WsError, WsResult};
pub use frame::Opcode;
pub use handshake::{Headers, UpgradeRequest};
pub use message::Message;
pub use socket::Socket;
