//! Network helpers around the WebSocket engine.
//!
//! - [`address`]: which peers are this machine or on its subnets
//! - [`cert`]: per-server-name certificate selection, usable as a rustls
//!   certificate resolver
//! - [`tls`]: certified keys, resolver-backed server config, and
//!   self-signed certificate generation

pub mod address;
pub mod cert;
pub mod error;
pub mod tls;

pub use address::AddressTable;
pub use cert::{CertificateSelector, ServerNameSelector};
pub use error::{TlsError, TlsResult};
pub use tls::{certified_key, generate_self_signed, server_config};
