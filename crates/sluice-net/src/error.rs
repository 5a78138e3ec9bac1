//! TLS helper error types.

use thiserror::Error;

/// Errors from building certificates and TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The private key could not be turned into a signing key.
    #[error("invalid private key: {message}")]
    InvalidKey {
        /// Error message.
        message: String,
    },

    /// Key generation or certificate signing failed.
    #[error("certificate generation failed: {message}")]
    Generation {
        /// Error message.
        message: String,
    },

    /// rustls rejected the configuration.
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// Result type for TLS helpers.
pub type TlsResult<T> = Result<T, TlsError>;
