//! WebSocket error types.

use std::io;

use thiserror::Error;

use crate::close::CloseCode;

/// Result type for frame and connection operations.
pub type WsResult<T> = Result<T, WsError>;

/// Errors raised while reading or writing frames on an open connection.
///
/// Every variant maps to the close code the read loop reports at teardown
/// (see [`WsError::close_code`]).
#[derive(Debug, Error)]
pub enum WsError {
    /// Malformed or out-of-sequence frames.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Accumulated fragment payload exceeded the configured maximum.
    #[error("message too big: {size} bytes (max {max})")]
    MessageTooBig {
        /// Total bytes the message would have reached.
        size: u64,
        /// Configured limit.
        max: u64,
    },

    /// A reassembled text message was not valid UTF-8.
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected local fault while processing a frame.
    #[error("internal error: {0}")]
    Internal(String),

    /// A data frame was attempted after the close frame went out.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame was attempted before the upgrade handshake completed.
    #[error("the WebSocket handshake has not completed")]
    NotUpgraded,
}

impl WsError {
    /// True for transport errors that just mean the peer went away.
    pub fn is_ordinary_disconnect(&self) -> bool {
        match self {
            WsError::Io(e) => is_ordinary_disconnect(e),
            WsError::ConnectionClosed => true,
            _ => false,
        }
    }

    /// The close code that describes this error at teardown.
    pub fn close_code(&self) -> CloseCode {
        match self {
            WsError::Protocol(_) => CloseCode::ProtocolError,
            WsError::MessageTooBig { .. } => CloseCode::MessageTooBig,
            WsError::InvalidUtf8 => CloseCode::InvalidPayload,
            e if e.is_ordinary_disconnect() => CloseCode::ConnectionLost,
            WsError::Io(_)
            | WsError::Internal(_)
            | WsError::ConnectionClosed
            | WsError::NotUpgraded => CloseCode::InternalError,
        }
    }
}

/// Error kinds produced when the remote end hangs up or resets.
pub fn is_ordinary_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Errors from either handshake entry point.
///
/// Returned synchronously to the caller; no read loop exists yet to own them.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("WebSocket handshake requires GET, got \"{0}\"")]
    WrongMethod(String),

    #[error("requested path \"{requested}\" did not match the expected path \"{expected}\"")]
    PathMismatch { requested: String, expected: String },

    #[error("missing required header {0}")]
    MissingHeader(&'static str),

    #[error("header {name} has unexpected value \"{value}\"")]
    InvalidHeader { name: &'static str, value: String },

    #[error("unsupported WebSocket version requested (\"{0}\")")]
    UnsupportedVersion(String),

    #[error("malformed HTTP request: {0}")]
    MalformedRequest(String),

    #[error("the WebSocket handshake has already been performed")]
    AlreadyPerformed,

    #[error("I/O error during handshake: {0}")]
    Io(#[from] io::Error),
}

/// Errors from lifecycle transitions (`start_reading`).
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("the WebSocket read loop is already active")]
    AlreadyStarted,

    #[error("the WebSocket has already started closing")]
    Closing,

    #[error("the WebSocket handshake has not been performed yet")]
    HandshakeNotPerformed,

    #[error("failed to start the read loop: {0}")]
    Io(#[from] io::Error),
}
