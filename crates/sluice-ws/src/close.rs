//! Close codes and close frame payloads (RFC 6455 Section 5.5.1, 7.4).
//!
//! - [`CloseCode`]: wire codes plus the local-only sentinels
//! - [`CloseFrame`]: code + optional reason, decoded from or encoded to a payload

use std::fmt;

/// Longest reason that still fits a 125-byte control payload after the code.
pub const MAX_REASON_BYTES: usize = 123;

/// Close status codes.
///
/// `ConnectionLost`, `TlsHandshakeFailed` and `None` only describe why a
/// connection ended locally; they are never written to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    UnsupportedData,
    /// 1005, reported when the peer's close frame carried no code.
    NoStatus,
    /// 1006, the transport died before a close code was exchanged.
    ConnectionLost,
    /// 1007
    InvalidPayload,
    /// 1008
    PolicyViolation,
    /// 1009
    MessageTooBig,
    /// 1011
    InternalError,
    /// 1015, failure before any WebSocket semantics applied.
    TlsHandshakeFailed,
    /// No close frame should be sent.
    None,
    /// Any other code received from the peer.
    Other(u16),
}

impl CloseCode {
    /// Wire value, or `None` for [`CloseCode::None`].
    pub fn as_u16(self) -> Option<u16> {
        let code = match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::ConnectionLost => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::InternalError => 1011,
            CloseCode::TlsHandshakeFailed => 1015,
            CloseCode::None => return None,
            CloseCode::Other(code) => code,
        };
        Some(code)
    }

    /// False for the local sentinels and the other codes RFC 6455 reserves
    /// for reporting only.
    pub fn is_sendable(self) -> bool {
        !matches!(
            self,
            CloseCode::None
                | CloseCode::ConnectionLost
                | CloseCode::TlsHandshakeFailed
                | CloseCode::NoStatus
        )
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        match value {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::ConnectionLost,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1011 => CloseCode::InternalError,
            1015 => CloseCode::TlsHandshakeFailed,
            code => CloseCode::Other(code),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u16() {
            Some(code) => write!(f, "{code} ({self:?})"),
            None => f.write_str("none"),
        }
    }
}

/// A close code plus an optional human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub message: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode) -> Self {
        Self {
            code,
            message: String::new(),
        }
    }

    pub fn with_message(code: CloseCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Decode a peer's close payload.
    ///
    /// An empty payload yields [`CloseCode::NoStatus`]. A lone trailing byte
    /// cannot hold a code and is treated the same way. The reason is decoded
    /// lossily.
    pub fn parse(payload: &[u8]) -> Self {
        if payload.len() >= 2 {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            Self {
                code: CloseCode::from(code),
                message: String::from_utf8_lossy(&payload[2..]).into_owned(),
            }
        } else {
            Self::new(CloseCode::NoStatus)
        }
    }

    /// Encode as a close payload, or `None` when the code has no wire value.
    ///
    /// The reason is cut at a character boundary so the payload stays within
    /// the 125-byte control frame limit.
    pub fn encode(&self) -> Option<Vec<u8>> {
        let code = self.code.as_u16()?;
        let reason = truncate_reason(&self.message);

        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Some(payload)
    }
}

fn truncate_reason(message: &str) -> &str {
    if message.len() <= MAX_REASON_BYTES {
        return message;
    }
    let mut end = MAX_REASON_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}
