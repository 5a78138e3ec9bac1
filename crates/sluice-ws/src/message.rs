//! Reassembled application messages.

use crate::error::{WsError, WsResult};
use crate::frame::Opcode;

/// A complete Text or Binary message, tagged by its first fragment's opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    /// Build a message from a reassembled payload.
    ///
    /// Text payloads are validated as UTF-8 here, on the whole message,
    /// since a code point may straddle fragments.
    pub(crate) fn from_parts(opcode: Opcode, payload: Vec<u8>) -> WsResult<Message> {
        match opcode {
            Opcode::Text => String::from_utf8(payload)
                .map(Message::Text)
                .map_err(|_| WsError::InvalidUtf8),
            Opcode::Binary => Ok(Message::Binary(payload)),
            other => Err(WsError::Internal(format!(
                "{other} frame cannot open a message"
            ))),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Text(_) => Opcode::Text,
            Message::Binary(_) => Opcode::Binary,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
