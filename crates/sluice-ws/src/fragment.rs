//! Fragment reassembly state (RFC 6455 Section 5.4).
//!
//! A fragmented message is a Text or Binary frame with FIN=0, zero or more
//! Continuation frames with FIN=0, and a final Continuation with FIN=1.
//! Control frames may be interleaved and never touch this state.

use crate::error::{WsError, WsResult};
use crate::frame::{FrameHeader, Opcode};
use crate::message::Message;

/// Tracks the message currently being assembled.
#[derive(Debug)]
pub(crate) struct Reassembler {
    /// Opcode of the opening frame. `None` = no sequence open.
    opening: Option<Opcode>,
    /// Payloads in arrival order.
    fragments: Vec<Vec<u8>>,
    /// Sum of the payload lengths announced so far.
    total_len: u64,
    max_message_size: u64,
}

impl Reassembler {
    pub(crate) fn new(max_message_size: u64) -> Self {
        Self {
            opening: None,
            fragments: Vec::new(),
            total_len: 0,
            max_message_size,
        }
    }

    pub(crate) fn is_fragmenting(&self) -> bool {
        self.opening.is_some()
    }

    /// Account for a data frame before its payload is read.
    ///
    /// Enforces the size limit on the running total, so many small fragments
    /// cannot add up past it, and checks the frame fits the open sequence.
    pub(crate) fn begin_frame(&mut self, header: &FrameHeader) -> WsResult<()> {
        let total = self.total_len.saturating_add(header.payload_len);
        if total > self.max_message_size {
            return Err(WsError::MessageTooBig {
                size: total,
                max: self.max_message_size,
            });
        }

        match (header.opcode, self.opening) {
            (Opcode::Continuation, None) => {
                return Err(WsError::Protocol(
                    "continuation frame did not follow a text or binary frame".to_string(),
                ));
            }
            (Opcode::Text | Opcode::Binary, Some(open)) => {
                return Err(WsError::Protocol(format!(
                    "{} frame started while a fragmented {open} message was open",
                    header.opcode
                )));
            }
            (Opcode::Text | Opcode::Binary, None) => self.opening = Some(header.opcode),
            (Opcode::Continuation, Some(_)) => {}
            (control, _) => {
                return Err(WsError::Internal(format!(
                    "{control} frame routed to reassembly"
                )));
            }
        }

        self.total_len = total;
        Ok(())
    }

    /// Buffer one payload; on the final fragment, return the whole message.
    ///
    /// State is reset before the message is returned.
    pub(crate) fn push(&mut self, payload: Vec<u8>, fin: bool) -> WsResult<Option<Message>> {
        self.fragments.push(payload);
        if !fin {
            return Ok(None);
        }

        let opcode = self
            .opening
            .take()
            .ok_or_else(|| WsError::Internal("final fragment without an opening frame".into()))?;

        let payload = if self.fragments.len() == 1 {
            self.fragments.pop().unwrap_or_default()
        } else {
            let mut buf = Vec::with_capacity(self.total_len as usize);
            for part in self.fragments.drain(..) {
                buf.extend_from_slice(&part);
            }
            buf
        };
        self.fragments.clear();
        self.total_len = 0;

        Message::from_parts(opcode, payload).map(Some)
    }
}
