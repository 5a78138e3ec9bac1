//! WebSocket frame codec (RFC 6455 Section 5.2-5.3).
//!
//! Frames are read in two steps so the engine can enforce its message size
//! limit before any payload bytes are buffered:
//!
//! - [`read_header`]: Parse the flags, opcode, length and mask key
//! - [`read_payload`]: Read exactly `payload_len` bytes and unmask them once
//! - [`write_header`] / [`write_frame`]: Emit unmasked server frames
//! - [`apply_mask`]: Symmetric XOR masking per RFC 6455 Section 5.3

use std::fmt;
use std::io::{Read, Write};

use crate::error::{WsError, WsResult};

/// Largest payload a control frame may carry (RFC 6455 Section 5.5).
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// WebSocket frame opcodes per RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parse a 4-bit opcode value.
    ///
    /// Reserved opcodes (0x3-0x7, 0xB-0xF) are a protocol error since no
    /// extension defining them is ever negotiated.
    pub fn from_u8(byte: u8) -> WsResult<Opcode> {
        match byte {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(WsError::Protocol(format!("unknown opcode: 0x{byte:X}"))),
        }
    }

    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Continuation => "continuation",
            Opcode::Text => "text",
            Opcode::Binary => "binary",
            Opcode::Close => "close",
            Opcode::Ping => "ping",
            Opcode::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// A decoded frame header. The payload is read separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// FIN bit -- `true` if this is the final fragment of a message.
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload_len: u64,
    /// Present iff `masked`.
    pub mask_key: Option<[u8; 4]>,
}

/// Apply or remove the 4-byte XOR mask on a payload.
///
/// The operation is symmetric: applying the mask twice returns the original.
pub fn apply_mask(payload: &mut [u8], mask_key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Parse one frame header from a client-to-server stream.
///
/// Handles the three payload length encodings (7-bit, 16-bit, 64-bit).
/// Client frames must be masked; an unmasked frame is a protocol error.
pub fn read_header<R: Read>(reader: &mut R) -> WsResult<FrameHeader> {
    // Byte 0: FIN(1) RSV(3) Opcode(4)
    // Byte 1: MASK(1) Payload-Length(7)
    let mut head = [0u8; 2];
    reader.read_exact(&mut head)?;

    let fin = (head[0] & 0x80) != 0;
    let opcode = Opcode::from_u8(head[0] & 0x0F)?;
    let masked = (head[1] & 0x80) != 0;
    let length_byte = head[1] & 0x7F;

    let payload_len: u64 = match length_byte {
        0..=125 => u64::from(length_byte),
        126 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;
            u64::from(u16::from_be_bytes(buf))
        }
        _ => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            let len = u64::from_be_bytes(buf);
            if len >> 63 != 0 {
                return Err(WsError::Protocol(
                    "MSB of 64-bit payload length must be 0".to_string(),
                ));
            }
            len
        }
    };

    if opcode.is_control() {
        if !fin {
            return Err(WsError::Protocol(format!("fragmented {opcode} frame")));
        }
        if payload_len > MAX_CONTROL_PAYLOAD {
            return Err(WsError::Protocol(format!(
                "{opcode} frame payload of {payload_len} bytes exceeds {MAX_CONTROL_PAYLOAD}"
            )));
        }
    }

    if !masked {
        return Err(WsError::Protocol(format!(
            "client {opcode} frame is not masked"
        )));
    }
    let mut key = [0u8; 4];
    reader.read_exact(&mut key)?;

    Ok(FrameHeader {
        fin,
        opcode,
        masked,
        payload_len,
        mask_key: Some(key),
    })
}

/// Read the payload that follows `header` and unmask it.
pub fn read_payload<R: Read>(reader: &mut R, header: &FrameHeader) -> WsResult<Vec<u8>> {
    let len = usize::try_from(header.payload_len).map_err(|_| WsError::MessageTooBig {
        size: header.payload_len,
        max: usize::MAX as u64,
    })?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload)?;
    }
    if let Some(key) = header.mask_key {
        apply_mask(&mut payload, &key);
    }
    Ok(payload)
}

/// Write an unmasked server frame header.
///
/// Server frames never set the MASK bit (RFC 6455 Section 5.1).
pub fn write_header<W: Write>(
    writer: &mut W,
    opcode: Opcode,
    fin: bool,
    payload_len: u64,
) -> WsResult<()> {
    let byte0 = if fin { 0x80 } else { 0x00 } | (opcode as u8);

    if payload_len <= 125 {
        writer.write_all(&[byte0, payload_len as u8])?;
    } else if payload_len <= u64::from(u16::MAX) {
        let mut buf = [0u8; 4];
        buf[0] = byte0;
        buf[1] = 126;
        buf[2..].copy_from_slice(&(payload_len as u16).to_be_bytes());
        writer.write_all(&buf)?;
    } else {
        let mut buf = [0u8; 10];
        buf[0] = byte0;
        buf[1] = 127;
        buf[2..].copy_from_slice(&payload_len.to_be_bytes());
        writer.write_all(&buf)?;
    }
    Ok(())
}

/// Write a complete, unfragmented server frame and flush it.
pub fn write_frame<W: Write>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> WsResult<()> {
    write_header(writer, opcode, true, payload.len() as u64)?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    writer.flush()?;
    Ok(())
}
