//! WebSocket frame representation and serialization (RFC 6455).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode |M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)   |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                         Masking key (if present)              |
//! +---------------------------------------------------------------+
//! |                     Payload data                              |
//! +---------------------------------------------------------------+
//! ```

use bytes::Bytes;

use crate::message::close_code;
use crate::protocol::mask::apply_mask_fast;
use crate::protocol::opcode::OpCode;

/// RSV1 in the 3-bit reserved field (bit 6 of byte 0, i.e. `rsv & 0b100`).
pub const RSV1: u8 = 0b100;

/// Maximum payload size of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// A single WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// The three reserved bits packed as `0b_rsv1_rsv2_rsv3`.
    pub rsv: u8,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Payload data, already unmasked.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with explicit flags.
    #[must_use]
    pub fn new(fin: bool, rsv: u8, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            rsv: rsv & 0b111,
            opcode,
            payload: payload.into(),
        }
    }

    /// Create a final text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, 0, OpCode::Text, payload)
    }

    /// Create a final binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, 0, OpCode::Binary, payload)
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, 0, OpCode::Ping, payload)
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, 0, OpCode::Pong, payload)
    }

    /// Create a close frame from a status code and reason.
    ///
    /// Status-only codes ([`close_code::NONE`], [`close_code::ABNORMAL`] and
    /// anything else outside the wire-valid ranges) produce an empty payload.
    /// The reason is truncated so the total payload stays within the control
    /// frame limit.
    #[must_use]
    pub fn close(code: u16, reason: &str) -> Self {
        Self::new(true, 0, OpCode::Close, encode_close_payload(code, reason))
    }

    /// Number of bytes `encode` will produce.
    #[must_use]
    pub fn wire_size(&self, masked: bool) -> usize {
        let len = self.payload.len();
        let extended = if len <= 125 {
            0
        } else if len <= u16::MAX as usize {
            2
        } else {
            8
        };
        2 + extended + if masked { 4 } else { 0 } + len
    }

    /// Serialize the frame, masking the payload when a key is given.
    #[must_use]
    pub fn encode(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_size(mask.is_some()));
        self.encode_into(&mut out, mask);
        out
    }

    /// Serialize the frame into `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>, mask: Option<[u8; 4]>) {
        let len = self.payload.len();

        let mut byte0 = (self.rsv << 4) | (self.opcode.as_u8() & 0x0F);
        if self.fin {
            byte0 |= 0x80;
        }
        out.push(byte0);

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        if len <= 125 {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask_fast(&mut out[start..], key);
            }
            None => out.extend_from_slice(&self.payload),
        }
    }
}

/// Build a close frame payload: 2-byte big-endian code plus UTF-8 reason,
/// or empty when the code is status-only.
#[must_use]
pub fn encode_close_payload(code: u16, reason: &str) -> Vec<u8> {
    if !close_code::is_sendable(code) {
        return Vec::new();
    }
    let mut reason = reason.as_bytes();
    if reason.len() > MAX_CONTROL_PAYLOAD - 2 {
        // Truncate on a char boundary.
        let mut cut = MAX_CONTROL_PAYLOAD - 2;
        while cut > 0 && reason[cut] & 0xC0 == 0x80 {
            cut -= 1;
        }
        reason = &reason[..cut];
    }
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason);
    payload
}
