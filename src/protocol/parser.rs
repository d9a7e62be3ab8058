//! Stateful, chunk-fed frame parser.
//!
//! The parser is a pull-style routine: feed it raw socket chunks with
//! [`FrameParser::feed`] and drain typed events with
//! [`FrameParser::next_event`]. It buffers across arbitrary chunk
//! boundaries and performs all frame-level protocol validation, so the
//! connection layer only sees well-formed frames or a fatal error.

use bytes::{Buf, BytesMut};

use crate::config::Options;
use crate::connection::Role;
use crate::error::{Error, Result};
use crate::protocol::mask::apply_mask_fast;
use crate::protocol::opcode::OpCode;

use bytes::Bytes;

/// A validated frame produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A data frame (Text, Binary or Continuation).
    Data {
        /// Frame opcode; Continuation for non-initial fragments.
        opcode: OpCode,
        /// Unmasked payload.
        payload: Bytes,
        /// Whether this frame completes the message.
        fin: bool,
        /// Whether the message this frame belongs to is compressed.
        ///
        /// Latched from the first frame's RSV bits; continuation frames
        /// report the latched value.
        compressed: bool,
    },
    /// A control frame (Close, Ping or Pong).
    Control {
        /// Frame opcode.
        opcode: OpCode,
        /// Unmasked payload (at most 125 bytes).
        payload: Bytes,
    },
}

/// Resumable frame parser over a byte-chunk stream.
#[derive(Debug)]
pub struct FrameParser {
    buf: BytesMut,
    /// Whether the local endpoint masks its own payloads. The peer must do
    /// the opposite; a frame masked the same way as ours is a violation.
    local_masks: bool,
    frame_size_limit: usize,
    message_size_limit: usize,
    text_only: bool,
    /// RSV bit assigned to the negotiated compression extension, or 0.
    compression_rsv: u8,
    /// Accumulated payload bytes of the message currently in assembly.
    message_bytes: usize,
    message_compressed: bool,
}

impl FrameParser {
    /// Create a parser for one direction of a connection.
    #[must_use]
    pub fn new(role: Role, options: &Options, compression_rsv: u8) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            local_masks: role.masks_payloads(),
            frame_size_limit: options.frame_size_limit,
            message_size_limit: options.message_size_limit,
            text_only: options.text_only,
            compression_rsv: compression_rsv & 0b111,
            message_bytes: 0,
            message_compressed: false,
        }
    }

    /// Append a raw chunk read from the socket.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes currently buffered but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Parse the next frame event out of the buffered data.
    ///
    /// Returns `Ok(None)` when more input is needed. Errors are fatal for
    /// the connection; the parser must not be used afterwards.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] for reserved opcodes, RSV misuse, masking on
    ///   the wrong side, fragmented or oversized control frames, and
    ///   negative 64-bit lengths.
    /// - [`Error::FrameTooLarge`] / [`Error::MessageTooLarge`] when the
    ///   declared sizes exceed the configured limits.
    /// - [`Error::BinaryNotAccepted`] for binary opcodes on a text-only
    ///   connection.
    pub fn next_event(&mut self) -> Result<Option<FrameEvent>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let byte0 = self.buf[0];
        let byte1 = self.buf[1];

        let fin = byte0 & 0x80 != 0;
        let rsv = (byte0 >> 4) & 0b111;
        let opcode = OpCode::from_u8(byte0 & 0x0F)?;
        let masked = byte1 & 0x80 != 0;
        let length_marker = byte1 & 0x7F;

        if opcode.is_control() || opcode == OpCode::Continuation {
            if rsv != 0 {
                return Err(Error::Protocol(
                    "Reserved bits must be zero on control and continuation frames".into(),
                ));
            }
        } else if rsv & !self.compression_rsv != 0 {
            return Err(Error::Protocol("Reserved bits must be zero".into()));
        }

        let (payload_len, header_len) = match length_marker {
            0..=125 => (u64::from(length_marker), 2),
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([self.buf[2], self.buf[3]]);
                (u64::from(len), 4)
            }
            127 => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes([
                    self.buf[2],
                    self.buf[3],
                    self.buf[4],
                    self.buf[5],
                    self.buf[6],
                    self.buf[7],
                    self.buf[8],
                    self.buf[9],
                ]);
                if len & (1 << 63) != 0 {
                    return Err(Error::Protocol("Negative payload length".into()));
                }
                (len, 10)
            }
            _ => unreachable!("length marker is 7 bits"),
        };

        let payload_len = usize::try_from(payload_len).map_err(|_| Error::FrameTooLarge {
            size: usize::MAX,
            max: self.frame_size_limit,
        })?;

        if payload_len > 0 && masked == self.local_masks {
            return Err(Error::Protocol("Payload mask error".into()));
        }

        if opcode.is_control() {
            if !fin {
                return Err(Error::Protocol("Fragmented control frame".into()));
            }
            if payload_len > 125 {
                return Err(Error::Protocol(format!(
                    "Control frame payload too large: {payload_len} bytes"
                )));
            }
        }

        if payload_len > self.frame_size_limit {
            return Err(Error::FrameTooLarge {
                size: payload_len,
                max: self.frame_size_limit,
            });
        }
        if opcode.is_data() && self.message_bytes + payload_len > self.message_size_limit {
            return Err(Error::MessageTooLarge {
                size: self.message_bytes + payload_len,
                max: self.message_size_limit,
            });
        }

        if self.text_only && opcode == OpCode::Binary {
            return Err(Error::BinaryNotAccepted);
        }

        let mask_len = if masked { 4 } else { 0 };
        let total = header_len + mask_len + payload_len;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(header_len);
        let key = if masked {
            let k = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
            self.buf.advance(4);
            Some(k)
        } else {
            None
        };

        let mut payload = self.buf.split_to(payload_len);
        if let Some(key) = key {
            apply_mask_fast(&mut payload, key);
        }
        let payload = payload.freeze();

        if opcode.is_control() {
            return Ok(Some(FrameEvent::Control { opcode, payload }));
        }

        if opcode != OpCode::Continuation {
            self.message_compressed = rsv & self.compression_rsv != 0;
        }
        self.message_bytes += payload_len;
        let compressed = self.message_compressed;
        if fin {
            self.message_bytes = 0;
        }

        Ok(Some(FrameEvent::Data {
            opcode,
            payload,
            fin,
            compressed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder_parser(options: &Options) -> FrameParser {
        FrameParser::new(Role::Responder, options, 0)
    }

    fn masked(payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = payload.to_vec();
        apply_mask_fast(&mut out, key);
        out
    }

    #[test]
    fn test_parse_masked_text_frame() {
        let opts = Options::default();
        let mut parser = responder_parser(&opts);

        // FIN + Text, masked "Hello" with the RFC example key.
        parser.feed(&[
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ]);

        match parser.next_event().unwrap().unwrap() {
            FrameEvent::Data {
                opcode,
                payload,
                fin,
                compressed,
            } => {
                assert_eq!(opcode, OpCode::Text);
                assert_eq!(&payload[..], b"Hello");
                assert!(fin);
                assert!(!compressed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_parse_across_chunk_boundaries() {
        let opts = Options::default();
        let mut parser = responder_parser(&opts);

        let wire = [
            0x81u8, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        for byte in &wire[..wire.len() - 1] {
            parser.feed(std::slice::from_ref(byte));
            assert!(parser.next_event().unwrap().is_none());
        }
        parser.feed(&wire[wire.len() - 1..]);
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(FrameEvent::Data { .. })
        ));
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let opts = Options::default();
        let mut parser = FrameParser::new(Role::Initiator, &opts, 0);

        // Initiator receives unmasked frames.
        parser.feed(&[0x81, 0x02, 0x48, 0x69, 0x8a, 0x01, 0x37]);

        assert!(matches!(
            parser.next_event().unwrap(),
            Some(FrameEvent::Data { ref payload, .. }) if &payload[..] == b"Hi"
        ));
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(FrameEvent::Control { opcode: OpCode::Pong, ref payload }) if &payload[..] == b"7"
        ));
        assert!(parser.next_event().unwrap().is_none());
    }

    #[test]
    fn test_reserved_opcode_rejected() {
        let opts = Options::default();
        let mut parser = responder_parser(&opts);
        parser.feed(&[0x83, 0x80, 0, 0, 0, 0]);
        assert!(matches!(parser.next_event(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_rsv_on_continuation_rejected() {
        let opts = Options::default();
        let mut parser = FrameParser::new(Role::Responder, &opts, crate::protocol::frame::RSV1);
        // CONT with RSV1 set.
        parser.feed(&[0x40, 0x80, 0, 0, 0, 0]);
        assert!(matches!(parser.next_event(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_rsv_outside_compression_bit_rejected() {
        let opts = Options::default();
        let mut parser = FrameParser::new(Role::Responder, &opts, crate::protocol::frame::RSV1);
        // Text with RSV2 set.
        parser.feed(&[0xA1, 0x80, 0, 0, 0, 0]);
        assert!(matches!(parser.next_event(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_compression_latched_for_continuations() {
        let opts = Options::default();
        let mut parser = FrameParser::new(Role::Responder, &opts, crate::protocol::frame::RSV1);
        let key = [1, 2, 3, 4];

        // Non-final text frame with RSV1.
        let mut wire = vec![0x41, 0x81];
        wire.extend_from_slice(&key);
        wire.extend_from_slice(&masked(b"a", key));
        // Final continuation, RSV must be 0 but the message stays compressed.
        wire.extend_from_slice(&[0x80, 0x81]);
        wire.extend_from_slice(&key);
        wire.extend_from_slice(&masked(b"b", key));
        parser.feed(&wire);

        assert!(matches!(
            parser.next_event().unwrap(),
            Some(FrameEvent::Data { compressed: true, fin: false, .. })
        ));
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(FrameEvent::Data { compressed: true, fin: true, .. })
        ));
    }

    #[test]
    fn test_unmasked_frame_from_initiator_rejected() {
        let opts = Options::default();
        let mut parser = responder_parser(&opts);
        parser.feed(&[0x81, 0x02, 0x48, 0x69]);
        assert!(
            matches!(parser.next_event(), Err(Error::Protocol(msg)) if msg == "Payload mask error")
        );
    }

    #[test]
    fn test_masked_frame_from_responder_rejected() {
        let opts = Options::default();
        let mut parser = FrameParser::new(Role::Initiator, &opts, 0);
        parser.feed(&[0x81, 0x82, 0, 0, 0, 0, 0x48, 0x69]);
        assert!(matches!(parser.next_event(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_empty_frame_exempt_from_mask_check() {
        let opts = Options::default();
        let mut parser = responder_parser(&opts);
        // Unmasked empty text frame from the initiator side: tolerated.
        parser.feed(&[0x81, 0x00]);
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(FrameEvent::Data { ref payload, .. }) if payload.is_empty()
        ));
    }

    #[test]
    fn test_fragmented_control_rejected() {
        let opts = Options::default();
        let mut parser = responder_parser(&opts);
        parser.feed(&[0x09, 0x80, 0, 0, 0, 0]);
        assert!(matches!(parser.next_event(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_control_frame_length_126_rejected() {
        let opts = Options::default();
        let mut parser = responder_parser(&opts);
        let mut wire = vec![0x89, 0xFE, 0x00, 0x7E, 0, 0, 0, 0];
        wire.extend_from_slice(&vec![0u8; 126]);
        parser.feed(&wire);
        assert!(matches!(parser.next_event(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_negative_64bit_length_rejected() {
        let opts = Options::default();
        let mut parser = responder_parser(&opts);
        let mut wire = vec![0x82, 0xFF];
        wire.extend_from_slice(&u64::MAX.to_be_bytes());
        wire.extend_from_slice(&[0, 0, 0, 0]);
        parser.feed(&wire);
        assert!(matches!(parser.next_event(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_extended_lengths_parse() {
        let opts = Options::default();
        let key = [0u8; 4]; // identity mask
        for len in [125usize, 126, 65535, 65536] {
            let mut parser = responder_parser(&opts);
            let frame = crate::protocol::frame::Frame::binary(vec![0xAB; len]);
            parser.feed(&frame.encode(Some(key)));
            match parser.next_event().unwrap().unwrap() {
                FrameEvent::Data { payload, .. } => assert_eq!(payload.len(), len),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn test_frame_size_limit() {
        let opts = Options::default().with_frame_size_limit(10);
        let mut parser = responder_parser(&opts);
        let mut wire = vec![0x82, 0x8B, 0, 0, 0, 0];
        wire.extend_from_slice(&[0u8; 11]);
        parser.feed(&wire);
        assert!(matches!(
            parser.next_event(),
            Err(Error::FrameTooLarge { size: 11, max: 10 })
        ));
    }

    #[test]
    fn test_message_size_accumulates_across_fragments() {
        let opts = Options::default().with_message_size_limit(10);
        let mut parser = responder_parser(&opts);
        let key = [0u8; 4];

        // 6 bytes, non-final.
        let mut wire = vec![0x02, 0x86];
        wire.extend_from_slice(&key);
        wire.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        // 5 more bytes crosses the 10-byte budget.
        wire.extend_from_slice(&[0x80, 0x85]);
        wire.extend_from_slice(&key);
        wire.extend_from_slice(&[7, 8, 9, 10, 11]);
        parser.feed(&wire);

        assert!(parser.next_event().unwrap().is_some());
        assert!(matches!(
            parser.next_event(),
            Err(Error::MessageTooLarge { size: 11, max: 10 })
        ));
    }

    #[test]
    fn test_message_budget_resets_after_final_frame() {
        let opts = Options::default().with_message_size_limit(10);
        let mut parser = responder_parser(&opts);
        let key = [0u8; 4];

        for _ in 0..3 {
            let mut wire = vec![0x82, 0x88];
            wire.extend_from_slice(&key);
            wire.extend_from_slice(&[0u8; 8]);
            parser.feed(&wire);
            assert!(matches!(
                parser.next_event().unwrap(),
                Some(FrameEvent::Data { fin: true, .. })
            ));
        }
    }

    #[test]
    fn test_text_only_rejects_binary() {
        let opts = Options::default().with_text_only(true);
        let mut parser = responder_parser(&opts);
        parser.feed(&[0x82, 0x81, 0, 0, 0, 0, 0x01]);
        assert!(matches!(parser.next_event(), Err(Error::BinaryNotAccepted)));
    }

    #[test]
    fn test_close_frame_event() {
        let opts = Options::default();
        let mut parser = responder_parser(&opts);
        let mut wire = vec![0x88, 0x85, 0, 0, 0, 0];
        wire.extend_from_slice(&[0x03, 0xE8, b'b', b'y', b'e']);
        parser.feed(&wire);
        match parser.next_event().unwrap().unwrap() {
            FrameEvent::Control { opcode, payload } => {
                assert_eq!(opcode, OpCode::Close);
                assert_eq!(&payload[..2], &[0x03, 0xE8]);
                assert_eq!(&payload[2..], b"bye");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
