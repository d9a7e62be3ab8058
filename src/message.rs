//! Inbound message handles and close status codes.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Well-known close status codes (RFC 6455 Section 7.4).
pub mod close_code {
    /// No status code was present in the close frame (never sent on wire).
    pub const NONE: u16 = 1005;
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Protocol violation.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Received a data type the endpoint cannot accept.
    pub const UNACCEPTABLE_TYPE: u16 = 1003;
    /// Connection dropped without a close handshake (never sent on wire).
    pub const ABNORMAL: u16 = 1006;
    /// Frame data inconsistent with the message type (e.g. bad UTF-8).
    pub const INCONSISTENT_FRAME_DATA_TYPE: u16 = 1007;
    /// Message violated endpoint policy.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too large to process.
    pub const MESSAGE_TOO_LARGE: u16 = 1009;
    /// Unexpected condition on the sending endpoint.
    pub const UNEXPECTED_SERVER_ERROR: u16 = 1011;

    /// Whether a code may legitimately appear in a close frame on the wire.
    ///
    /// Accepts 1000-1003, 1007-1013 and the library/application bands
    /// 3000-4999. 1004-1006 and 1014-1015 are reserved and must be rejected
    /// when received.
    #[must_use]
    pub const fn is_valid_wire_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1013 | 3000..=4999)
    }

    /// Whether a locally chosen code can be serialized into a close frame.
    ///
    /// [`NONE`] and [`ABNORMAL`] are status-only: a close initiated with
    /// them sends an empty close payload.
    #[must_use]
    pub const fn is_sendable(code: u16) -> bool {
        is_valid_wire_code(code)
    }
}

/// Body chunk channel capacity.
///
/// One in-flight chunk: the reader task suspends on `send` until the
/// consumer accepts the previous chunk, which is the inbound backpressure
/// mechanism.
const BODY_CHANNEL_CAPACITY: usize = 1;

pub(crate) type BodySender = mpsc::Sender<Result<Bytes>>;

/// An inbound WebSocket message with a lazily streamed body.
///
/// A `Message` is handed out by [`Connection::receive`](crate::Connection::receive)
/// as soon as the first frame of a message has been parsed; its body chunks
/// arrive as the remaining fragments are read from the socket. The chunk
/// sequence is finite and cannot be restarted. Drain the body (or drop the
/// handle) before expecting further inbound progress: the reader applies
/// backpressure while a chunk is waiting to be accepted.
#[derive(Debug)]
pub struct Message {
    binary: bool,
    body: mpsc::Receiver<Result<Bytes>>,
}

impl Message {
    /// Create a message handle plus the sender its body is fed through.
    pub(crate) fn channel(binary: bool) -> (BodySender, Message) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (tx, Message { binary, body: rx })
    }

    /// Whether this message carries binary data.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.binary
    }

    /// Whether this message carries UTF-8 text.
    #[must_use]
    pub const fn is_text(&self) -> bool {
        !self.binary
    }

    /// Receive the next body chunk.
    ///
    /// Returns `None` once the body is complete. A chunk of
    /// `Err(Error::Closed { .. })` means the connection closed while the
    /// message was still being assembled.
    pub async fn recv_chunk(&mut self) -> Option<Result<Bytes>> {
        self.body.recv().await
    }

    /// Drain the remaining body into a single buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the connection closed mid-message.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.body.recv().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Drain the body and interpret it as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUtf8`] for non-UTF-8 content and
    /// [`Error::Closed`] if the connection closed mid-message.
    pub async fn text(&mut self) -> Result<String> {
        let raw = self.read_to_end().await?;
        String::from_utf8(raw).map_err(|_| Error::invalid_text())
    }
}
