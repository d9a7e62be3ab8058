//! Error types for the WebSocket endpoint core.
//!
//! Protocol-layer failures are consumed internally by initiating a close
//! handshake; user-facing operations surface them as [`Error`] values.
//! Each error kind maps to the close code that terminates the connection
//! when the error is fatal.

use thiserror::Error;

use crate::message::close_code;

/// Result type alias for endpoint operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during WebSocket endpoint operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The connection was closed. Carries the close code and reason that
    /// were (or will be) reported to the peer.
    #[error("Connection closed ({code}): {reason}")]
    Closed {
        /// Negotiated or locally chosen close code.
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },

    /// Peer violated the framing or control-frame rules.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Peer violated endpoint policy (e.g. a malformed pong payload).
    #[error("Policy violation: {0}")]
    Policy(String),

    /// Inbound data that must be UTF-8 was not.
    #[error("{0}")]
    InvalidUtf8(String),

    /// A single frame exceeded the configured frame size limit.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared frame payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A reassembled message exceeded the configured message size limit.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Accumulated message size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A binary frame arrived on a text-only connection.
    #[error("Binary frames are not accepted on this connection")]
    BinaryNotAccepted,

    /// Compression or decompression failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(String),

    /// `receive()` was called while a previous call was still pending.
    #[error("receive() is already in progress on this connection")]
    ReceiveInProgress,
}

/// Canonical reason for invalid UTF-8 in a text message body.
pub(crate) const INVALID_TEXT_REASON: &str = "Invalid TEXT data; UTF-8 required";

impl Error {
    pub(crate) fn invalid_text() -> Self {
        Error::InvalidUtf8(INVALID_TEXT_REASON.to_string())
    }

    /// Close code this error maps to when it terminates the connection.
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Closed { code, .. } => *code,
            Error::Protocol(_) | Error::Compression(_) => close_code::PROTOCOL_ERROR,
            Error::Policy(_) => close_code::POLICY_VIOLATION,
            Error::InvalidUtf8(_) => close_code::INCONSISTENT_FRAME_DATA_TYPE,
            Error::FrameTooLarge { .. } | Error::MessageTooLarge { .. } => {
                close_code::MESSAGE_TOO_LARGE
            }
            Error::BinaryNotAccepted => close_code::UNACCEPTABLE_TYPE,
            Error::Io(_) => close_code::ABNORMAL,
            Error::ReceiveInProgress => close_code::UNEXPECTED_SERVER_ERROR,
        }
    }

    /// Human-readable reason used when this error initiates a close.
    #[must_use]
    pub fn close_reason(&self) -> String {
        match self {
            Error::Closed { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::invalid_text()
    }
}
