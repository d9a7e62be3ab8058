//! Configuration for WebSocket connections.

use std::time::Duration;

/// Immutable per-connection configuration.
///
/// Constructed once and shared by the connection, parser, and scheduler.
/// The limits bound memory usage; the rate fields bound inbound throughput
/// per one-second window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Maximum payload size of a single inbound frame.
    ///
    /// Default: 16 MB.
    pub frame_size_limit: usize,

    /// Maximum size of a reassembled inbound message.
    ///
    /// Applies to the running total across fragments, and to the
    /// decompressed size of compressed messages.
    ///
    /// Default: 64 MB.
    pub message_size_limit: usize,

    /// Outbound payloads larger than this are fragmented.
    ///
    /// Default: 16 KB.
    pub frame_split_threshold: usize,

    /// Bytes buffered before a partial chunk is emitted to a message body.
    ///
    /// Also used by [`Connection::stream`](crate::Connection::stream) as the
    /// outbound flush threshold.
    ///
    /// Default: 8 KB.
    pub stream_threshold: usize,

    /// Whether idle connections are pinged by the scheduler.
    ///
    /// Default: true.
    pub heartbeat_enabled: bool,

    /// Idle period after which a heartbeat ping is sent.
    ///
    /// Default: 30 seconds.
    pub heartbeat_period: Duration,

    /// Unanswered pings above this count force a policy-violation close.
    ///
    /// Default: 4.
    pub queued_ping_limit: u64,

    /// How long to wait for the peer's close frame after sending ours.
    ///
    /// Default: 5 seconds.
    pub close_period: Duration,

    /// Inbound frames accepted per one-second window. 0 disables the check.
    ///
    /// Default: 0 (unlimited).
    pub frames_per_second_limit: u64,

    /// Inbound bytes accepted per one-second window. 0 disables the check.
    ///
    /// Default: 0 (unlimited).
    pub bytes_per_second_limit: u64,

    /// Enforce UTF-8 on text messages and close reasons.
    ///
    /// Default: true.
    pub validate_utf8: bool,

    /// Reject binary data frames.
    ///
    /// Default: false.
    pub text_only: bool,

    /// Minimum payload size before outbound compression is attempted.
    ///
    /// Only consulted when a compression context is installed.
    ///
    /// Default: 64 bytes.
    pub compression_threshold: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            frame_size_limit: 16 * 1024 * 1024,
            message_size_limit: 64 * 1024 * 1024,
            frame_split_threshold: 16 * 1024,
            stream_threshold: 8 * 1024,
            heartbeat_enabled: true,
            heartbeat_period: Duration::from_secs(30),
            queued_ping_limit: 4,
            close_period: Duration::from_secs(5),
            frames_per_second_limit: 0,
            bytes_per_second_limit: 0,
            validate_utf8: true,
            text_only: false,
            compression_threshold: 64,
        }
    }
}

impl Options {
    /// Create options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum inbound frame payload size.
    #[must_use]
    pub const fn with_frame_size_limit(mut self, limit: usize) -> Self {
        self.frame_size_limit = limit;
        self
    }

    /// Set the maximum reassembled message size.
    #[must_use]
    pub const fn with_message_size_limit(mut self, limit: usize) -> Self {
        self.message_size_limit = limit;
        self
    }

    /// Set the outbound fragmentation threshold.
    #[must_use]
    pub const fn with_frame_split_threshold(mut self, threshold: usize) -> Self {
        self.frame_split_threshold = threshold;
        self
    }

    /// Set the body-chunk flush threshold.
    #[must_use]
    pub const fn with_stream_threshold(mut self, threshold: usize) -> Self {
        self.stream_threshold = threshold;
        self
    }

    /// Enable or disable the heartbeat schedule.
    #[must_use]
    pub const fn with_heartbeat(mut self, enabled: bool, period: Duration) -> Self {
        self.heartbeat_enabled = enabled;
        self.heartbeat_period = period;
        self
    }

    /// Set the unanswered-ping limit.
    #[must_use]
    pub const fn with_queued_ping_limit(mut self, limit: u64) -> Self {
        self.queued_ping_limit = limit;
        self
    }

    /// Set the close-handshake wait period.
    #[must_use]
    pub const fn with_close_period(mut self, period: Duration) -> Self {
        self.close_period = period;
        self
    }

    /// Set the per-second inbound rate limits (0 disables a check).
    #[must_use]
    pub const fn with_rate_limits(mut self, frames_per_second: u64, bytes_per_second: u64) -> Self {
        self.frames_per_second_limit = frames_per_second;
        self.bytes_per_second_limit = bytes_per_second;
        self
    }

    /// Enable or disable inbound UTF-8 validation.
    #[must_use]
    pub const fn with_validate_utf8(mut self, validate: bool) -> Self {
        self.validate_utf8 = validate;
        self
    }

    /// Accept only text data frames.
    #[must_use]
    pub const fn with_text_only(mut self, text_only: bool) -> Self {
        self.text_only = text_only;
        self
    }

    /// Set the minimum payload size for outbound compression.
    #[must_use]
    pub const fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let opts = Options::default();
        assert_eq!(opts.frame_size_limit, 16 * 1024 * 1024);
        assert_eq!(opts.message_size_limit, 64 * 1024 * 1024);
        assert_eq!(opts.frame_split_threshold, 16 * 1024);
        assert!(opts.heartbeat_enabled);
        assert_eq!(opts.heartbeat_period, Duration::from_secs(30));
        assert_eq!(opts.frames_per_second_limit, 0);
        assert!(opts.validate_utf8);
        assert!(!opts.text_only);
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::new()
            .with_frame_size_limit(1024)
            .with_message_size_limit(4096)
            .with_frame_split_threshold(3)
            .with_heartbeat(true, Duration::from_secs(1))
            .with_queued_ping_limit(2)
            .with_rate_limits(10, 1000)
            .with_text_only(true);

        assert_eq!(opts.frame_size_limit, 1024);
        assert_eq!(opts.message_size_limit, 4096);
        assert_eq!(opts.frame_split_threshold, 3);
        assert_eq!(opts.heartbeat_period, Duration::from_secs(1));
        assert_eq!(opts.queued_ping_limit, 2);
        assert_eq!(opts.frames_per_second_limit, 10);
        assert_eq!(opts.bytes_per_second_limit, 1000);
        assert!(opts.text_only);
    }

    #[test]
    fn test_options_close_period() {
        let opts = Options::new().with_close_period(Duration::from_millis(250));
        assert_eq!(opts.close_period, Duration::from_millis(250));
    }
}
