//! Per-connection statistics.

use std::net::SocketAddr;
use std::time::SystemTime;

/// Snapshot of a connection's statistics and identity.
///
/// Returned by value from [`Connection::info`](crate::Connection::info) so
/// callers never observe a partially updated view; the live copy is
/// mutated only by the owning connection under its state lock.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Unique connection id, allocated by the scheduler.
    pub id: u64,
    /// Local socket address, when known.
    pub local_addr: Option<SocketAddr>,
    /// Remote socket address, when known.
    pub remote_addr: Option<SocketAddr>,
    /// Negotiated TLS protocol description, when the stream is encrypted.
    pub tls_protocol: Option<String>,
    /// When the connection was established.
    pub connected_at: Option<SystemTime>,
    /// When the close handshake started, if it has.
    pub closed_at: Option<SystemTime>,
    /// Close code, once closing.
    pub close_code: Option<u16>,
    /// Close reason, once closing.
    pub close_reason: Option<String>,
    /// Whether the peer initiated the close handshake.
    pub peer_initiated_close: bool,

    /// Total bytes read from the stream.
    pub bytes_read: u64,
    /// Total bytes written to the stream.
    pub bytes_sent: u64,
    /// Frames parsed from the stream.
    pub frames_read: u64,
    /// Frames written to the stream.
    pub frames_sent: u64,
    /// Complete data messages received.
    pub messages_read: u64,
    /// Data messages sent.
    pub messages_sent: u64,
    /// Pings sent.
    pub ping_count: u64,
    /// Highest acknowledged ping. Never exceeds `ping_count`.
    pub pong_count: u64,

    /// Last time any bytes arrived.
    pub last_read_at: Option<SystemTime>,
    /// Last time a data frame arrived.
    pub last_data_read_at: Option<SystemTime>,
    /// Last time any frame was written.
    pub last_sent_at: Option<SystemTime>,
    /// Last time a data frame was written.
    pub last_data_sent_at: Option<SystemTime>,
    /// Last time a heartbeat ping was written.
    pub last_heartbeat_at: Option<SystemTime>,
}

impl ConnectionInfo {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            connected_at: Some(SystemTime::now()),
            ..Self::default()
        }
    }

    /// Pings sent that the peer has not acknowledged yet.
    #[must_use]
    pub fn unanswered_pings(&self) -> u64 {
        self.ping_count.saturating_sub(self.pong_count)
    }
}
