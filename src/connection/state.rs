//! Connection lifecycle states.

/// Lifecycle state of a connection.
///
/// A connection is created in `Open` (the core starts after the opening
/// handshake), moves to `Closing` when either side initiates the close
/// handshake, and ends in `Closed` once the handshake completes or the
/// stream is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Data transfer is possible in both directions.
    #[default]
    Open,
    /// A close frame has been sent or received; waiting for the handshake
    /// to complete.
    Closing,
    /// The connection is finished and the stream released.
    Closed,
}

impl ConnectionState {
    /// Whether data messages may still be sent.
    #[inline]
    #[must_use]
    pub const fn can_send(self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Whether the connection has not fully closed yet.
    #[inline]
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Open => f.write_str("Open"),
            ConnectionState::Closing => f.write_str("Closing"),
            ConnectionState::Closed => f.write_str("Closed"),
        }
    }
}
