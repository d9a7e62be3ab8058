//! Endpoint role: which side of the connection masks its payloads.

/// Connection role.
///
/// The protocol is symmetric except for masking: the side that initiated
/// the connection masks every payload it sends, the responding side sends
/// payloads verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The side that opened the connection. Masks outgoing payloads.
    Initiator,
    /// The side that accepted the connection. Sends payloads unmasked.
    Responder,
}

impl Role {
    /// Whether this role masks its outgoing payloads.
    #[inline]
    #[must_use]
    pub const fn masks_payloads(self) -> bool {
        matches!(self, Role::Initiator)
    }

    /// The opposite role.
    #[inline]
    #[must_use]
    pub const fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => f.write_str("Initiator"),
            Role::Responder => f.write_str("Responder"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_masks() {
        assert!(Role::Initiator.masks_payloads());
        assert!(!Role::Responder.masks_payloads());
    }

    #[test]
    fn test_peer() {
        assert_eq!(Role::Initiator.peer(), Role::Responder);
        assert_eq!(Role::Responder.peer(), Role::Initiator);
    }

    #[test]
    fn test_display() {
        assert_eq!(Role::Initiator.to_string(), "Initiator");
        assert_eq!(Role::Responder.to_string(), "Responder");
    }
}
