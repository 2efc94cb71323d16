//! `END_OR_CONN_REASON_*` taxonomy (§6, §7): the byte recorded when an OR
//! link dies, surfaced to control-port style consumers and used to label
//! the [`crate::metrics::LINKS_CLOSED`] counter.
//!
//! Grounded on the `END_OR_CONN_REASON_*` constants and
//! `orconn_end_reason_to_control_string` dispatch in
//! `connection_or.c`.

/// Why an OR link connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
    /// Reason unknown or not otherwise classified.
    Misc,
    /// Local socket/IO error not otherwise classified (read/write failure).
    ConnectionClosed,
    /// Peer refused the TCP connection.
    TcpRefused,
    /// TLS handshake or record-layer failure.
    TlsError,
    /// Peer sent a cell or handshake message that violates the link protocol.
    TorProtocol,
    /// Peer's identity digest didn't match the one we dialed for, or
    /// collided with an already-registered better link (§4.7 identity
    /// binding/validation, §4.8 registry invariants).
    OrIdentity,
    /// Local resource exhaustion: EMFILE, allocation failure, or an
    /// empty/saturated token bucket with no way to make progress.
    ResourceLimit,
    /// No response within the configured handshake window.
    TimedOut,
    /// Peer reset the TCP connection.
    ConnReset,
    /// No route to the peer (ENETUNREACH/EHOSTUNREACH).
    NoRoute,
    /// Administrative action closed the link (config reload dropped the
    /// listener, network disabled).
    OrConnClosed,
    /// Clean shutdown: peer sent `DESTROY` on every open circuit, or we
    /// initiated one and it was acknowledged.
    Done,
}

impl EndReason {
    /// The wire byte for this reason (as carried on `DESTROY` cells and
    /// reported to control-port style consumers).
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Misc => 1,
            Self::TcpRefused => 2,
            Self::OrIdentity => 3,
            Self::ConnReset => 4,
            Self::TimedOut => 5,
            Self::NoRoute => 6,
            Self::ConnectionClosed => 7,
            Self::ResourceLimit => 8,
            Self::TlsError => 9,
            Self::OrConnClosed => 10,
            Self::TorProtocol => 11,
            Self::Done => 12,
        }
    }

    /// Short, stable label used as a metrics tag and in log lines.
    pub fn control_string(self) -> &'static str {
        match self {
            Self::Misc => "MISC",
            Self::TcpRefused => "TCP_REFUSED",
            Self::OrIdentity => "OR_IDENTITY",
            Self::ConnReset => "CONNRESET",
            Self::TimedOut => "TIMEOUT",
            Self::NoRoute => "NO_ROUTE",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::ResourceLimit => "RESOURCE_LIMIT",
            Self::TlsError => "TLS_ERROR",
            Self::OrConnClosed => "OR_CONN_CLOSED",
            Self::TorProtocol => "TOR_PROTOCOL",
            Self::Done => "DONE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_values_are_distinct() {
        let all = [
            EndReason::Misc,
            EndReason::TcpRefused,
            EndReason::OrIdentity,
            EndReason::ConnReset,
            EndReason::TimedOut,
            EndReason::NoRoute,
            EndReason::ConnectionClosed,
            EndReason::ResourceLimit,
            EndReason::TlsError,
            EndReason::OrConnClosed,
            EndReason::TorProtocol,
            EndReason::Done,
        ];
        let mut bytes: Vec<u8> = all.iter().map(|r| r.as_byte()).collect();
        bytes.sort_unstable();
        bytes.dedup();
        assert_eq!(bytes.len(), all.len());
    }

    #[test]
    fn control_string_matches_or_identity() {
        assert_eq!(EndReason::OrIdentity.control_string(), "OR_IDENTITY");
    }
}
