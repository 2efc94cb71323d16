//! Unified error taxonomy for the OR-link connection engine (spec §7).
//!
//! Every variant maps to an externally-exposed "end reason" byte (used on
//! `DESTROY` cells and bootstrap-status events) via [`OrLinkError::end_reason`],
//! and to a `&'static str` error code for metrics labeling via
//! [`OrLinkError::error_code`], following the shape of a handler-error enum
//! (one enum, an `error_code()`, conversions via `#[from]`).

use thiserror::Error;

use crate::or_link::end_reason::EndReason;

/// Errors surfaced by the connection engine (§7).
#[derive(Debug, Error)]
pub enum OrLinkError {
    /// OS read/write error on a non-TLS socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS library signaled a non-recoverable failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Peer sent something that violates the OR protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Peer's identity didn't match expectation.
    #[error("identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// EMFILE/ENOMEM/bucket-empty.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No progress on handshake in the configured window.
    #[error("handshake timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Operator reconfiguration removed the listener or disabled the network.
    #[error("administrative close: {0}")]
    AdministrativeClose(String),

    /// Peer sent EOF or `DESTROY` on all circuits.
    #[error("peer closed: {0}")]
    PeerClose(String),
}

impl OrLinkError {
    /// Static error code for metrics labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Tls(_) => "tls_error",
            Self::Protocol(_) => "protocol",
            Self::IdentityMismatch { .. } => "identity_mismatch",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Timeout(_) => "timeout",
            Self::AdministrativeClose(_) => "administrative_close",
            Self::PeerClose(_) => "peer_close",
        }
    }

    /// The externally-exposed end-reason byte for this failure (§7, §6).
    pub fn end_reason(&self) -> EndReason {
        match self {
            Self::Io(_) => EndReason::ConnectionClosed,
            Self::Tls(_) => EndReason::TlsError,
            Self::Protocol(_) => EndReason::TorProtocol,
            Self::IdentityMismatch { .. } => EndReason::OrIdentity,
            Self::ResourceExhausted(_) => EndReason::ResourceLimit,
            Self::Timeout(_) => EndReason::TimedOut,
            Self::AdministrativeClose(_) => EndReason::OrConnClosed,
            Self::PeerClose(_) => EndReason::Done,
        }
    }

    /// Whether this failure should close the connection immediately
    /// (discarding unflushed `outbuf`) rather than attempting a final
    /// flush (§4.4 close discipline).
    pub fn is_immediate_close(&self) -> bool {
        !matches!(self, Self::PeerClose(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mismatch_maps_to_or_identity_reason() {
        let e = OrLinkError::IdentityMismatch {
            expected: "AAAA".into(),
            actual: "BBBB".into(),
        };
        assert_eq!(e.end_reason(), EndReason::OrIdentity);
        assert_eq!(e.error_code(), "identity_mismatch");
    }

    #[test]
    fn peer_close_is_not_immediate() {
        let e = OrLinkError::PeerClose("EOF".into());
        assert!(!e.is_immediate_close());
    }

    #[test]
    fn protocol_error_is_immediate() {
        let e = OrLinkError::Protocol("bad cell".into());
        assert!(e.is_immediate_close());
    }
}
