//! Classification of transport-level failures into [`OrLinkError`] and
//! into the broken-handshake-state label used by
//! [`crate::or_link::broken_counter::ProtocolBrokenCounter`] (§4.9).

use crate::error::OrLinkError;

/// Classify a raw socket I/O error, distinguishing a clean peer-initiated
/// close from a genuine transport failure.
pub fn classify_io_error(e: std::io::Error) -> OrLinkError {
    use std::io::ErrorKind::*;
    match e.kind() {
        ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => {
            OrLinkError::PeerClose(e.to_string())
        }
        TimedOut => OrLinkError::Timeout(std::time::Duration::from_secs(0)),
        _ => OrLinkError::Io(e),
    }
}

/// Classify a `rustls`/`tokio-rustls` failure surfaced as an I/O error
/// wrapping a TLS alert, vs. a handshake that never got that far.
pub fn classify_tls_error(e: &std::io::Error) -> OrLinkError {
    OrLinkError::Tls(e.to_string())
}

/// Build the `"<conn_state> with SSL state <tls_state>"` label a
/// non-Open close is recorded under (§4.9).
pub fn broken_state_label(conn_state: &str, tls_state: &str) -> (String, String) {
    (conn_state.to_string(), tls_state.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn connection_reset_is_peer_close() {
        let e = classify_io_error(Error::new(ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(e, OrLinkError::PeerClose(_)));
    }

    #[test]
    fn generic_io_error_is_io_variant() {
        let e = classify_io_error(Error::new(ErrorKind::PermissionDenied, "denied"));
        assert!(matches!(e, OrLinkError::Io(_)));
    }
}
