//! Running SHA-256 transcript digests over the v3 handshake.
//!
//! Every cell sent and received from the first `VERSIONS` cell onward is
//! fed into the corresponding hash until the gating flag for that direction
//! is cleared (at the point `AUTHENTICATE` is sent/received). The digests
//! bind the `AUTHENTICATE` signature to the exact handshake transcript both
//! sides observed.

use sha2::{Digest as _, Sha256};

/// Direction a cell travelled, relative to the side doing the absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// The two running hashes plus their gating flags.
#[derive(Debug, Clone, Default)]
pub struct TranscriptDigest {
    sent: Sha256,
    received: Sha256,
    gate_sent: bool,
    gate_received: bool,
    any_sent: bool,
    any_received: bool,
}

impl TranscriptDigest {
    /// A fresh digest with both gates open (the state at handshake start).
    pub fn new() -> Self {
        Self {
            sent: Sha256::new(),
            received: Sha256::new(),
            gate_sent: true,
            gate_received: true,
            any_sent: false,
            any_received: false,
        }
    }

    /// Feed the on-wire bytes of one cell into the digest for `dir`, if that
    /// direction's gate is still open. A no-op once the gate has been
    /// stopped (i.e. after our own `AUTHENTICATE` cell in that direction).
    pub fn absorb(&mut self, dir: Direction, wire_bytes: &[u8]) {
        match dir {
            Direction::Sent => {
                if self.gate_sent {
                    self.sent.update(wire_bytes);
                    self.any_sent = true;
                }
            }
            Direction::Received => {
                if self.gate_received {
                    self.received.update(wire_bytes);
                    self.any_received = true;
                }
            }
        }
    }

    /// Stop accumulating further cells for `dir`. Idempotent.
    pub fn stop_gating(&mut self, dir: Direction) {
        match dir {
            Direction::Sent => self.gate_sent = false,
            Direction::Received => self.gate_received = false,
        }
    }

    pub fn gate_open(&self, dir: Direction) -> bool {
        match dir {
            Direction::Sent => self.gate_sent,
            Direction::Received => self.gate_received,
        }
    }

    /// Whether any cell has been absorbed in `dir` yet.
    pub fn has_any(&self, dir: Direction) -> bool {
        match dir {
            Direction::Sent => self.any_sent,
            Direction::Received => self.any_received,
        }
    }

    /// Snapshot the current digest value for `dir` without consuming the
    /// running hash (further cells may still be absorbed afterwards, though
    /// in practice callers snapshot only once the gate has been stopped).
    pub fn finalize(&self, dir: Direction) -> [u8; 32] {
        let cloned = match dir {
            Direction::Sent => self.sent.clone(),
            Direction::Received => self.received.clone(),
        };
        cloned.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_digest_has_both_gates_open() {
        let d = TranscriptDigest::new();
        assert!(d.gate_open(Direction::Sent));
        assert!(d.gate_open(Direction::Received));
        assert!(!d.has_any(Direction::Sent));
    }

    #[test]
    fn absorbing_marks_data_present() {
        let mut d = TranscriptDigest::new();
        d.absorb(Direction::Sent, b"hello");
        assert!(d.has_any(Direction::Sent));
        assert!(!d.has_any(Direction::Received));
    }

    #[test]
    fn stopped_gate_ignores_further_cells() {
        let mut d = TranscriptDigest::new();
        d.absorb(Direction::Sent, b"one");
        let snapshot = d.finalize(Direction::Sent);
        d.stop_gating(Direction::Sent);
        d.absorb(Direction::Sent, b"two");
        assert_eq!(d.finalize(Direction::Sent), snapshot);
    }

    #[test]
    fn sender_and_receiver_digests_match_for_same_bytes() {
        let mut sender = TranscriptDigest::new();
        let mut receiver = TranscriptDigest::new();
        for chunk in [b"VERSIONS".as_slice(), b"CERTS", b"AUTH_CHALLENGE"] {
            sender.absorb(Direction::Sent, chunk);
            receiver.absorb(Direction::Received, chunk);
        }
        assert_eq!(
            sender.finalize(Direction::Sent),
            receiver.finalize(Direction::Received)
        );
    }
}
