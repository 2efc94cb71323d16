//! The OR-link connection: identity-bound, TLS-protected, multiplexes
//! circuits between two relays (or a relay and a client) over framed
//! cells (§4.7).

pub mod auth;
pub mod broken_counter;
pub mod end_reason;
pub mod handshake;
pub mod hooks;
pub mod registry;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use or_wire::digest::TranscriptDigest;

/// SHA-1 digest of a relay's RSA identity key, used to key the link
/// registry and bind the AUTHENTICATE exchange (§3, §4.7).
pub type IdentityDigest = [u8; 20];

/// Which half of a circ-id space this link originates circuits from,
/// decided once by lexicographically comparing identity digests so two
/// relays never collide when both sides try to allocate the same id
/// (§4.7 circ_id allocation split).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircIdType {
    /// Our identity sorts lower: we allocate from the low half.
    Lower,
    /// Our identity sorts higher: we allocate from the high half.
    Higher,
    /// Identity not yet known (pre-handshake) or this is a non-relay peer
    /// (e.g. a client): allocate from the full space.
    Neither,
}

impl CircIdType {
    /// Decide allocation side by comparing our identity to the peer's
    /// (§4.7: "Lower/Higher/Neither by lexicographic identity compare").
    pub fn from_identities(ours: &IdentityDigest, theirs: &IdentityDigest) -> Self {
        match ours.cmp(theirs) {
            std::cmp::Ordering::Less => CircIdType::Lower,
            std::cmp::Ordering::Greater => CircIdType::Higher,
            std::cmp::Ordering::Equal => CircIdType::Neither,
        }
    }
}

/// Handshake-in-progress state, torn down once the link reaches `Open`.
#[derive(Debug, Default)]
pub struct HandshakeState {
    /// True if we dialed out; false if we accepted the TCP connection.
    pub started_here: bool,
    /// Transcript digests absorbing every handshake cell sent/received,
    /// bound into the AUTHENTICATE body (§4.7).
    pub transcript: TranscriptDigest,
    /// SHA-256 digest we computed over our own CERTS cell, once sent.
    pub digest_sent: Option<[u8; 32]>,
    /// SHA-256 digest computed over the peer's CERTS cell, once received.
    pub digest_received: Option<[u8; 32]>,
    /// Once true, `digest_sent` is frozen and no further absorption
    /// affects it (gates re-use of the certs digest across retries).
    pub digest_sent_data: bool,
    pub digest_received_data: bool,
    /// When our VERSIONS cell went out, for handshake-timeout accounting.
    pub sent_versions_at: Option<Instant>,
    /// Peer's ID certificate (DER), once CERTS has been processed.
    pub id_cert: Option<Vec<u8>>,
    /// Peer's auth certificate (DER), v3 only.
    pub auth_cert: Option<Vec<u8>>,
    /// Negotiated link protocol version, set once VERSIONS exchange
    /// completes (0 until then).
    pub negotiated_link_proto: u16,
}

impl HandshakeState {
    pub fn new(started_here: bool) -> Self {
        Self {
            started_here,
            transcript: TranscriptDigest::new(),
            ..Default::default()
        }
    }
}

/// Mutable OR-link state shared between the connection task and whatever
/// holds a handle into the registry (§4.7 fields extending `Connection`).
#[derive(Debug)]
pub struct OrLinkShared {
    pub identity_digest: Option<IdentityDigest>,
    pub real_addr: SocketAddr,
    pub link_proto: u16,
    pub next_circ_id: u32,
    pub circ_id_type: CircIdType,
    /// This link was the one we'd prefer to reuse for new circuits to
    /// this identity (§4.7 canonical-link rules): it was either the
    /// side that originated the TCP connection with a matching address,
    /// or was explicitly marked so during `get_for_extend`.
    pub is_canonical: bool,
    pub is_outgoing: bool,
    /// Set once `set_bad_connections` decides a newer, better link to
    /// the same identity exists, or the link's handshake proved
    /// untrustworthy in some non-fatal way (§4.7 badness-marking).
    pub is_bad_for_new_circs: bool,
    /// True once NETINFO or AUTHENTICATE tells us the peer is a client
    /// (not another relay) — such links never get new circuits extended
    /// through them by other relays.
    pub is_connection_with_client: bool,
    pub bandwidthrate: i64,
    pub bandwidthburst: i64,
    pub n_circuits: AtomicU32,
    pub tls_error: Option<String>,
    /// When this link reached `Open`, used by `get_for_extend`'s grace
    /// window and `set_bad_connections`'s age pass (§4.7).
    pub timestamp_created: Instant,
}

impl OrLinkShared {
    pub fn new(real_addr: SocketAddr, is_outgoing: bool) -> Self {
        Self {
            identity_digest: None,
            real_addr,
            link_proto: 0,
            next_circ_id: 0,
            circ_id_type: CircIdType::Neither,
            is_canonical: false,
            is_outgoing,
            is_bad_for_new_circs: false,
            is_connection_with_client: false,
            bandwidthrate: 0,
            bandwidthburst: 0,
            n_circuits: AtomicU32::new(0),
            tls_error: None,
            timestamp_created: Instant::now(),
        }
    }

    pub fn bind_identity(&mut self, ours: &IdentityDigest, theirs: IdentityDigest) {
        self.circ_id_type = CircIdType::from_identities(ours, &theirs);
        self.identity_digest = Some(theirs);
    }

    /// Allocate the next circ-id on our side of the split space (§4.7):
    /// the high bit clear for `Lower`, set for `Higher`. A `Neither` link
    /// has no identity to compare and cannot originate circuits at all.
    pub fn alloc_circ_id(&mut self) -> Option<u32> {
        if self.circ_id_type == CircIdType::Neither {
            return None;
        }
        // Circ-ids are framed in 2 bytes below link-protocol 4, 4 bytes
        // from it on (VERSIONS aside, which never carries a circ-id here).
        let high_bit: u32 = if self.link_proto >= 4 { 0x8000_0000 } else { 0x8000 };
        loop {
            let candidate = self.next_circ_id;
            self.next_circ_id = self.next_circ_id.wrapping_add(1);
            let id = match self.circ_id_type {
                CircIdType::Lower => candidate & !high_bit,
                CircIdType::Higher => candidate | high_bit,
                CircIdType::Neither => unreachable!("checked above"),
            };
            if id != 0 {
                return Some(id);
            }
        }
    }

    pub fn is_usable_for_extend(&self) -> bool {
        !self.is_bad_for_new_circs && self.identity_digest.is_some()
    }
}
