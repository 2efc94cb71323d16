//! `Connection`: the generic per-socket state machine every listener kind
//! dispatches into (§4.4).
//!
//! Each `Connection` runs in its own Tokio task. Kind-specific behavior
//! (what to do with newly-arrived bytes, what happens once the
//! handshake/proxy dial completes) is supplied through [`ConnectionHooks`]
//! rather than a virtual-dispatch trait object on `Connection` itself,
//! keeping the hot read/write loop monomorphic per kind (§9: "kind
//! dispatch -> tagged enum").

mod context;
pub mod error_handling;
mod event_loop;
pub mod handshake;
mod lifecycle;

pub use context::ConnectionContext;
pub use event_loop::run_event_loop;
pub use lifecycle::CloseReason;

use std::net::SocketAddr;
use std::time::Instant;

use or_wire::buffer::Buffer;
use or_wire::socks::ProxyState;

use crate::or_link::end_reason::EndReason;
use crate::or_link::registry::OrLinkHandle;
use crate::or_link::HandshakeState;

/// What a `Connection` is for — drives which sub-state-machine its
/// `ConnectionHooks` implementation runs (§3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Bound OR-port socket; never itself enters the read/write loop —
    /// `Listener` spawns a fresh `OrLink` connection per accept.
    OrListener,
    /// An OR-link: handshake, then cell multiplexing.
    OrLink,
    /// Bound SOCKS (AP) port listener.
    ApListener,
    /// A client's SOCKS application-proxy stream.
    ApStream,
    /// Bound directory-port listener (dispatch only; protocol out of scope).
    DirListener,
    DirStream,
    ControlListener,
    ControlStream,
}

/// Generic lifecycle state every connection kind shares (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket connect()/accept() completed but kind-specific setup (TLS,
    /// handshake, proxy dial) hasn't finished.
    Connecting,
    /// Fully set up; `process_inbuf` may be called as data arrives.
    Open,
    /// `mark_for_close` was called; still flushing `outbuf` before the
    /// socket is torn down.
    Closing,
    /// Torn down; the task is about to exit.
    Closed,
}

/// The generic connection state every `ConnectionKind` extends (§3).
pub struct Connection {
    pub kind: ConnectionKind,
    pub state: ConnState,
    pub addr: SocketAddr,
    pub inbuf: Buffer,
    pub outbuf: Buffer,
    /// Bytes of `outbuf` that existed at the start of the current flush
    /// attempt — `finished_flushing` fires when `outbuf` drops below this
    /// rather than merely "some bytes got written" (§4.4 write-path).
    pub outbuf_flushlen: usize,
    pub marked_for_close: Option<CloseReason>,
    /// Keep flushing `outbuf` even after `marked_for_close`, instead of
    /// discarding it immediately (graceful vs. immediate close, §4.4).
    pub hold_open_until_flushed: bool,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub read_blocked_on_bw: bool,
    pub write_blocked_on_bw: bool,
    /// This connection's own token buckets. `None` for connections that
    /// bypass scheduling entirely (§4.3 bypass rules: private addresses,
    /// linked in-process pairs).
    pub read_bucket: Option<crate::network::ratelimit::Bucket>,
    pub write_bucket: Option<crate::network::ratelimit::Bucket>,
    pub traffic_class: crate::network::ratelimit::TrafficClass,
    /// The other half of an in-process linked pair (e.g. a future
    /// rendezvous splice), realized as an mpsc channel rather than the
    /// original's raw pointer pair (§9: "linked in-process pairs -> Pipe
    /// resource").
    pub linked_conn: Option<tokio::sync::mpsc::Sender<Vec<u8>>>,
    pub proxy_state: ProxyState,

    /// Present only while `kind == OrLink` and only during the handshake;
    /// dropped once the link reaches `Open` (§3 `HandshakeState`).
    pub handshake_state: Option<Box<HandshakeState>>,
    /// Present only while `kind == OrLink`: the shared, registry-visible
    /// link state (§3 `OrLink` fields).
    pub or_link: Option<OrLinkHandle>,
}

impl Connection {
    pub fn new(kind: ConnectionKind, addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            kind,
            state: ConnState::Connecting,
            addr,
            inbuf: Buffer::new(),
            outbuf: Buffer::new(),
            outbuf_flushlen: 0,
            marked_for_close: None,
            hold_open_until_flushed: false,
            created_at: now,
            last_activity: now,
            read_blocked_on_bw: false,
            write_blocked_on_bw: false,
            read_bucket: None,
            write_bucket: None,
            traffic_class: crate::network::ratelimit::TrafficClass::Direct,
            linked_conn: None,
            proxy_state: ProxyState::None,
            handshake_state: None,
            or_link: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Hooks a kind-specific implementation supplies to the generic event
/// loop (§6 External Interfaces: connection-scheduler hooks).
#[async_trait::async_trait]
pub trait ConnectionHooks: Send {
    /// Called whenever bytes were appended to `inbuf`. Implementations
    /// drain whatever complete messages they can and enqueue replies
    /// onto `outbuf`.
    async fn process_inbuf(&mut self, conn: &mut Connection) -> Result<(), crate::error::OrLinkError>;

    /// Called after a write made forward progress on `outbuf`, even if
    /// it didn't finish draining it. TLS record buffering means partial
    /// writes should still be offered a chance to pack another record
    /// (§4.7 flushed-some hook / 15872-byte TLS record alignment).
    fn flushed_some(&mut self, _conn: &mut Connection) {}

    /// Called once `outbuf` has fully drained.
    fn finished_flushing(&mut self, _conn: &mut Connection) {}

    /// Called once kind-specific setup (TLS handshake, OR handshake,
    /// proxy dial) has completed and the connection has moved to `Open`.
    fn finished_connecting(&mut self, _conn: &mut Connection) {}

    /// Called when the peer closed its write half (read returned EOF).
    fn reached_eof(&mut self, conn: &mut Connection) {
        conn.marked_for_close.get_or_insert(CloseReason::Reason(EndReason::Done));
    }

    /// Called once, right before the socket is actually torn down.
    fn about_to_close(&mut self, _conn: &mut Connection) {}
}
