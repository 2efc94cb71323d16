//! Close discipline (§4.4): the three ways a `Connection` can end.

use tracing::warn;

use super::{ConnState, Connection};
use crate::or_link::end_reason::EndReason;

/// Why a connection is being closed, carried through to the metrics
/// label and (for an `OrLink`) the `DESTROY`/end-reason byte.
#[derive(Debug, Clone, Copy)]
pub enum CloseReason {
    Reason(EndReason),
}

impl CloseReason {
    pub fn end_reason(self) -> EndReason {
        match self {
            CloseReason::Reason(r) => r,
        }
    }
}

impl Connection {
    /// Tear down right now, discarding any unflushed `outbuf` (§4.4
    /// `close_immediate`). Used for fatal protocol violations and local
    /// resource exhaustion, where flushing further bytes risks making
    /// things worse.
    pub fn close_immediate(&mut self, reason: EndReason) {
        self.marked_for_close = Some(CloseReason::Reason(reason));
        self.hold_open_until_flushed = false;
        self.state = ConnState::Closing;
    }

    /// Request a close once `outbuf` has drained (§4.4 `mark_for_close`).
    /// If already marked with a more specific reason, the existing
    /// reason wins — the first cause recorded is the one that gets
    /// reported.
    pub fn mark_for_close(&mut self, reason: EndReason) {
        if self.marked_for_close.is_none() {
            self.marked_for_close = Some(CloseReason::Reason(reason));
        } else {
            warn!(
                existing = ?self.marked_for_close.unwrap().end_reason(),
                attempted = ?reason,
                "mark_for_close called on a connection already marked for close"
            );
        }
        self.hold_open_until_flushed = true;
        if self.state == ConnState::Connecting {
            self.state = ConnState::Closing;
        }
    }

    /// Whether the event loop should stop accepting new inbound reads —
    /// true as soon as any close has been requested, regardless of
    /// flushing discipline (§4.4 read-path step 1).
    pub fn about_to_close(&self) -> bool {
        self.marked_for_close.is_some()
    }

    /// Whether the write path should still attempt to drain `outbuf`
    /// (true for a graceful `mark_for_close`, false once
    /// `close_immediate` has fired or the buffer is already empty).
    pub fn should_keep_flushing(&self) -> bool {
        match self.marked_for_close {
            None => true,
            Some(_) => self.hold_open_until_flushed && !self.outbuf.is_empty(),
        }
    }

    /// True once no further progress is possible and the task should
    /// exit its event loop.
    pub fn is_fully_closed(&self) -> bool {
        self.marked_for_close.is_some() && !self.should_keep_flushing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn conn() -> Connection {
        Connection::new(super::super::ConnectionKind::OrLink, "127.0.0.1:1".parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn close_immediate_discards_outbuf_discipline() {
        let mut c = conn();
        c.outbuf.append(b"pending");
        c.close_immediate(EndReason::TorProtocol);
        assert!(!c.should_keep_flushing());
        assert!(c.is_fully_closed());
    }

    #[test]
    fn mark_for_close_keeps_flushing_until_outbuf_drains() {
        let mut c = conn();
        c.outbuf.append(b"pending");
        c.mark_for_close(EndReason::Done);
        assert!(c.should_keep_flushing());
        assert!(!c.is_fully_closed());
        c.outbuf.drain(c.outbuf.len());
        assert!(!c.should_keep_flushing());
        assert!(c.is_fully_closed());
    }

    #[test]
    fn first_close_reason_wins() {
        let mut c = conn();
        c.close_immediate(EndReason::TorProtocol);
        c.mark_for_close(EndReason::Done);
        assert!(matches!(
            c.marked_for_close.unwrap().end_reason(),
            EndReason::TorProtocol
        ));
    }

    #[test]
    fn redundant_mark_for_close_keeps_first_reason_without_panicking() {
        let mut c = conn();
        c.mark_for_close(EndReason::Done);
        c.mark_for_close(EndReason::TorProtocol);
        c.mark_for_close(EndReason::TimedOut);
        assert!(matches!(
            c.marked_for_close.unwrap().end_reason(),
            EndReason::Done
        ));
    }
}
