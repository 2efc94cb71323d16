//! [`ConnectionHooks`] for an `Open` OR-link: pulls complete cells out of
//! `inbuf` and dispatches the ones this engine itself understands
//! (`DESTROY`, keepalive `PADDING`); everything circuit-shaped is handed
//! to the external circuit layer via `cell_sink`, which this crate never
//! populates itself (§1 external-collaborator boundary, §6).

use tokio::sync::mpsc;
use tracing::{debug, trace};

use or_wire::cell::{self, Cell, VarCell};
use or_wire::error::FetchError;

use crate::error::OrLinkError;
use crate::network::connection::{Connection, ConnectionHooks};
use crate::or_link::end_reason::EndReason;

/// A decoded cell handed off the hot path to whatever owns circuit state.
#[derive(Debug, Clone)]
pub enum OrCell {
    Fixed(Cell),
    Variable(VarCell),
}

pub struct OrLinkHooks {
    /// Where parsed, non-DESTROY cells are forwarded. `None` drops them
    /// (e.g. in tests exercising only the framing/lifecycle behavior).
    pub cell_sink: Option<mpsc::Sender<OrCell>>,
}

impl OrLinkHooks {
    pub fn new(cell_sink: Option<mpsc::Sender<OrCell>>) -> Self {
        Self { cell_sink }
    }

    fn link_proto(&self, conn: &Connection) -> u16 {
        conn.or_link
            .as_ref()
            .map(|h| h.read().link_proto)
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ConnectionHooks for OrLinkHooks {
    async fn process_inbuf(&mut self, conn: &mut Connection) -> Result<(), OrLinkError> {
        let link_proto = self.link_proto(conn);
        if link_proto == 0 {
            // Handshake still owns `inbuf` directly; nothing to dispatch yet.
            return Ok(());
        }

        loop {
            let id_len = cell::circ_id_len(link_proto, cell::CMD_PADDING);
            let header_len = id_len + 1;
            if conn.inbuf.len() < header_len {
                return Ok(());
            }
            let header = conn.inbuf.peek(header_len);
            let command = header[id_len];

            if cell::is_variable_length(command) {
                match conn.inbuf.fetch_var_cell(link_proto) {
                    Ok(cell) => self.dispatch_variable(conn, cell).await?,
                    Err(FetchError::Incomplete) => return Ok(()),
                    Err(e) => return Err(OrLinkError::Protocol(e.to_string())),
                }
            } else {
                match conn.inbuf.fetch_fixed_cell(link_proto) {
                    Ok(cell) => self.dispatch_fixed(conn, cell).await?,
                    Err(FetchError::Incomplete) => return Ok(()),
                    Err(e) => return Err(OrLinkError::Protocol(e.to_string())),
                }
            }
        }
    }

    fn finished_connecting(&mut self, conn: &mut Connection) {
        conn.traffic_class = crate::network::ratelimit::TrafficClass::Direct;
    }
}

impl OrLinkHooks {
    async fn dispatch_fixed(&self, conn: &mut Connection, cell: Cell) -> Result<(), OrLinkError> {
        match cell.command {
            cell::CMD_PADDING => trace!("received PADDING keepalive"),
            cell::CMD_DESTROY => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                debug!(circ_id = cell.circ_id, reason, "DESTROY received");
                conn.mark_for_close(EndReason::Done);
            }
            cell::CMD_NETINFO => trace!("stray NETINFO after handshake, ignoring"),
            _ => self.forward(OrCell::Fixed(cell)).await,
        }
        Ok(())
    }

    async fn dispatch_variable(&self, _conn: &mut Connection, cell: VarCell) -> Result<(), OrLinkError> {
        self.forward(OrCell::Variable(cell)).await;
        Ok(())
    }

    async fn forward(&self, cell: OrCell) {
        if let Some(sink) = &self.cell_sink {
            let _ = sink.send(cell).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn open_conn() -> Connection {
        let mut conn = Connection::new(
            crate::network::connection::ConnectionKind::OrLink,
            "127.0.0.1:1".parse::<SocketAddr>().unwrap(),
        );
        let mut shared = crate::or_link::OrLinkShared::new(conn.addr, true);
        shared.link_proto = 4;
        conn.or_link = Some(Arc::new(parking_lot::RwLock::new(shared)));
        conn
    }

    #[tokio::test]
    async fn destroy_cell_marks_connection_for_close() {
        let mut conn = open_conn();
        let cell = Cell::new(1, cell::CMD_DESTROY, vec![6]);
        conn.inbuf.append(&cell.pack(4));
        let mut hooks = OrLinkHooks::new(None);
        hooks.process_inbuf(&mut conn).await.unwrap();
        assert!(conn.about_to_close());
    }

    #[tokio::test]
    async fn unknown_fixed_cell_is_forwarded_to_sink() {
        let mut conn = open_conn();
        let cell = Cell::new(2, 3, vec![1, 2, 3]);
        conn.inbuf.append(&cell.pack(4));
        let (tx, mut rx) = mpsc::channel(1);
        let mut hooks = OrLinkHooks::new(Some(tx));
        hooks.process_inbuf(&mut conn).await.unwrap();
        assert!(matches!(rx.recv().await, Some(OrCell::Fixed(_))));
    }

    #[tokio::test]
    async fn partial_cell_leaves_buffer_untouched() {
        let mut conn = open_conn();
        let cell = Cell::new(1, cell::CMD_DESTROY, vec![6]);
        let packed = cell.pack(4);
        conn.inbuf.append(&packed[..packed.len() - 1]);
        let mut hooks = OrLinkHooks::new(None);
        hooks.process_inbuf(&mut conn).await.unwrap();
        assert_eq!(conn.inbuf.len(), packed.len() - 1);
    }
}
