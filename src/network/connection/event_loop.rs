//! The generic read/write event loop every `Connection` runs under,
//! regardless of kind (§4.4 read-path/write-path contracts, §5
//! concurrency model).
//!
//! Read path (per iteration):
//! 1. If [`Connection::about_to_close`], stop reading.
//! 2. Compute this tick's allowance from the token buckets; if zero, set
//!    `read_blocked_on_bw` and skip the read.
//! 3. Read up to the allowance, append to `inbuf`, call `process_inbuf`.
//!
//! Write path (per iteration):
//! 1. If `outbuf` is empty, nothing to do.
//! 2. Compute this tick's write allowance; if zero, set
//!    `write_blocked_on_bw`.
//! 3. Write up to the allowance; call `flushed_some`.
//! 4. If `outbuf` is now empty, call `finished_flushing`; if also
//!    `is_fully_closed`, exit the loop.

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, instrument, warn};

use super::{Connection, ConnectionContext, ConnectionHooks, ConnectionKind};
use crate::error::OrLinkError;
use crate::network::connection::error_handling::classify_io_error;
use crate::network::ratelimit::{bypasses_scheduling, CELL_SIZE, RELAY_PAYLOAD_LEN};

const READ_CHUNK_MAX: usize = 16 * 1024;

#[instrument(skip_all, fields(kind = ?conn.kind, addr = %conn.addr))]
pub async fn run_event_loop<S, H>(
    stream: S,
    mut conn: Connection,
    mut hooks: H,
    ctx: ConnectionContext,
) -> Result<(), OrLinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: ConnectionHooks,
{
    hooks.finished_connecting(&mut conn);
    let bypass = bypasses_scheduling(conn.addr.ip());
    let mut ticker = tokio::time::interval(crate::network::ratelimit::TICK);
    let mut scratch = vec![0u8; READ_CHUNK_MAX];
    let (mut reader, mut writer): (ReadHalf<S>, WriteHalf<S>) = split(stream);

    loop {
        if conn.is_fully_closed() {
            break;
        }

        let read_allowance = if bypass {
            READ_CHUNK_MAX as i64
        } else {
            read_allowance(&conn, &ctx)
        };
        let can_read = !conn.about_to_close() && read_allowance > 0;
        conn.read_blocked_on_bw = !bypass && !conn.about_to_close() && read_allowance <= 0;

        let write_pending = !conn.outbuf.is_empty();
        let write_allowance = if bypass {
            conn.outbuf.len() as i64
        } else {
            write_allowance(&conn, &ctx)
        };
        let can_write = write_pending && write_allowance > 0;
        conn.write_blocked_on_bw = write_pending && !bypass && write_allowance <= 0;
        let write_take = (write_allowance.max(0) as usize).min(conn.outbuf.len());
        let write_bytes = if can_write { conn.outbuf.peek(write_take) } else { Vec::new() };

        tokio::select! {
            biased;

            n = reader.read(&mut scratch[..read_allowance.clamp(1, READ_CHUNK_MAX as i64) as usize]), if can_read => {
                match n {
                    Ok(0) => {
                        hooks.reached_eof(&mut conn);
                    }
                    Ok(n) => {
                        conn.touch();
                        conn.inbuf.append(&scratch[..n]);
                        if !bypass {
                            spend(&mut conn, &ctx, false, n as i64);
                        }
                        if let Err(e) = hooks.process_inbuf(&mut conn).await {
                            warn!(error = %e, "process_inbuf failed");
                            conn.close_immediate(e.end_reason());
                        }
                    }
                    Err(e) => return Err(classify_io_error(e)),
                }
            }

            result = writer.write(&write_bytes), if can_write => {
                match result {
                    Ok(n) => {
                        conn.touch();
                        conn.outbuf.drain(n);
                        if !bypass {
                            spend(&mut conn, &ctx, true, n as i64);
                        }
                        hooks.flushed_some(&mut conn);
                        if conn.outbuf.is_empty() {
                            hooks.finished_flushing(&mut conn);
                        }
                    }
                    Err(e) => return Err(classify_io_error(e)),
                }
            }

            _ = ticker.tick() => {
                ctx.buckets.lock().tick();
                if let Some(b) = conn.read_bucket.as_mut() {
                    b.refill();
                }
                if let Some(b) = conn.write_bucket.as_mut() {
                    b.refill();
                }
            }
        }
    }

    hooks.about_to_close(&mut conn);
    let _ = writer.shutdown().await;
    debug!("connection task exiting");
    Ok(())
}

/// The scheduling unit a connection is metered in (§4.3): whole cells for
/// an OR link, relay-payload-sized chunks for everything else.
fn scheduling_unit(kind: ConnectionKind) -> i64 {
    match kind {
        ConnectionKind::OrLink => CELL_SIZE,
        _ => RELAY_PAYLOAD_LEN,
    }
}

fn read_allowance(conn: &Connection, ctx: &ConnectionContext) -> i64 {
    match &conn.read_bucket {
        Some(b) => ctx
            .buckets
            .lock()
            .allowance(b, conn.traffic_class, false, scheduling_unit(conn.kind)),
        None => READ_CHUNK_MAX as i64,
    }
}

fn write_allowance(conn: &Connection, ctx: &ConnectionContext) -> i64 {
    match &conn.write_bucket {
        Some(b) => ctx
            .buckets
            .lock()
            .allowance(b, conn.traffic_class, true, scheduling_unit(conn.kind)),
        None => conn.outbuf.len() as i64,
    }
}

fn spend(conn: &mut Connection, ctx: &ConnectionContext, write: bool, n: i64) {
    let class = conn.traffic_class;
    let bucket = if write {
        conn.write_bucket.as_mut()
    } else {
        conn.read_bucket.as_mut()
    };
    if let Some(bucket) = bucket {
        ctx.buckets.lock().spend(bucket, class, write, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ratelimit::TrafficClass;
    use std::net::SocketAddr;

    #[test]
    fn fresh_connection_defaults_to_direct_traffic_class() {
        let conn = Connection::new(
            super::super::ConnectionKind::OrLink,
            "1.2.3.4:1".parse::<SocketAddr>().unwrap(),
        );
        assert_eq!(conn.traffic_class, TrafficClass::Direct);
    }
}
