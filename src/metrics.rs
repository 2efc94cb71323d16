//! Prometheus metrics collection for the OR-link connection engine.
//!
//! Exposed on an HTTP endpoint (wired in `main.rs`) for Prometheus
//! scraping. Tracks link lifecycle, handshake outcomes, bandwidth-
//! scheduling pauses, and listener reconciliation.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry for all metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    // ========================================================================
    // Counters (monotonic increasing)
    // ========================================================================

    /// Total OR links that completed a handshake and reached `Open`.
    pub static ref LINKS_OPENED: IntCounter = IntCounter::new(
        "orlink_opened_total",
        "OR links that completed the handshake and reached Open"
    ).unwrap();

    /// Total OR links closed, labeled by end reason (§6/§7).
    pub static ref LINKS_CLOSED: IntCounterVec = IntCounterVec::new(
        Opts::new("orlink_closed_total", "OR links closed, by end reason"),
        &["end_reason"],
    ).unwrap();

    /// Total handshake failures, labeled by the stage they failed at.
    pub static ref HANDSHAKE_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("orlink_handshake_failures_total", "Handshake failures, by stage"),
        &["stage"],
    ).unwrap();

    /// Total read/write pauses caused by an empty token bucket (§4.3).
    pub static ref BUCKET_PAUSES: IntCounterVec = IntCounterVec::new(
        Opts::new("orlink_bucket_pauses_total", "Read/write pauses caused by empty token buckets"),
        &["direction"],
    ).unwrap();

    /// Total listener open/close actions taken during reconciliation (§4.5).
    pub static ref LISTENER_RECONCILE: IntCounterVec = IntCounterVec::new(
        Opts::new("orlink_listener_reconcile_total", "Listener open/close actions during reconciliation"),
        &["action"],
    ).unwrap();

    // ========================================================================
    // Gauges (can increase/decrease)
    // ========================================================================

    /// Currently open OR links.
    pub static ref LINKS_OPEN: IntGauge = IntGauge::new(
        "orlink_open",
        "Currently open OR links"
    ).unwrap();

    /// Currently bound listener sockets.
    pub static ref LISTENERS_BOUND: IntGauge = IntGauge::new(
        "orlink_listeners_bound",
        "Currently bound listener sockets"
    ).unwrap();

    /// Count of links that most recently died in a given non-Open state,
    /// labeled "<conn_state> with SSL state <tls_state>" (§4.9).
    pub static ref BROKEN_STATE_COUNTS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("orlink_broken_state", "Links that died in a given non-Open state, by label"),
        &["state"],
    ).unwrap();
}

/// Register all metrics with the global registry. Idempotent: call once at
/// startup; repeat registration attempts are silently ignored.
pub fn init() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(LINKS_OPENED.clone()),
        Box::new(LINKS_CLOSED.clone()),
        Box::new(HANDSHAKE_FAILURES.clone()),
        Box::new(BUCKET_PAUSES.clone()),
        Box::new(LISTENER_RECONCILE.clone()),
        Box::new(LINKS_OPEN.clone()),
        Box::new(LISTENERS_BOUND.clone()),
        Box::new(BROKEN_STATE_COUNTS.clone()),
    ];
    for c in collectors {
        let _ = REGISTRY.register(c);
    }
}

/// Gather all metrics and encode them in Prometheus text format.
///
/// Returns a string suitable for an HTTP response on the `/metrics` endpoint.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Serve `/metrics` on `port` until the process exits. A no-op (never
/// returns control to the caller in a meaningful way) if the bind fails;
/// the caller is expected to `tokio::spawn` this.
pub async fn serve(port: u16) {
    let app = axum::Router::new().route("/metrics", axum::routing::get(|| async { gather_metrics() }));
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            tracing::info!(%addr, "metrics endpoint listening");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "metrics server exited");
            }
        }
        Err(e) => tracing::error!(error = %e, %addr, "failed to bind metrics endpoint"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_metrics_includes_registered_families() {
        init();
        LINKS_OPENED.inc();
        let text = gather_metrics();
        assert!(text.contains("orlink_opened_total"));
    }
}
