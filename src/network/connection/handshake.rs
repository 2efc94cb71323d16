//! Wires [`crate::or_link::handshake`] into a [`Connection`]: decides v2 vs
//! v3 from the negotiated link protocol, and on success binds the link's
//! identity into the shared [`crate::or_link::registry::OrLinkRegistry`]
//! (§4.7 accept/dial flows).
//!
//! The TLS-layer facts the handshake needs (exporter secret, peer link
//! certificate digest) are extracted by the listener before calling in
//! here, so this module — and the protocol-level code in `or_link` — stays
//! generic over any `AsyncRead + AsyncWrite` stream rather than coupling to
//! `tokio_rustls` directly.

use std::net::IpAddr;
use std::sync::Arc;

use rsa::RsaPrivateKey;
use tracing::warn;

use crate::error::OrLinkError;
use crate::network::ratelimit::Bucket;
use crate::or_link::handshake::{run_v2, run_v3_initiator, run_v3_responder, HandshakeParams};
use crate::or_link::registry::OrLinkRegistry;
use crate::or_link::{CircIdType, HandshakeState, IdentityDigest, OrLinkShared};

use super::{Connection, ConnectionContext};

/// This relay's identity material, loaded once at startup (§4.7).
pub struct LocalIdentity {
    pub identity_digest: IdentityDigest,
    pub identity_private_key: RsaPrivateKey,
    pub identity_cert_der: Vec<u8>,
    pub auth_private_key: RsaPrivateKey,
    pub auth_cert_der: Vec<u8>,
}

/// Facts about the TLS session the handshake's AUTHENTICATE binding needs,
/// extracted by the caller via `rustls`'s keying-material export and peer
/// certificate accessors.
pub struct TlsLinkInfo {
    pub exporter_secret: Vec<u8>,
    pub peer_cert_sha256: [u8; 32],
}

/// Run the OR-link handshake as the side that accepted the connection,
/// then bind the resulting identity into `registry` and `conn.or_link`.
pub async fn accept<S>(
    stream: &mut S,
    conn: &mut Connection,
    ctx: &ConnectionContext,
    local: &LocalIdentity,
    our_addrs: &[IpAddr],
) -> Result<(), OrLinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut state = HandshakeState::new(false);
    let link_proto = crate::or_link::handshake::negotiate_versions(
        stream,
        &mut conn.inbuf,
        &ctx.config.server.link_protocols,
        &mut state,
    )
    .await?;

    let params = HandshakeParams {
        local_versions: ctx.config.server.link_protocols.clone(),
        local_identity: local.identity_digest,
        identity_private_key: local.identity_private_key.clone(),
        identity_public_cert_der: local.identity_cert_der.clone(),
        auth_private_key: local.auth_private_key.clone(),
        auth_public_cert_der: local.auth_cert_der.clone(),
        our_addrs: our_addrs.to_vec(),
        peer_addr: conn.addr,
        accept_legacy_v1: ctx.config.server.accept_legacy_v1_initiators,
    };

    let outcome = if link_proto >= 3 {
        run_v3_responder(stream, &mut conn.inbuf, link_proto, &params, state).await
    } else {
        // v2 has no CERTS/AUTHENTICATE; the peer's identity would come from
        // the TLS link certificate itself. The listener is expected to
        // reject a v2 negotiation before calling in here unless
        // `accept_legacy_v1_initiators` allows it; absent that plumbing we
        // treat the TLS-reported peer identity as unknown (zeroed) rather
        // than guessing.
        run_v2(stream, &mut conn.inbuf, link_proto, [0u8; 20], &params, state).await
    };

    let outcome = outcome.inspect_err(|e| {
        let (conn_state, tls_state) = super::error_handling::broken_state_label(
            "accept",
            e.error_code(),
        );
        ctx.broken_counter.record(&conn_state, &tls_state);
    })?;

    bind_link(conn, local.identity_digest, ctx, &outcome, false);
    Ok(())
}

/// Run the OR-link handshake as the side that dialed out, then bind the
/// resulting identity (which must match `expected_identity`).
pub async fn dial<S>(
    stream: &mut S,
    conn: &mut Connection,
    ctx: &ConnectionContext,
    local: &LocalIdentity,
    expected_identity: IdentityDigest,
    tls: &TlsLinkInfo,
    our_addrs: &[IpAddr],
) -> Result<(), OrLinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    // This engine never originates below v3 (§9 Open Question).
    let dial_versions: Vec<u16> = ctx
        .config
        .server
        .link_protocols
        .iter()
        .copied()
        .filter(|v| *v >= 3)
        .collect();
    let mut state = HandshakeState::new(true);
    let link_proto = crate::or_link::handshake::negotiate_versions(
        stream,
        &mut conn.inbuf,
        &dial_versions,
        &mut state,
    )
    .await?;
    if link_proto < 3 {
        return Err(OrLinkError::Protocol(
            "peer negotiated below the minimum we originate".into(),
        ));
    }

    let params = HandshakeParams {
        local_versions: dial_versions,
        local_identity: local.identity_digest,
        identity_private_key: local.identity_private_key.clone(),
        identity_public_cert_der: local.identity_cert_der.clone(),
        auth_private_key: local.auth_private_key.clone(),
        auth_public_cert_der: local.auth_cert_der.clone(),
        our_addrs: our_addrs.to_vec(),
        peer_addr: conn.addr,
        accept_legacy_v1: false,
    };

    let outcome = run_v3_initiator(
        stream,
        &mut conn.inbuf,
        link_proto,
        expected_identity,
        &tls.exporter_secret,
        tls.peer_cert_sha256,
        &params,
        state,
    )
    .await
    .inspect_err(|e| {
        let (conn_state, tls_state) = super::error_handling::broken_state_label("dial", e.error_code());
        ctx.broken_counter.record(&conn_state, &tls_state);
    })?;

    bind_link(conn, local.identity_digest, ctx, &outcome, true);
    Ok(())
}

/// Bind the handshake's resulting identity into `registry` and
/// `conn.or_link`, and size this link's bandwidth buckets (§4.7 per-link
/// token-bucket sizing).
///
/// This engine has no consensus/descriptor cache to tell a known relay
/// apart from an arbitrary peer, so every identity-bound link is sized
/// from the same global per-node defaults (`BandwidthConfig::effective_*`)
/// rather than the full known-relay/unknown-peer split the rule describes.
fn bind_link(
    conn: &mut Connection,
    our_identity: IdentityDigest,
    ctx: &ConnectionContext,
    outcome: &crate::or_link::handshake::HandshakeOutcome,
    is_outgoing: bool,
) {
    let mut shared = OrLinkShared::new(conn.addr, is_outgoing);
    shared.link_proto = outcome.link_proto;
    shared.circ_id_type = CircIdType::from_identities(&our_identity, &outcome.peer_identity);
    shared.identity_digest = Some(outcome.peer_identity);
    shared.is_connection_with_client = outcome.peer_is_client;
    shared.is_canonical = is_outgoing;

    let (rate, burst) = ctx.config.bandwidth.effective_global();
    shared.bandwidthrate = rate;
    shared.bandwidthburst = burst;
    conn.read_bucket = Some(Bucket::new(rate, burst));
    conn.write_bucket = Some(Bucket::new(rate, burst));

    let handle = Arc::new(parking_lot::RwLock::new(shared));
    ctx.registry.set_identity(outcome.peer_identity, handle.clone());
    conn.or_link = Some(handle);
    conn.handshake_state = None;

    if outcome.peer_is_client {
        warn!(peer = %conn.addr, "link classified as connection with client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn test_ctx() -> ConnectionContext {
        let cfg: crate::config::Config = toml::from_str(
            r#"
            [server]
            nickname = "test"
            identity_key_path = "/dev/null"

            [[ports]]
            kind = "or"
            port = 9001
            "#,
        )
        .unwrap();
        ConnectionContext {
            config: Arc::new(cfg),
            registry: Arc::new(OrLinkRegistry::new()),
            buckets: Arc::new(parking_lot::Mutex::new(crate::network::ratelimit::TokenBuckets::new(
                0, 0, 0, 0,
            ))),
            broken_counter: Arc::new(crate::or_link::broken_counter::ProtocolBrokenCounter::new()),
        }
    }

    #[test]
    fn bind_link_marks_outgoing_as_canonical() {
        let ctx = test_ctx();
        let mut conn = Connection::new(
            super::super::ConnectionKind::OrLink,
            "127.0.0.1:1".parse::<SocketAddr>().unwrap(),
        );
        let outcome = crate::or_link::handshake::HandshakeOutcome {
            link_proto: 4,
            peer_identity: [9u8; 20],
            peer_is_client: false,
            state: crate::or_link::HandshakeState::new(true),
        };
        bind_link(&mut conn, [1u8; 20], &ctx, &outcome, true);
        let handle = conn.or_link.unwrap();
        assert!(handle.read().is_canonical);
        assert!(handle.read().is_outgoing);
    }

    #[test]
    fn bind_link_sizes_bandwidth_buckets_from_config_defaults() {
        let ctx = test_ctx();
        let mut conn = Connection::new(
            super::super::ConnectionKind::OrLink,
            "127.0.0.1:1".parse::<SocketAddr>().unwrap(),
        );
        let outcome = crate::or_link::handshake::HandshakeOutcome {
            link_proto: 4,
            peer_identity: [9u8; 20],
            peer_is_client: false,
            state: crate::or_link::HandshakeState::new(true),
        };
        bind_link(&mut conn, [1u8; 20], &ctx, &outcome, true);
        assert!(conn.read_bucket.is_some());
        assert!(conn.write_bucket.is_some());
        let handle = conn.or_link.unwrap();
        assert_eq!(handle.read().bandwidthrate, ctx.config.bandwidth.consensus_rate);
    }
}
