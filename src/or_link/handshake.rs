//! OR-link handshake orchestration: VERSIONS negotiation, then the v2
//! (NETINFO-only) or v3 (CERTS/AUTH_CHALLENGE/AUTHENTICATE/NETINFO) flow
//! (§4.7).

use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use or_wire::buffer::Buffer;
use or_wire::cell::{self, VarCell};
use or_wire::handshake_cells::{
    cert_type, AddrEnc, AuthChallengeCell, AuthenticateCell, CertEntry, CertsCell, NetinfoCell,
    VersionsCell, AUTHTYPE_RSA_SHA256_TLSSECRET,
};
use rand::RngCore;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

use super::auth::{self, AuthBodyFields};
use super::{HandshakeState, IdentityDigest};
use crate::error::OrLinkError;
use or_wire::digest::Direction;

/// Minimum link protocol version this engine will ever negotiate down to.
/// Below this, only the `VERSIONS` cell itself uses a 2-byte circ-id; at
/// and above it nothing changes until v4 widens the circ-id.
pub const MIN_LINK_PROTO: u16 = 2;

pub struct HandshakeParams {
    pub local_versions: Vec<u16>,
    pub local_identity: IdentityDigest,
    pub identity_private_key: RsaPrivateKey,
    pub identity_public_cert_der: Vec<u8>,
    pub auth_private_key: RsaPrivateKey,
    pub auth_public_cert_der: Vec<u8>,
    pub our_addrs: Vec<IpAddr>,
    pub peer_addr: SocketAddr,
    pub accept_legacy_v1: bool,
}

pub struct HandshakeOutcome {
    pub link_proto: u16,
    pub peer_identity: IdentityDigest,
    pub peer_is_client: bool,
    pub state: HandshakeState,
}

async fn fill_until<S, T>(
    stream: &mut S,
    buf: &mut Buffer,
    mut try_fetch: impl FnMut(&mut Buffer) -> Result<T, or_wire::error::FetchError>,
) -> Result<T, OrLinkError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    loop {
        match try_fetch(buf) {
            Ok(v) => return Ok(v),
            Err(or_wire::error::FetchError::Incomplete) => {
                let mut chunk = [0u8; 4096];
                let n = stream
                    .read(&mut chunk)
                    .await
                    .map_err(OrLinkError::Io)?;
                if n == 0 {
                    return Err(OrLinkError::PeerClose("EOF during handshake".into()));
                }
                buf.append(&chunk[..n]);
            }
            Err(e) => return Err(OrLinkError::Protocol(e.to_string())),
        }
    }
}

async fn read_var_cell<S>(stream: &mut S, buf: &mut Buffer, link_proto: u16) -> Result<VarCell, OrLinkError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    fill_until(stream, buf, |b| b.fetch_var_cell(link_proto)).await
}

/// Read a `VarCell` and absorb its exact on-wire bytes into the
/// handshake transcript as `Received`, provided the gate is still open
/// (§4.2 `transcript_absorb_var_cell`). Re-packs the decoded cell rather
/// than threading the raw bytes out of `fill_until`; `VarCell` encode and
/// decode round-trip exactly, so this reproduces what was actually read.
async fn read_var_cell_absorbed<S>(
    stream: &mut S,
    buf: &mut Buffer,
    link_proto: u16,
    state: &mut HandshakeState,
) -> Result<VarCell, OrLinkError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let cell = read_var_cell(stream, buf, link_proto).await?;
    let bytes = cell
        .pack(link_proto)
        .map_err(|e| OrLinkError::Protocol(e.to_string()))?;
    state.transcript.absorb(Direction::Received, &bytes);
    Ok(cell)
}

async fn write_var_cell<S>(stream: &mut S, cell: &VarCell, link_proto: u16) -> Result<(), OrLinkError>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let bytes = cell
        .pack(link_proto)
        .map_err(|e| OrLinkError::Protocol(e.to_string()))?;
    stream.write_all(&bytes).await.map_err(OrLinkError::Io)
}

/// Write a `VarCell` and absorb its on-wire bytes into the transcript as
/// `Sent`.
async fn write_var_cell_absorbed<S>(
    stream: &mut S,
    cell: &VarCell,
    link_proto: u16,
    state: &mut HandshakeState,
) -> Result<(), OrLinkError>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let bytes = cell
        .pack(link_proto)
        .map_err(|e| OrLinkError::Protocol(e.to_string()))?;
    state.transcript.absorb(Direction::Sent, &bytes);
    stream.write_all(&bytes).await.map_err(OrLinkError::Io)
}

/// Negotiate the shared link protocol version via the `VERSIONS`
/// exchange, which always frames with a 2-byte circ-id regardless of the
/// eventual negotiated width (§4.2/§6). The VERSIONS cell is the first
/// thing absorbed into the handshake transcript, in both directions.
#[instrument(skip_all)]
pub async fn negotiate_versions<S>(
    stream: &mut S,
    buf: &mut Buffer,
    local_versions: &[u16],
    state: &mut HandshakeState,
) -> Result<u16, OrLinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let ours = VersionsCell {
        versions: local_versions.to_vec(),
    };
    let cell = VarCell::new(0, cell::CMD_VERSIONS, ours.encode());
    write_var_cell_absorbed(stream, &cell, 0, state).await?;

    let received = read_var_cell_absorbed(stream, buf, 0, state).await?;
    if received.command != cell::CMD_VERSIONS {
        return Err(OrLinkError::Protocol(format!(
            "expected VERSIONS, got command {}",
            received.command
        )));
    }
    let theirs = VersionsCell::decode(&received.payload)
        .map_err(|e| OrLinkError::Protocol(e.to_string()))?;
    ours.best_shared(&theirs)
        .ok_or_else(|| OrLinkError::Protocol("no shared link protocol version".into()))
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn identity_digest_of(der: &[u8]) -> IdentityDigest {
    use sha1::Sha1;
    let digest = Sha1::digest(der);
    digest.into()
}

/// SHA-256 of a DER-encoded identity certificate, used for the
/// `client_id`/`server_id` fields of the AUTHENTICATE body (§4.7) —
/// distinct from the SHA-1 `IdentityDigest` used to key the registry.
fn sha256_cert_digest(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

/// Run the v3 handshake as the side that accepted the TCP connection
/// (responder): send CERTS + AUTH_CHALLENGE, wait for the initiator's
/// CERTS + AUTHENTICATE, then exchange NETINFO (§4.7 v3 handshake).
#[instrument(skip_all)]
pub async fn run_v3_responder<S>(
    stream: &mut S,
    buf: &mut Buffer,
    link_proto: u16,
    params: &HandshakeParams,
    mut state: HandshakeState,
) -> Result<HandshakeOutcome, OrLinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let our_certs = CertsCell {
        certs: vec![
            CertEntry {
                cert_type: cert_type::ID_1024,
                der: params.identity_public_cert_der.clone(),
            },
            CertEntry {
                cert_type: cert_type::AUTH_1024,
                der: params.auth_public_cert_der.clone(),
            },
        ],
    };
    let certs_cell = VarCell::new(0, cell::CMD_CERTS, our_certs.encode());
    write_var_cell_absorbed(stream, &certs_cell, link_proto, &mut state).await?;

    let mut challenge = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut challenge);
    let challenge_cell = AuthChallengeCell {
        challenge,
        methods: vec![AUTHTYPE_RSA_SHA256_TLSSECRET],
    };
    let challenge_var = VarCell::new(0, cell::CMD_AUTH_CHALLENGE, challenge_cell.encode());
    write_var_cell_absorbed(stream, &challenge_var, link_proto, &mut state).await?;

    let peer_certs_var = read_var_cell_absorbed(stream, buf, link_proto, &mut state).await?;
    if peer_certs_var.command != cell::CMD_CERTS {
        return Err(OrLinkError::Protocol("expected CERTS from initiator".into()));
    }
    let peer_certs = CertsCell::decode(&peer_certs_var.payload)
        .map_err(|e| OrLinkError::Protocol(e.to_string()))?;
    let peer_id_cert = peer_certs
        .find(cert_type::ID_1024)
        .ok_or_else(|| OrLinkError::Protocol("peer CERTS missing ID cert".into()))?;
    let peer_identity = identity_digest_of(&peer_id_cert.der);

    // The transcript is fed every handshake cell on the wire from VERSIONS
    // up to (but not including) AUTHENTICATE; freeze it here, before
    // reading AUTHENTICATE, so later cells can never perturb it.
    let expected_server_transcript = state.transcript.finalize(Direction::Sent);
    let expected_client_transcript = state.transcript.finalize(Direction::Received);

    let peer_auth_var = read_var_cell(stream, buf, link_proto).await?;
    if peer_auth_var.command != cell::CMD_AUTHENTICATE {
        return Err(OrLinkError::Protocol("expected AUTHENTICATE from initiator".into()));
    }
    let auth_cell = AuthenticateCell::decode(&peer_auth_var.payload)
        .map_err(|e| OrLinkError::Protocol(e.to_string()))?;
    if auth_cell.authtype != AUTHTYPE_RSA_SHA256_TLSSECRET {
        return Err(OrLinkError::Protocol("unsupported AUTHENTICATE authtype".into()));
    }

    let sig_len = auth_cell.body.len().saturating_sub(256);
    let (fixed_body, signature) = auth_cell.body.split_at(sig_len);
    let fields = AuthBodyFields::decode(fixed_body)?;

    let expected_client_id = sha256_cert_digest(&peer_id_cert.der);
    let expected_server_id = sha256_cert_digest(&params.identity_public_cert_der);
    if fields.client_id != expected_client_id {
        return Err(OrLinkError::IdentityMismatch {
            expected: hex_digest(&expected_client_id),
            actual: hex_digest(&fields.client_id),
        });
    }
    if fields.server_id != expected_server_id {
        return Err(OrLinkError::IdentityMismatch {
            expected: hex_digest(&expected_server_id),
            actual: hex_digest(&fields.server_id),
        });
    }
    if fields.server_transcript != expected_server_transcript {
        return Err(OrLinkError::Protocol("AUTHENTICATE server_transcript mismatch".into()));
    }
    if fields.client_transcript != expected_client_transcript {
        return Err(OrLinkError::Protocol("AUTHENTICATE client_transcript mismatch".into()));
    }

    let peer_auth_cert = peer_certs
        .find(cert_type::AUTH_1024)
        .ok_or_else(|| OrLinkError::Protocol("peer CERTS missing auth cert".into()))?;
    let peer_auth_key = rsa_public_key_from_der(&peer_auth_cert.der)?;
    auth::verify(peer_auth_key, fixed_body.to_vec(), signature.to_vec()).await?;

    state.id_cert = Some(peer_id_cert.der.clone());
    state.auth_cert = Some(peer_auth_cert.der.clone());
    state.transcript.stop_gating(Direction::Sent);
    state.transcript.stop_gating(Direction::Received);

    let netinfo = exchange_netinfo(stream, buf, link_proto, params, &mut state).await?;

    Ok(HandshakeOutcome {
        link_proto,
        peer_identity,
        peer_is_client: netinfo.our_addrs.is_empty(),
        state,
    })
}

/// Run the v3 handshake as the side that dialed out (initiator): receive
/// CERTS + AUTH_CHALLENGE, reply with our CERTS + AUTHENTICATE, then
/// exchange NETINFO.
#[instrument(skip_all)]
pub async fn run_v3_initiator<S>(
    stream: &mut S,
    buf: &mut Buffer,
    link_proto: u16,
    expected_identity: IdentityDigest,
    tls_exporter_secret: &[u8],
    tls_link_cert_sha256: [u8; 32],
    params: &HandshakeParams,
    mut state: HandshakeState,
) -> Result<HandshakeOutcome, OrLinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let peer_certs_var = read_var_cell_absorbed(stream, buf, link_proto, &mut state).await?;
    if peer_certs_var.command != cell::CMD_CERTS {
        return Err(OrLinkError::Protocol("expected CERTS from responder".into()));
    }
    let peer_certs = CertsCell::decode(&peer_certs_var.payload)
        .map_err(|e| OrLinkError::Protocol(e.to_string()))?;
    let peer_id_cert = peer_certs
        .find(cert_type::ID_1024)
        .ok_or_else(|| OrLinkError::Protocol("peer CERTS missing ID cert".into()))?;
    let peer_identity = identity_digest_of(&peer_id_cert.der);
    if peer_identity != expected_identity {
        return Err(OrLinkError::IdentityMismatch {
            expected: hex_digest(&expected_identity),
            actual: hex_digest(&peer_identity),
        });
    }

    let challenge_var = read_var_cell_absorbed(stream, buf, link_proto, &mut state).await?;
    if challenge_var.command != cell::CMD_AUTH_CHALLENGE {
        return Err(OrLinkError::Protocol("expected AUTH_CHALLENGE from responder".into()));
    }
    let _challenge = AuthChallengeCell::decode(&challenge_var.payload)
        .map_err(|e| OrLinkError::Protocol(e.to_string()))?;

    let our_certs = CertsCell {
        certs: vec![
            CertEntry {
                cert_type: cert_type::ID_1024,
                der: params.identity_public_cert_der.clone(),
            },
            CertEntry {
                cert_type: cert_type::AUTH_1024,
                der: params.auth_public_cert_der.clone(),
            },
        ],
    };
    let certs_cell = VarCell::new(0, cell::CMD_CERTS, our_certs.encode());
    write_var_cell_absorbed(stream, &certs_cell, link_proto, &mut state).await?;

    // Freeze the transcript now: everything from VERSIONS through our own
    // CERTS, both directions, and nothing sent/received after.
    let server_transcript_digest = state.transcript.finalize(Direction::Received);
    let client_transcript_digest = state.transcript.finalize(Direction::Sent);
    state.transcript.stop_gating(Direction::Sent);
    state.transcript.stop_gating(Direction::Received);

    let mut nonce = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let fields = AuthBodyFields {
        client_id: sha256_cert_digest(&params.identity_public_cert_der),
        server_id: sha256_cert_digest(&peer_id_cert.der),
        server_transcript: server_transcript_digest,
        client_transcript: client_transcript_digest,
        tls_link_cert_sha256,
        tls_secrets_hmac: auth::tls_secrets_hmac(tls_exporter_secret, false),
        time: now_unix(),
        nonce,
    };
    let fixed_body = fields.encode();
    let signature = auth::sign(params.auth_private_key.clone(), fixed_body.clone()).await?;
    let mut body = fixed_body;
    body.extend_from_slice(&signature);
    let auth_cell = AuthenticateCell {
        authtype: AUTHTYPE_RSA_SHA256_TLSSECRET,
        body,
    };
    let auth_var = VarCell::new(0, cell::CMD_AUTHENTICATE, auth_cell.encode());
    let auth_bytes = auth_var
        .pack(link_proto)
        .map_err(|e| OrLinkError::Protocol(e.to_string()))?;
    stream.write_all(&auth_bytes).await.map_err(OrLinkError::Io)?;

    state.id_cert = Some(peer_id_cert.der.clone());
    state.auth_cert = peer_certs.find(cert_type::AUTH_1024).map(|c| c.der.clone());

    let netinfo = exchange_netinfo(stream, buf, link_proto, params, &mut state).await?;

    Ok(HandshakeOutcome {
        link_proto,
        peer_identity,
        peer_is_client: netinfo.our_addrs.is_empty(),
        state,
    })
}

/// v2 handshake: no CERTS/AUTHENTICATE, identity comes from the TLS link
/// certificate alone, and only NETINFO is exchanged in-band (§4.7 v2
/// handshake). Still accepted from a responder-only stance when
/// `accept_legacy_v1` config allows it (§9 Open Question resolution: we
/// never originate below v3, but we tolerate an old initiator).
#[instrument(skip_all)]
pub async fn run_v2<S>(
    stream: &mut S,
    buf: &mut Buffer,
    link_proto: u16,
    tls_identity: IdentityDigest,
    params: &HandshakeParams,
    mut state: HandshakeState,
) -> Result<HandshakeOutcome, OrLinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let netinfo = exchange_netinfo(stream, buf, link_proto, params, &mut state).await?;
    Ok(HandshakeOutcome {
        link_proto,
        peer_identity: tls_identity,
        peer_is_client: netinfo.our_addrs.is_empty(),
        state,
    })
}

async fn exchange_netinfo<S>(
    stream: &mut S,
    buf: &mut Buffer,
    link_proto: u16,
    params: &HandshakeParams,
    state: &mut HandshakeState,
) -> Result<NetinfoCell, OrLinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let ours = NetinfoCell {
        timestamp: now_unix() as u32,
        their_addr: Some(AddrEnc::from_ip(params.peer_addr.ip())),
        our_addrs: params.our_addrs.iter().map(|ip| AddrEnc::from_ip(*ip)).collect(),
    };
    let ours_cell = or_wire::cell::Cell::new(0, cell::CMD_NETINFO, ours.encode());
    let ours_bytes = ours_cell.pack(link_proto);
    stream.write_all(&ours_bytes).await.map_err(OrLinkError::Io)?;

    let received = fill_until(stream, buf, |b| b.fetch_fixed_cell(link_proto)).await?;
    if received.command != cell::CMD_NETINFO {
        return Err(OrLinkError::Protocol(format!(
            "expected NETINFO, got command {}",
            received.command
        )));
    }
    state.negotiated_link_proto = link_proto;
    NetinfoCell::decode(&received.payload).map_err(|e| OrLinkError::Protocol(e.to_string()))
}

fn rsa_public_key_from_der(der: &[u8]) -> Result<RsaPublicKey, OrLinkError> {
    use rsa::pkcs8::DecodePublicKey;
    RsaPublicKey::from_public_key_der(der)
        .or_else(|_| {
            use rsa::pkcs1::DecodeRsaPublicKey;
            RsaPublicKey::from_pkcs1_der(der)
        })
        .map_err(|e| OrLinkError::Protocol(format!("bad auth certificate key: {e}")))
}

fn hex_digest(d: &[u8]) -> String {
    d.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_digest_is_20_bytes_of_sha1() {
        let der = b"not a real cert, just bytes to hash";
        let digest = identity_digest_of(der);
        assert_eq!(digest.len(), 20);
    }

    #[test]
    fn hex_digest_formats_lowercase() {
        let d: IdentityDigest = [0xAB; 20];
        assert_eq!(hex_digest(&d), "ab".repeat(20));
    }
}
