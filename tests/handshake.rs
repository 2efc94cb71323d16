//! End-to-end OR-link handshake scenarios driven over an in-process
//! duplex stream, exercising `or_link::handshake` the way `Listener`'s
//! accept/dial paths do (minus the TLS layer itself).

use std::net::{IpAddr, SocketAddr};

use orlinkd::or_link::handshake::{
    negotiate_versions, run_v2, run_v3_initiator, run_v3_responder, HandshakeParams,
};
use orlinkd::or_link::HandshakeState;
use or_wire::buffer::Buffer;
use rsa::pkcs8::EncodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::io::duplex;

struct Identity {
    digest: [u8; 20],
    private_key: RsaPrivateKey,
    cert_der: Vec<u8>,
}

fn make_identity() -> Identity {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let public_key = RsaPublicKey::from(&private_key);
    let cert_der = public_key.to_public_key_der().unwrap().as_bytes().to_vec();
    let digest = {
        use sha1::{Digest as _, Sha1};
        let d = Sha1::digest(&cert_der);
        let mut out = [0u8; 20];
        out.copy_from_slice(&d);
        out
    };
    Identity {
        digest,
        private_key,
        cert_der,
    }
}

fn params_for(identity: &Identity, auth: &Identity, peer_addr: SocketAddr, our_addrs: Vec<IpAddr>) -> HandshakeParams {
    HandshakeParams {
        local_versions: vec![5, 4, 3],
        local_identity: identity.digest,
        identity_private_key: identity.private_key.clone(),
        identity_public_cert_der: identity.cert_der.clone(),
        auth_private_key: auth.private_key.clone(),
        auth_public_cert_der: auth.cert_der.clone(),
        our_addrs,
        peer_addr,
        accept_legacy_v1: true,
    }
}

#[tokio::test]
async fn v3_initiator_and_responder_agree_on_identity_and_link_proto() {
    let (mut client, mut server) = duplex(8192);

    let client_identity = make_identity();
    let client_auth = make_identity();
    let server_identity = make_identity();
    let server_auth = make_identity();

    let server_identity_digest = server_identity.digest;
    let client_addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
    let server_addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();

    let server_task = tokio::spawn(async move {
        let mut buf = Buffer::new();
        let mut state = HandshakeState::new(false);
        let link_proto = negotiate_versions(&mut server, &mut buf, &[5, 4, 3], &mut state)
            .await
            .unwrap();
        let params = params_for(&server_identity, &server_auth, client_addr, vec![server_addr.ip()]);
        run_v3_responder(&mut server, &mut buf, link_proto, &params, state)
            .await
            .unwrap()
    });

    let mut buf = Buffer::new();
    let mut state = HandshakeState::new(true);
    let link_proto = negotiate_versions(&mut client, &mut buf, &[5, 4, 3], &mut state)
        .await
        .unwrap();
    let client_params = params_for(&client_identity, &client_auth, server_addr, vec![]);
    let client_outcome = run_v3_initiator(
        &mut client,
        &mut buf,
        link_proto,
        server_identity_digest,
        b"test exporter secret",
        [0u8; 32],
        &client_params,
        state,
    )
    .await
    .unwrap();

    let server_outcome = server_task.await.unwrap();

    assert_eq!(client_outcome.link_proto, 5);
    assert_eq!(server_outcome.link_proto, 5);
    assert_eq!(client_outcome.peer_identity, server_identity_digest);
    assert_eq!(server_outcome.peer_identity, client_identity.digest);
    // The server advertised no addresses of its own to the client in this
    // run's NETINFO -> the responder sees the initiator as a client.
    assert!(!server_outcome.peer_is_client);
    assert!(client_outcome.peer_is_client);
}

#[tokio::test]
async fn v3_initiator_rejects_identity_mismatch_before_authenticating() {
    let (mut client, mut server) = duplex(8192);

    let client_identity = make_identity();
    let client_auth = make_identity();
    let server_identity = make_identity();
    let server_auth = make_identity();
    let wrong_identity = make_identity().digest;

    let client_addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
    let server_addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();

    let server_task = tokio::spawn(async move {
        let mut buf = Buffer::new();
        let mut state = HandshakeState::new(false);
        let link_proto = negotiate_versions(&mut server, &mut buf, &[5, 4, 3], &mut state)
            .await
            .unwrap();
        let params = params_for(&server_identity, &server_auth, client_addr, vec![]);
        // The responder side still completes its half — it's the dialer
        // that notices the mismatch and bails before AUTHENTICATE.
        let _ = run_v3_responder(&mut server, &mut buf, link_proto, &params, state).await;
    });

    let mut buf = Buffer::new();
    let mut state = HandshakeState::new(true);
    let link_proto = negotiate_versions(&mut client, &mut buf, &[5, 4, 3], &mut state)
        .await
        .unwrap();
    let client_params = params_for(&client_identity, &client_auth, server_addr, vec![]);
    let err = run_v3_initiator(
        &mut client,
        &mut buf,
        link_proto,
        wrong_identity,
        b"test exporter secret",
        [0u8; 32],
        &client_params,
        state,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, orlinkd::OrLinkError::IdentityMismatch { .. }));
    drop(server_task);
}

#[tokio::test]
async fn v2_handshake_exchanges_netinfo_without_certs_or_authenticate() {
    let (mut client, mut server) = duplex(8192);

    let client_identity = make_identity();
    let client_auth = make_identity();
    let server_identity = make_identity();
    let server_auth = make_identity();
    let tls_identity = client_identity.digest;

    let client_addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
    let server_addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();

    let server_task = tokio::spawn(async move {
        let mut buf = Buffer::new();
        let state = HandshakeState::new(false);
        let params = params_for(&server_identity, &server_auth, client_addr, vec![server_addr.ip()]);
        run_v2(&mut server, &mut buf, 2, tls_identity, &params, state)
            .await
            .unwrap()
    });

    let mut buf = Buffer::new();
    let state = HandshakeState::new(true);
    let client_params = params_for(&client_identity, &client_auth, server_addr, vec![client_addr.ip()]);
    let client_outcome = run_v2(&mut client, &mut buf, 2, server_identity.digest, &client_params, state)
        .await
        .unwrap();

    let server_outcome = server_task.await.unwrap();

    assert_eq!(client_outcome.link_proto, 2);
    assert_eq!(server_outcome.peer_identity, tls_identity);
    assert!(!client_outcome.peer_is_client);
    assert!(!server_outcome.peer_is_client);
}
