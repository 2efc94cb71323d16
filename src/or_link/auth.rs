//! AUTHENTICATE cell body construction and verification (§4.7).
//!
//! Exact layout (`RSA_SHA256_TLSSECRET`, authtype 1):
//!
//! ```text
//! "AUTH0001" || client_id_sha256(32) || server_id_sha256(32)
//!            || server_transcript(32) || client_transcript(32)
//!            || tls_link_cert_sha256(32) || tls_secrets_hmac(32)
//!            || time(8) || nonce(16) || rsa_sig
//! ```
//!
//! `client_id_sha256`/`server_id_sha256` are SHA-256 digests of each
//! side's identity certificate DER — distinct from the SHA-1
//! [`IdentityDigest`] used to key the link registry.
//!
//! RSA signing/verification run on the blocking thread pool
//! (`tokio::task::spawn_blocking`) since `rsa` crate operations are CPU
//! bound and would otherwise stall the async reactor.

use hmac::{Hmac, Mac};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::OrLinkError;

const MAGIC: &[u8; 8] = b"AUTH0001";

/// Everything in the AUTHENTICATE body except the trailing RSA signature.
/// Computing this is pure (no I/O, no crypto-library CPU cost worth
/// offloading), unlike signing/verifying it.
pub struct AuthBodyFields {
    pub client_id: [u8; 32],
    pub server_id: [u8; 32],
    pub server_transcript: [u8; 32],
    pub client_transcript: [u8; 32],
    pub tls_link_cert_sha256: [u8; 32],
    pub tls_secrets_hmac: [u8; 32],
    pub time: u64,
    pub nonce: [u8; 16],
}

impl AuthBodyFields {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 32 + 32 + 32 + 32 + 32 + 32 + 8 + 16);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.client_id);
        out.extend_from_slice(&self.server_id);
        out.extend_from_slice(&self.server_transcript);
        out.extend_from_slice(&self.client_transcript);
        out.extend_from_slice(&self.tls_link_cert_sha256);
        out.extend_from_slice(&self.tls_secrets_hmac);
        out.extend_from_slice(&self.time.to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OrLinkError> {
        const FIXED_LEN: usize = 8 + 32 + 32 + 32 + 32 + 32 + 32 + 8 + 16;
        if bytes.len() < FIXED_LEN {
            return Err(OrLinkError::Protocol(format!(
                "AUTHENTICATE body too short: {} < {FIXED_LEN}",
                bytes.len()
            )));
        }
        if &bytes[0..8] != MAGIC {
            return Err(OrLinkError::Protocol("bad AUTHENTICATE magic".into()));
        }
        let mut pos = 8;
        let take = |pos: &mut usize, n: usize| -> &[u8] {
            let slice = &bytes[*pos..*pos + n];
            *pos += n;
            slice
        };
        let client_id: [u8; 32] = take(&mut pos, 32).try_into().unwrap();
        let server_id: [u8; 32] = take(&mut pos, 32).try_into().unwrap();
        let server_transcript: [u8; 32] = take(&mut pos, 32).try_into().unwrap();
        let client_transcript: [u8; 32] = take(&mut pos, 32).try_into().unwrap();
        let tls_link_cert_sha256: [u8; 32] = take(&mut pos, 32).try_into().unwrap();
        let tls_secrets_hmac: [u8; 32] = take(&mut pos, 32).try_into().unwrap();
        let time = u64::from_be_bytes(take(&mut pos, 8).try_into().unwrap());
        let nonce: [u8; 16] = take(&mut pos, 16).try_into().unwrap();
        Ok(Self {
            client_id,
            server_id,
            server_transcript,
            client_transcript,
            tls_link_cert_sha256,
            tls_secrets_hmac,
            time,
            nonce,
        })
    }
}

/// Derive the `tls_secrets_hmac` field from the TLS exporter secret
/// (already computed by the caller via rustls's keying-material export),
/// keyed to this role so client and server don't produce the same value.
pub fn tls_secrets_hmac(exporter_secret: &[u8], is_server_role: bool) -> [u8; 32] {
    type HmacSha256 = Hmac<Sha256>;
    let key = if is_server_role {
        b"OR-link server TLS secrets" as &[u8]
    } else {
        b"OR-link client TLS secrets" as &[u8]
    };
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(exporter_secret);
    mac.finalize().into_bytes().into()
}

/// Sign `body` (the SHA-256 of the encoded fixed fields) with our RSA
/// identity/auth key. Runs on the blocking pool.
pub async fn sign(private_key: RsaPrivateKey, body: Vec<u8>) -> Result<Vec<u8>, OrLinkError> {
    tokio::task::spawn_blocking(move || {
        let digest = Sha256::digest(&body);
        let signing_key = SigningKey::<Sha256>::new(private_key);
        let mut rng = rand::rngs::OsRng;
        let sig: Signature = signing_key.sign_with_rng(&mut rng, &digest);
        Ok(sig.to_bytes().to_vec())
    })
    .await
    .map_err(|e| OrLinkError::Protocol(format!("signing task panicked: {e}")))?
}

/// Verify `signature` over `body` against the peer's auth-cert public
/// key. Runs on the blocking pool.
pub async fn verify(
    public_key: RsaPublicKey,
    body: Vec<u8>,
    signature: Vec<u8>,
) -> Result<(), OrLinkError> {
    tokio::task::spawn_blocking(move || {
        let digest = Sha256::digest(&body);
        let verifying_key = VerifyingKey::<Sha256>::new(public_key);
        let sig = Signature::try_from(signature.as_slice())
            .map_err(|e| OrLinkError::Protocol(format!("malformed RSA signature: {e}")))?;
        verifying_key
            .verify(&digest, &sig)
            .map_err(|_| OrLinkError::IdentityMismatch {
                expected: "valid AUTHENTICATE signature".into(),
                actual: "signature verification failed".into(),
            })
    })
    .await
    .map_err(|e| OrLinkError::Protocol(format!("verify task panicked: {e}")))?
}
