//! Typed bodies for the handshake cells named in §4.7/§6: `VERSIONS`,
//! `CERTS`, `AUTH_CHALLENGE`, `AUTHENTICATE`, `NETINFO`. Each type knows how
//! to encode/decode its own payload; framing the payload into a `VarCell`
//! or `Cell` is the caller's job (`orlinkd::or_link::handshake`).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::WireError;

/// `count(1) || (version(2))*count` — the payload of a `VERSIONS` cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionsCell {
    pub versions: Vec<u16>,
}

impl VersionsCell {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.versions.len() * 2);
        for v in &self.versions {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() % 2 != 0 {
            return Err(WireError::OddVersionsPayload(bytes.len()));
        }
        let versions = bytes
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { versions })
    }

    /// Highest version shared between `self` and `other`, if any.
    pub fn best_shared(&self, other: &[u16]) -> Option<u16> {
        self.versions
            .iter()
            .filter(|v| other.contains(v))
            .copied()
            .max()
    }
}

/// Certificate type codes used in the `CERTS` cell body (§6).
pub mod cert_type {
    pub const TLS_LINK: u8 = 1;
    pub const ID_1024: u8 = 2;
    pub const AUTH_1024: u8 = 3;
}

/// One entry of a `CERTS` cell: `cert_type(1) || cert_len(2) || cert_der`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertEntry {
    pub cert_type: u8,
    pub der: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertsCell {
    pub certs: Vec<CertEntry>,
}

impl CertsCell {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.certs.len() > u8::MAX as usize {
            return Err(WireError::BadCerts("more than 255 certs".into()));
        }
        let mut out = vec![self.certs.len() as u8];
        for entry in &self.certs {
            if entry.der.len() > u16::MAX as usize {
                return Err(WireError::BadCerts("cert exceeds 65535 bytes".into()));
            }
            out.push(entry.cert_type);
            out.extend_from_slice(&(entry.der.len() as u16).to_be_bytes());
            out.extend_from_slice(&entry.der);
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.is_empty() {
            return Err(WireError::BadCerts("empty CERTS body".into()));
        }
        let n = bytes[0] as usize;
        let mut pos = 1usize;
        let mut certs = Vec::with_capacity(n);
        for _ in 0..n {
            if pos + 3 > bytes.len() {
                return Err(WireError::BadCerts("truncated cert header".into()));
            }
            let cert_type = bytes[pos];
            let len = u16::from_be_bytes([bytes[pos + 1], bytes[pos + 2]]) as usize;
            pos += 3;
            if pos + len > bytes.len() {
                return Err(WireError::BadCerts("truncated cert body".into()));
            }
            certs.push(CertEntry {
                cert_type,
                der: bytes[pos..pos + len].to_vec(),
            });
            pos += len;
        }
        Ok(Self { certs })
    }

    pub fn find(&self, cert_type: u8) -> Option<&CertEntry> {
        self.certs.iter().find(|c| c.cert_type == cert_type)
    }

    pub fn has(&self, cert_type: u8) -> bool {
        self.find(cert_type).is_some()
    }
}

/// Authentication type codes for `AUTH_CHALLENGE`/`AUTHENTICATE` (§6).
pub const AUTHTYPE_RSA_SHA256_TLSSECRET: u16 = 1;

/// `challenge(32) || n_methods(2) || method(2)*n_methods`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallengeCell {
    pub challenge: [u8; 32],
    pub methods: Vec<u16>,
}

impl AuthChallengeCell {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(34 + self.methods.len() * 2);
        out.extend_from_slice(&self.challenge);
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for m in &self.methods {
            out.extend_from_slice(&m.to_be_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < 34 {
            return Err(WireError::Truncated {
                needed: 34,
                actual: bytes.len(),
            });
        }
        let mut challenge = [0u8; 32];
        challenge.copy_from_slice(&bytes[..32]);
        let n = u16::from_be_bytes([bytes[32], bytes[33]]) as usize;
        let needed = 34 + n * 2;
        if bytes.len() < needed {
            return Err(WireError::Truncated {
                needed,
                actual: bytes.len(),
            });
        }
        let methods = bytes[34..needed]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { challenge, methods })
    }
}

/// `authtype(2) || body_len(2) || body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateCell {
    pub authtype: u16,
    pub body: Vec<u8>,
}

impl AuthenticateCell {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.body.len() > u16::MAX as usize {
            return Err(WireError::VarCellTooLarge {
                actual: self.body.len(),
                limit: u16::MAX as usize,
            });
        }
        let mut out = Vec::with_capacity(4 + self.body.len());
        out.extend_from_slice(&self.authtype.to_be_bytes());
        out.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < 4 {
            return Err(WireError::Truncated {
                needed: 4,
                actual: bytes.len(),
            });
        }
        let authtype = u16::from_be_bytes([bytes[0], bytes[1]]);
        let body_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if bytes.len() != 4 + body_len {
            return Err(WireError::Truncated {
                needed: 4 + body_len,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            authtype,
            body: bytes[4..].to_vec(),
        })
    }
}

/// `type(1) || len(1) || addr(len)`. `type=4 len=4` IPv4, `type=6 len=16`
/// IPv6 (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrEnc {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl AddrEnc {
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => AddrEnc::V4(v4),
            IpAddr::V6(v6) => AddrEnc::V6(v6),
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self {
            AddrEnc::V4(v4) => IpAddr::V4(*v4),
            AddrEnc::V6(v6) => IpAddr::V6(*v6),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            AddrEnc::V4(v4) => {
                let mut out = vec![4, 4];
                out.extend_from_slice(&v4.octets());
                out
            }
            AddrEnc::V6(v6) => {
                let mut out = vec![6, 16];
                out.extend_from_slice(&v6.octets());
                out
            }
        }
    }

    /// Decode one address starting at the front of `bytes`; returns the
    /// address and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        if bytes.len() < 2 {
            return Err(WireError::Truncated {
                needed: 2,
                actual: bytes.len(),
            });
        }
        let addr_type = bytes[0];
        let len = bytes[1] as usize;
        if bytes.len() < 2 + len {
            return Err(WireError::Truncated {
                needed: 2 + len,
                actual: bytes.len(),
            });
        }
        let body = &bytes[2..2 + len];
        let addr = match (addr_type, len) {
            (4, 4) => AddrEnc::V4(Ipv4Addr::new(body[0], body[1], body[2], body[3])),
            (6, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(body);
                AddrEnc::V6(Ipv6Addr::from(octets))
            }
            (4, other) | (6, other) => {
                return Err(WireError::BadAddressLength {
                    addr_type,
                    expected: if addr_type == 4 { 4 } else { 16 },
                    actual: other,
                });
            }
            (other, _) => return Err(WireError::BadAddressType(other)),
        };
        Ok((addr, 2 + len))
    }
}

/// `timestamp(4) || their_addr(addr_enc) || n_our_addrs(1) ||
/// our_addr(addr_enc)*n_our_addrs` (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetinfoCell {
    pub timestamp: u32,
    pub their_addr: Option<AddrEnc>,
    pub our_addrs: Vec<AddrEnc>,
}

impl NetinfoCell {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        match &self.their_addr {
            Some(addr) => out.extend_from_slice(&addr.encode()),
            // An omitted their_addr is encoded as a zero-length unknown
            // address (type 0, len 0) rather than skipped entirely, so the
            // our_addrs count that follows stays at a fixed offset.
            None => out.extend_from_slice(&[0, 0]),
        }
        out.push(self.our_addrs.len() as u8);
        for addr in &self.our_addrs {
            out.extend_from_slice(&addr.encode());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < 4 {
            return Err(WireError::Truncated {
                needed: 4,
                actual: bytes.len(),
            });
        }
        let timestamp = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut pos = 4;
        let their_addr = if bytes.len() >= pos + 2 && bytes[pos] == 0 && bytes[pos + 1] == 0 {
            pos += 2;
            None
        } else {
            let (addr, consumed) = AddrEnc::decode(&bytes[pos..])?;
            pos += consumed;
            Some(addr)
        };
        if bytes.len() <= pos {
            return Err(WireError::Truncated {
                needed: pos + 1,
                actual: bytes.len(),
            });
        }
        let n_our = bytes[pos] as usize;
        pos += 1;
        let mut our_addrs = Vec::with_capacity(n_our);
        for _ in 0..n_our {
            let (addr, consumed) = AddrEnc::decode(&bytes[pos..])?;
            our_addrs.push(addr);
            pos += consumed;
        }
        Ok(Self {
            timestamp,
            their_addr,
            our_addrs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_roundtrip() {
        let v = VersionsCell {
            versions: vec![3, 4],
        };
        let decoded = VersionsCell::decode(&v.encode()).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn versions_odd_payload_rejected() {
        assert!(matches!(
            VersionsCell::decode(&[0, 3, 0]),
            Err(WireError::OddVersionsPayload(3))
        ));
    }

    #[test]
    fn versions_best_shared_picks_highest_common() {
        let ours = VersionsCell {
            versions: vec![1, 2, 3, 4],
        };
        assert_eq!(ours.best_shared(&[3, 4, 5]), Some(4));
        assert_eq!(ours.best_shared(&[9]), None);
    }

    #[test]
    fn certs_roundtrip_and_lookup() {
        let certs = CertsCell {
            certs: vec![
                CertEntry {
                    cert_type: cert_type::ID_1024,
                    der: vec![1, 2, 3],
                },
                CertEntry {
                    cert_type: cert_type::TLS_LINK,
                    der: vec![4, 5],
                },
            ],
        };
        let decoded = CertsCell::decode(&certs.encode().unwrap()).unwrap();
        assert_eq!(certs, decoded);
        assert!(decoded.has(cert_type::ID_1024));
        assert!(decoded.has(cert_type::TLS_LINK));
        assert!(!decoded.has(cert_type::AUTH_1024));
    }

    #[test]
    fn auth_challenge_roundtrip() {
        let c = AuthChallengeCell {
            challenge: [7u8; 32],
            methods: vec![AUTHTYPE_RSA_SHA256_TLSSECRET],
        };
        assert_eq!(AuthChallengeCell::decode(&c.encode()).unwrap(), c);
    }

    #[test]
    fn authenticate_roundtrip() {
        let a = AuthenticateCell {
            authtype: AUTHTYPE_RSA_SHA256_TLSSECRET,
            body: vec![0u8; 224],
        };
        assert_eq!(AuthenticateCell::decode(&a.encode().unwrap()).unwrap(), a);
    }

    #[test]
    fn netinfo_roundtrip_with_addresses() {
        let n = NetinfoCell {
            timestamp: 1_700_000_000,
            their_addr: Some(AddrEnc::V4(Ipv4Addr::new(203, 0, 113, 5))),
            our_addrs: vec![AddrEnc::V6(Ipv6Addr::LOCALHOST)],
        };
        assert_eq!(NetinfoCell::decode(&n.encode()).unwrap(), n);
    }

    #[test]
    fn netinfo_roundtrip_client_omits_their_addr() {
        let n = NetinfoCell {
            timestamp: 42,
            their_addr: None,
            our_addrs: vec![],
        };
        let decoded = NetinfoCell::decode(&n.encode()).unwrap();
        assert_eq!(decoded.their_addr, None);
        assert!(decoded.our_addrs.is_empty());
    }
}
