//! Client-side wire grammar for HTTPS-CONNECT, SOCKS4 and SOCKS5 proxy
//! dialing (§4.6/§6). This module only builds request bytes and parses
//! reply bytes; it does not own a socket or a [`crate::Buffer`] — the
//! daemon's `ProxyClient` drives the state machine and supplies bytes from
//! its own inbuf.

use std::net::{IpAddr, SocketAddr};

/// Which proxy protocol a `ProxyClient` is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Connect,
    Socks4,
    Socks5,
}

/// `Connection::proxy_state` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    None,
    Infant,
    HttpsWantConnectOk,
    Socks4WantConnectOk,
    Socks5WantAuthMethodNone,
    Socks5WantAuthMethodUserPass,
    Socks5WantAuthUserPassOk,
    Socks5WantConnectOk,
    Connected,
}

/// Outcome of parsing the next chunk of a SOCKS4/SOCKS5 server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksReplyOutcome {
    /// The target is reachable and dialing may hand off to the next layer
    /// (TLS, typically).
    Connected,
    /// The SOCKS5 server picked username/password auth; send the
    /// subnegotiation request next.
    NeedAuth,
    /// Authentication (or the method negotiation) succeeded; send the
    /// CONNECT request next.
    ProceedToConnect,
    /// The server rejected the request; human-readable reason.
    Error(String),
}

/// Build the HTTPS CONNECT request line + headers (+ trailing blank line).
pub fn build_https_connect(
    target: SocketAddr,
    proxy_auth_basic_b64: Option<&str>,
) -> Vec<u8> {
    let mut req = format!(
        "CONNECT {}:{} HTTP/1.1\r\n",
        target.ip(),
        target.port()
    );
    if let Some(b64) = proxy_auth_basic_b64 {
        req.push_str(&format!("Proxy-Authorization: Basic {b64}\r\n"));
    }
    req.push_str("\r\n");
    req.into_bytes()
}

/// Build the SOCKS4 CONNECT request. Fails (returns `None`) for IPv6
/// targets: SOCKS4 only supports `AF_INET` (§4.6).
pub fn build_socks4_connect(target: SocketAddr) -> Option<Vec<u8>> {
    let IpAddr::V4(ip) = target.ip() else {
        return None;
    };
    let mut out = Vec::with_capacity(9);
    out.push(0x04); // version
    out.push(0x01); // CONNECT
    out.extend_from_slice(&target.port().to_be_bytes());
    out.extend_from_slice(&ip.octets());
    out.push(0x00); // empty userid
    Some(out)
}

/// Build the SOCKS5 greeting. Advertises no-auth only, or no-auth plus
/// username/password if credentials are configured.
pub fn build_socks5_greeting(want_userpass: bool) -> Vec<u8> {
    if want_userpass {
        vec![0x05, 0x02, 0x00, 0x02]
    } else {
        vec![0x05, 0x01, 0x00]
    }
}

/// Build the SOCKS5 username/password subnegotiation request (RFC 1929).
pub fn build_socks5_userpass(user: &str, pass: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + user.len() + pass.len());
    out.push(0x01);
    out.push(user.len() as u8);
    out.extend_from_slice(user.as_bytes());
    out.push(pass.len() as u8);
    out.extend_from_slice(pass.as_bytes());
    out
}

/// Build the SOCKS5 CONNECT request.
pub fn build_socks5_connect(target: SocketAddr) -> Vec<u8> {
    let mut out = vec![0x05, 0x01, 0x00];
    match target.ip() {
        IpAddr::V4(ip) => {
            out.push(0x01);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(0x04);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&target.port().to_be_bytes());
    out
}

/// Parse an 8-byte SOCKS4 CONNECT reply.
pub fn parse_socks4_reply(bytes: &[u8]) -> Option<SocksReplyOutcome> {
    if bytes.len() < 8 {
        return None;
    }
    Some(if bytes[1] == 0x5A {
        SocksReplyOutcome::Connected
    } else {
        SocksReplyOutcome::Error(format!("SOCKS4 request rejected, code {:#04x}", bytes[1]))
    })
}

/// Parse the 2-byte SOCKS5 auth-method selection reply.
pub fn parse_socks5_method_reply(bytes: &[u8], offered_userpass: bool) -> Option<SocksReplyOutcome> {
    if bytes.len() < 2 {
        return None;
    }
    if bytes[0] != 0x05 {
        return Some(SocksReplyOutcome::Error(
            "SOCKS5 reply has wrong version byte".into(),
        ));
    }
    Some(match bytes[1] {
        0x00 => SocksReplyOutcome::ProceedToConnect,
        0x02 if offered_userpass => SocksReplyOutcome::NeedAuth,
        0xFF => SocksReplyOutcome::Error("SOCKS5 server rejected all auth methods".into()),
        other => SocksReplyOutcome::Error(format!("SOCKS5 server chose unsupported method {other:#04x}")),
    })
}

/// Parse the 2-byte SOCKS5 username/password subnegotiation reply.
pub fn parse_socks5_userpass_reply(bytes: &[u8]) -> Option<SocksReplyOutcome> {
    if bytes.len() < 2 {
        return None;
    }
    Some(if bytes[1] == 0x00 {
        SocksReplyOutcome::ProceedToConnect
    } else {
        SocksReplyOutcome::Error("SOCKS5 username/password authentication failed".into())
    })
}

/// Parse a SOCKS5 CONNECT reply (variable length depending on bound
/// address type); returns `None` if not enough bytes are buffered yet.
pub fn parse_socks5_connect_reply(bytes: &[u8]) -> Option<(SocksReplyOutcome, usize)> {
    if bytes.len() < 4 {
        return None;
    }
    if bytes[0] != 0x05 {
        return Some((
            SocksReplyOutcome::Error("SOCKS5 reply has wrong version byte".into()),
            bytes.len(),
        ));
    }
    let rep = bytes[1];
    let atyp = bytes[3];
    let addr_len = match atyp {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            if bytes.len() < 5 {
                return None;
            }
            1 + bytes[4] as usize
        }
        _ => return Some((SocksReplyOutcome::Error(format!("unsupported bound address type {atyp}")), bytes.len())),
    };
    let total = 4 + addr_len + 2;
    if bytes.len() < total {
        return None;
    }
    let outcome = if rep == 0x00 {
        SocksReplyOutcome::Connected
    } else {
        SocksReplyOutcome::Error(format!("SOCKS5 CONNECT rejected, reply code {rep:#04x}"))
    };
    Some((outcome, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn socks4_rejects_ipv6() {
        let target: SocketAddr = "[::1]:443".parse().unwrap();
        assert!(build_socks4_connect(target).is_none());
    }

    #[test]
    fn socks4_accepts_ipv4() {
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 9001);
        let req = build_socks4_connect(target).unwrap();
        assert_eq!(req[0], 0x04);
        assert_eq!(req[1], 0x01);
        assert_eq!(&req[2..4], &9001u16.to_be_bytes());
        assert_eq!(&req[4..8], &[203, 0, 113, 5]);
    }

    #[test]
    fn socks5_greeting_advertises_userpass_when_requested() {
        assert_eq!(build_socks5_greeting(false), vec![0x05, 0x01, 0x00]);
        assert_eq!(build_socks5_greeting(true), vec![0x05, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn socks5_method_reply_selects_userpass() {
        let outcome = parse_socks5_method_reply(&[0x05, 0x02], true).unwrap();
        assert_eq!(outcome, SocksReplyOutcome::NeedAuth);
    }

    #[test]
    fn socks5_method_reply_no_acceptable_methods() {
        let outcome = parse_socks5_method_reply(&[0x05, 0xFF], true).unwrap();
        assert!(matches!(outcome, SocksReplyOutcome::Error(_)));
    }

    #[test]
    fn socks5_connect_reply_ipv4() {
        let mut bytes = vec![0x05, 0x00, 0x00, 0x01];
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        bytes.extend_from_slice(&9001u16.to_be_bytes());
        let (outcome, consumed) = parse_socks5_connect_reply(&bytes).unwrap();
        assert_eq!(outcome, SocksReplyOutcome::Connected);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn socks5_connect_reply_incomplete_returns_none() {
        let bytes = vec![0x05, 0x00, 0x00, 0x01, 1, 2];
        assert!(parse_socks5_connect_reply(&bytes).is_none());
    }
}
