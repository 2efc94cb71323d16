//! Client-side proxy handshake state machine (§4.6): drives a dialed
//! socket through an HTTPS-CONNECT, SOCKS4, or SOCKS5 upstream proxy
//! before the TLS layer starts.

use std::net::SocketAddr;

use or_wire::socks::{self, ProxyKind, ProxyState, SocksReplyOutcome};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::OrLinkError;

/// Drive `stream` through `proxy` to reach `target`, returning once the
/// proxy has confirmed the tunnel is up (§4.6 "On `Connected`, the caller
/// initiates the overlying TLS handshake").
pub async fn connect_through<S>(
    stream: &mut S,
    proxy: &ProxyConfig,
    target: SocketAddr,
) -> Result<(), OrLinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match config_kind_to_wire(proxy.kind) {
        ProxyKind::Connect => connect_https(stream, proxy, target).await,
        ProxyKind::Socks4 => connect_socks4(stream, target).await,
        ProxyKind::Socks5 => connect_socks5(stream, proxy, target).await,
    }
}

fn config_kind_to_wire(kind: crate::config::ProxyKind) -> ProxyKind {
    match kind {
        crate::config::ProxyKind::Connect => ProxyKind::Connect,
        crate::config::ProxyKind::Socks4 => ProxyKind::Socks4,
        crate::config::ProxyKind::Socks5 => ProxyKind::Socks5,
    }
}

const MAX_HEADERS_SIZE: usize = 8192;

async fn connect_https<S>(
    stream: &mut S,
    proxy: &ProxyConfig,
    target: SocketAddr,
) -> Result<(), OrLinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let auth = match (&proxy.username, &proxy.password) {
        (Some(u), Some(p)) => Some(base64_basic(u, p)),
        _ => None,
    };
    let req = socks::build_https_connect(target, auth.as_deref());
    stream.write_all(&req).await.map_err(OrLinkError::Io)?;

    let mut buf = or_wire::buffer::Buffer::new();
    let (status_line, _) = loop {
        match buf.fetch_http(MAX_HEADERS_SIZE, 0) {
            Ok((lines, body)) => break (lines[0].clone(), body),
            Err(or_wire::error::FetchError::Incomplete) => {
                read_more(stream, &mut buf).await?;
            }
            Err(e) => return Err(OrLinkError::Protocol(e.to_string())),
        }
    };

    let code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| OrLinkError::Protocol(format!("malformed CONNECT status line: {status_line}")))?;
    match code {
        200 => {
            debug!(%target, "HTTPS CONNECT established");
            Ok(())
        }
        403 => Err(OrLinkError::AdministrativeClose(
            "HTTPS proxy refused CONNECT (403)".into(),
        )),
        other => Err(OrLinkError::Protocol(format!(
            "HTTPS proxy CONNECT failed with status {other}"
        ))),
    }
}

async fn connect_socks4<S>(stream: &mut S, target: SocketAddr) -> Result<(), OrLinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let req = socks::build_socks4_connect(target)
        .ok_or_else(|| OrLinkError::Protocol("SOCKS4 does not support IPv6 targets".into()))?;
    stream.write_all(&req).await.map_err(OrLinkError::Io)?;

    let mut buf = or_wire::buffer::Buffer::new();
    let outcome = loop {
        match buf.fetch_socks_client_reply(ProxyState::Socks4WantConnectOk) {
            Ok(outcome) => break outcome,
            Err(or_wire::error::FetchError::Incomplete) => read_more(stream, &mut buf).await?,
            Err(e) => return Err(OrLinkError::Protocol(e.to_string())),
        }
    };
    match outcome {
        SocksReplyOutcome::Connected => Ok(()),
        SocksReplyOutcome::Error(reason) => Err(OrLinkError::AdministrativeClose(reason)),
        other => Err(OrLinkError::Protocol(format!("unexpected SOCKS4 outcome {other:?}"))),
    }
}

async fn connect_socks5<S>(
    stream: &mut S,
    proxy: &ProxyConfig,
    target: SocketAddr,
) -> Result<(), OrLinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let want_userpass = proxy.username.is_some() && proxy.password.is_some();
    let greeting = socks::build_socks5_greeting(want_userpass);
    stream.write_all(&greeting).await.map_err(OrLinkError::Io)?;

    let mut buf = or_wire::buffer::Buffer::new();
    let method_state = if want_userpass {
        ProxyState::Socks5WantAuthMethodUserPass
    } else {
        ProxyState::Socks5WantAuthMethodNone
    };
    let method_outcome = loop {
        match buf.fetch_socks_client_reply(method_state) {
            Ok(outcome) => break outcome,
            Err(or_wire::error::FetchError::Incomplete) => read_more(stream, &mut buf).await?,
            Err(e) => return Err(OrLinkError::Protocol(e.to_string())),
        }
    };

    match method_outcome {
        SocksReplyOutcome::NeedAuth => {
            let (user, pass) = match (&proxy.username, &proxy.password) {
                (Some(u), Some(p)) => (u.clone(), p.clone()),
                _ => {
                    return Err(OrLinkError::Protocol(
                        "SOCKS5 server requested auth but no credentials configured".into(),
                    ))
                }
            };
            let req = socks::build_socks5_userpass(&user, &pass);
            stream.write_all(&req).await.map_err(OrLinkError::Io)?;
            let auth_outcome = loop {
                match buf.fetch_socks_client_reply(ProxyState::Socks5WantAuthUserPassOk) {
                    Ok(outcome) => break outcome,
                    Err(or_wire::error::FetchError::Incomplete) => read_more(stream, &mut buf).await?,
                    Err(e) => return Err(OrLinkError::Protocol(e.to_string())),
                }
            };
            match auth_outcome {
                SocksReplyOutcome::ProceedToConnect => {}
                SocksReplyOutcome::Error(reason) => return Err(OrLinkError::AdministrativeClose(reason)),
                other => return Err(OrLinkError::Protocol(format!("unexpected SOCKS5 auth outcome {other:?}"))),
            }
        }
        SocksReplyOutcome::ProceedToConnect => {}
        SocksReplyOutcome::Error(reason) => return Err(OrLinkError::AdministrativeClose(reason)),
        other => return Err(OrLinkError::Protocol(format!("unexpected SOCKS5 method outcome {other:?}"))),
    }

    let connect_req = socks::build_socks5_connect(target);
    stream.write_all(&connect_req).await.map_err(OrLinkError::Io)?;
    let connect_outcome = loop {
        match buf.fetch_socks_client_reply(ProxyState::Socks5WantConnectOk) {
            Ok(outcome) => break outcome,
            Err(or_wire::error::FetchError::Incomplete) => read_more(stream, &mut buf).await?,
            Err(e) => return Err(OrLinkError::Protocol(e.to_string())),
        }
    };
    match connect_outcome {
        SocksReplyOutcome::Connected => {
            debug!(%target, "SOCKS5 CONNECT established");
            Ok(())
        }
        SocksReplyOutcome::Error(reason) => Err(OrLinkError::AdministrativeClose(reason)),
        other => Err(OrLinkError::Protocol(format!("unexpected SOCKS5 CONNECT outcome {other:?}"))),
    }
}

async fn read_more<S>(stream: &mut S, buf: &mut or_wire::buffer::Buffer) -> Result<(), OrLinkError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 512];
    let n = stream.read(&mut chunk).await.map_err(OrLinkError::Io)?;
    if n == 0 {
        return Err(OrLinkError::PeerClose("EOF during proxy handshake".into()));
    }
    buf.append(&chunk[..n]);
    Ok(())
}

fn base64_basic(user: &str, pass: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn sample_proxy(kind: crate::config::ProxyKind) -> ProxyConfig {
        ProxyConfig {
            kind,
            host: "127.0.0.1".into(),
            port: 1080,
            username: None,
            password: None,
        }
    }

    #[tokio::test]
    async fn https_connect_succeeds_on_200() {
        let (mut client, mut server) = duplex(4096);
        let target: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let proxy = sample_proxy(crate::config::ProxyKind::Connect);
        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
        });
        connect_through(&mut client, &proxy, target).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn https_connect_fails_on_403() {
        let (mut client, mut server) = duplex(4096);
        let target: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let proxy = sample_proxy(crate::config::ProxyKind::Connect);
        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();
        });
        let err = connect_through(&mut client, &proxy, target).await.unwrap_err();
        assert!(matches!(err, OrLinkError::AdministrativeClose(_)));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn socks4_rejects_ipv6_target_before_any_io() {
        let (mut client, _server) = duplex(4096);
        let target: SocketAddr = "[::1]:443".parse().unwrap();
        let err = connect_socks4(&mut client, target).await.unwrap_err();
        assert!(matches!(err, OrLinkError::Protocol(_)));
    }

    #[tokio::test]
    async fn socks5_noauth_connect_succeeds() {
        let (mut client, mut server) = duplex(4096);
        let target: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let proxy = sample_proxy(crate::config::ProxyKind::Socks5);
        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(buf[0], 0x05);
            let _ = n;
            let mut reply = vec![0x05, 0x00, 0x00, 0x01];
            reply.extend_from_slice(&[93, 184, 216, 34]);
            reply.extend_from_slice(&443u16.to_be_bytes());
            server.write_all(&reply).await.unwrap();
        });
        connect_through(&mut client, &proxy, target).await.unwrap();
        server_task.await.unwrap();
    }
}
