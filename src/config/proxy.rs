//! Outbound proxy configuration for `ProxyClient` (§4.6).

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Connect,
    Socks4,
    Socks5,
}

/// When set, all outbound OR-link and directory dials go through this
/// proxy instead of connecting directly.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_proxy_with_credentials() {
        let toml_str = r#"
            kind = "socks5"
            host = "127.0.0.1"
            port = 9050
            username = "u"
            password = "p"
        "#;
        let cfg: ProxyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.kind, ProxyKind::Socks5);
        assert_eq!(cfg.username.as_deref(), Some("u"));
    }

    #[test]
    fn connect_proxy_without_credentials() {
        let toml_str = r#"
            kind = "connect"
            host = "proxy.example"
            port = 8080
        "#;
        let cfg: ProxyConfig = toml::from_str(toml_str).unwrap();
        assert!(cfg.username.is_none());
    }
}
