//! Per-port listener configuration (`PortConfig`, §3).

use serde::Deserialize;
use std::path::PathBuf;

/// Which connection kind a listener produces (drives dispatch in
/// `network::connection::ConnectionKind`).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListenKind {
    /// OR port: accepts inbound OR-link connections from other relays.
    Or,
    /// Directory port: accepts inbound directory-protocol HTTP connections.
    /// Dispatch only; the directory protocol itself is out of scope.
    Dir,
    /// SOCKS (AP) port: accepts application-proxy client connections.
    Socks,
    /// Control port: accepts local control-protocol connections.
    Control,
}

/// Either a fixed TCP port or `Auto`, meaning "bind port 0 and discover the
/// kernel-assigned port via `getsockname`" (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    Fixed(u16),
    Auto,
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(u16),
            Auto(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(PortSpec::Fixed(n)),
            Repr::Auto(s) if s.eq_ignore_ascii_case("auto") => Ok(PortSpec::Auto),
            Repr::Auto(other) => Err(serde::de::Error::custom(format!(
                "expected a port number or \"auto\", got {other:?}"
            ))),
        }
    }
}

/// A single listener the reconciliation algorithm (§4.5) binds or closes.
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    pub kind: ListenKind,
    /// Address to bind to, e.g. "0.0.0.0" or "::". Ignored when
    /// `unix_path` is set.
    #[serde(default = "default_addr")]
    pub address: String,
    pub port: PortSpec,
    /// Bind a Unix domain socket at this path instead of a TCP port.
    #[serde(default)]
    pub unix_path: Option<PathBuf>,
    /// Bind but refuse new connections on this port (useful for holding a
    /// slot open during a graceful restart).
    #[serde(default)]
    pub no_listen: bool,
    /// Bind and accept, but never advertise this port in descriptors.
    #[serde(default)]
    pub no_advertise: bool,
    #[serde(default)]
    pub ipv4_only: bool,
    #[serde(default)]
    pub ipv6_only: bool,
    /// Stream isolation: connections through ports with different
    /// `session_group` values never share a circuit.
    #[serde(default)]
    pub session_group: Option<u32>,
    /// Per-listener TLS configuration. Required for `ListenKind::Or`.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl PortConfig {
    pub fn is_unix(&self) -> bool {
        self.unix_path.is_some()
    }
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

/// TLS material for an OR-port listener.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_spec_accepts_auto() {
        #[derive(Deserialize)]
        struct W {
            port: PortSpec,
        }
        let w: W = toml::from_str(r#"port = "auto""#).unwrap();
        assert_eq!(w.port, PortSpec::Auto);
    }

    #[test]
    fn port_spec_accepts_fixed_number() {
        #[derive(Deserialize)]
        struct W {
            port: PortSpec,
        }
        let w: W = toml::from_str("port = 9001").unwrap();
        assert_eq!(w.port, PortSpec::Fixed(9001));
    }

    #[test]
    fn or_port_deserializes_with_defaults() {
        let toml_str = r#"
            kind = "or"
            port = 9001
        "#;
        let cfg: PortConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.address, "0.0.0.0");
        assert!(!cfg.no_listen);
        assert!(!cfg.is_unix());
    }

    #[test]
    fn unix_socket_port_config() {
        let toml_str = r#"
            kind = "control"
            port = 0
            unix_path = "/run/orlinkd/control.sock"
        "#;
        let cfg: PortConfig = toml::from_str(toml_str).unwrap();
        assert!(cfg.is_unix());
    }
}
