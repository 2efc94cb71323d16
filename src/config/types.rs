//! Top-level configuration structs.

use serde::Deserialize;
use std::path::PathBuf;

use super::{BandwidthConfig, LimitsConfig, PortConfig, ProxyConfig};

/// Identity and link-protocol configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Human-readable nickname, used only in logs.
    pub nickname: String,
    /// Path to the PEM-encoded RSA identity key this relay authenticates
    /// AUTHENTICATE cells with (§4.7).
    pub identity_key_path: PathBuf,
    /// Link protocol versions this engine will negotiate, highest first.
    #[serde(default = "default_link_protocols")]
    pub link_protocols: Vec<u16>,
    /// Accept v1-signaling initiators on an OR listener even though this
    /// engine never originates a v1 handshake itself (§9 Open Question:
    /// legacy v1 handshake relevance).
    #[serde(default = "default_true")]
    pub accept_legacy_v1_initiators: bool,
    /// Port the Prometheus `/metrics` endpoint binds on. `0` disables it
    /// entirely (e.g. for tests).
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_link_protocols() -> Vec<u16> {
    vec![5, 4, 3]
}

fn default_true() -> bool {
    true
}

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub bandwidth: BandwidthConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_deserializes() {
        let toml_str = r#"
            [server]
            nickname = "relay1"
            identity_key_path = "/etc/orlinkd/identity.pem"

            [[ports]]
            kind = "or"
            port = 9001
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.server.nickname, "relay1");
        assert_eq!(cfg.ports.len(), 1);
        assert_eq!(cfg.server.link_protocols, vec![5, 4, 3]);
        assert!(cfg.server.accept_legacy_v1_initiators);
    }
}
