//! Resource limits configuration (§5 FD budget, handshake timeouts).

use serde::Deserialize;

/// Resource limits that bound the connection engine's footprint.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// File descriptors reserved for listeners, logs, and the metrics
    /// HTTP server — never handed out to the connection accept budget.
    #[serde(default = "default_reserved_fds")]
    pub reserved_fds: u64,
    /// Seconds to wait for a handshake (VERSIONS through the final
    /// NETINFO) to complete before closing with `Timeout`.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Seconds to wait for an outbound proxy CONNECT/SOCKS exchange to
    /// complete before closing with `Timeout`.
    #[serde(default = "default_proxy_timeout_secs")]
    pub proxy_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            reserved_fds: default_reserved_fds(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            proxy_timeout_secs: default_proxy_timeout_secs(),
        }
    }
}

fn default_reserved_fds() -> u64 {
    64
}

fn default_handshake_timeout_secs() -> u64 {
    60
}

fn default_proxy_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = LimitsConfig::default();
        assert!(cfg.reserved_fds > 0);
        assert!(cfg.handshake_timeout_secs > 0);
    }

    #[test]
    fn deserializes_with_partial_overrides() {
        let toml_str = "handshake_timeout_secs = 10";
        let cfg: LimitsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.handshake_timeout_secs, 10);
        assert_eq!(cfg.reserved_fds, default_reserved_fds());
    }
}
