//! Configuration loading and management.
//!
//! Split into logical submodules:
//! - [`types`]: top-level `Config` and `ServerConfig`.
//! - [`listen`]: per-port listener configuration (`PortConfig`, `TlsConfig`).
//! - [`bandwidth`]: token-bucket sizing (`BandwidthConfig`).
//! - [`proxy`]: outbound proxy configuration (`ProxyConfig`).
//! - [`limits`]: resource limits (`LimitsConfig`).
//! - [`validation`]: startup sanity checks over the assembled `Config`.

mod bandwidth;
mod limits;
mod listen;
mod proxy;
mod types;
mod validation;

pub use bandwidth::BandwidthConfig;
pub use limits::LimitsConfig;
pub use listen::{ListenKind, PortConfig, PortSpec, TlsConfig};
pub use proxy::{ProxyConfig, ProxyKind};
pub use types::{Config, ServerConfig};
pub use validation::{validate, ValidationError};

use std::path::Path;
use thiserror::Error;

/// Errors encountered while loading configuration from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load and parse configuration from a TOML file. Does not validate;
/// callers should run [`validate`] afterward.
pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&text)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_is_io_error() {
        let err = load("/nonexistent/orlinkd.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
