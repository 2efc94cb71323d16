//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::Config;
use std::path::Path;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.nickname is required")]
    MissingNickname,
    #[error("server.identity_key_path does not exist: {0}")]
    IdentityKeyNotFound(String),
    #[error("ports must contain at least one listener")]
    NoPorts,
    #[error("or-port listener requires tls.cert_path/key_path")]
    OrPortMissingTls,
    #[error("tls.cert_path does not exist: {0}")]
    TlsCertNotFound(String),
    #[error("tls.key_path does not exist: {0}")]
    TlsKeyNotFound(String),
    #[error("unix socket listener requires unix_path")]
    UnixPortMissingPath,
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.nickname.is_empty() {
        errors.push(ValidationError::MissingNickname);
    }
    if !Path::new(&config.server.identity_key_path).exists() {
        errors.push(ValidationError::IdentityKeyNotFound(
            config.server.identity_key_path.display().to_string(),
        ));
    }
    if config.ports.is_empty() {
        errors.push(ValidationError::NoPorts);
    }

    for port in &config.ports {
        if port.is_unix() && port.unix_path.as_ref().map(|p| p.as_os_str().is_empty()).unwrap_or(true) {
            errors.push(ValidationError::UnixPortMissingPath);
        }
        if port.kind == super::ListenKind::Or {
            match &port.tls {
                None => errors.push(ValidationError::OrPortMissingTls),
                Some(tls) => {
                    if !tls.cert_path.exists() {
                        errors.push(ValidationError::TlsCertNotFound(
                            tls.cert_path.display().to_string(),
                        ));
                    }
                    if !tls.key_path.exists() {
                        errors.push(ValidationError::TlsKeyNotFound(
                            tls.key_path.display().to_string(),
                        ));
                    }
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
