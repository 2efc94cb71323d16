//! orlinkd - OR-link connection engine binary.
//!
//! Loads configuration, stands up the listener set, and runs the
//! supervisory tasks (bandwidth tick, identity badness sweep, broken-
//! handshake reporting, metrics endpoint) until the process is killed.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use orlinkd::config::{self, Config, PortSpec};
use orlinkd::fd_budget::FdBudget;
use orlinkd::network::connection::handshake::LocalIdentity;
use orlinkd::network::connection::ConnectionContext;
use orlinkd::network::ratelimit::TokenBuckets;
use orlinkd::network::Listener;
use orlinkd::or_link::broken_counter::{self, ProtocolBrokenCounter};
use orlinkd::or_link::registry::OrLinkRegistry;
use tracing::{error, info, warn};

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `orlinkd.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "orlinkd.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path();

    let config = config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: failed to load config from {}: {}", config_path, e);
        e
    })?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            error!(error = %err, "configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    info!(nickname = %config.server.nickname, "starting orlinkd");

    // rustls 0.23 requires a process-level CryptoProvider before the first
    // `ServerConfig::builder()` call (see Listener::build_tls_acceptor).
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("a CryptoProvider was already installed; continuing with it");
    }

    let local_identity = Arc::new(load_local_identity(&config)?);
    info!(
        identity = %hex_digest(&local_identity.identity_digest),
        "loaded relay identity"
    );

    let fd_budget = Arc::new(FdBudget::from_rlimit(config.limits.reserved_fds)?);
    info!(capacity = fd_budget.capacity(), "file descriptor budget initialized");

    let (global_rate, global_burst) = config.bandwidth.effective_global();
    let (relayed_rate, relayed_burst) = config.bandwidth.effective_relayed();
    let buckets = Arc::new(parking_lot::Mutex::new(TokenBuckets::new(
        global_rate,
        global_burst,
        relayed_rate,
        relayed_burst,
    )));
    let registry = Arc::new(OrLinkRegistry::new());
    let broken_counter = Arc::new(ProtocolBrokenCounter::new());
    let config = Arc::new(config);

    let ctx = ConnectionContext {
        config: config.clone(),
        registry: registry.clone(),
        buckets: buckets.clone(),
        broken_counter: broken_counter.clone(),
    };

    let our_addrs = Arc::new(advertised_addrs(&config));

    let mut listener = Listener::new(ctx, local_identity, our_addrs, fd_budget);
    listener.reconcile(&config.ports).await?;
    for (kind, addr) in listener.bound_addrs() {
        info!(?kind, %addr, "listening");
    }

    // Bandwidth-bucket refill tick (§4.3).
    {
        let buckets = buckets.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orlinkd::network::ratelimit::TICK);
            loop {
                ticker.tick().await;
                buckets.lock().tick();
            }
        });
    }

    // Periodic identity-badness sweep (§4.7 `set_bad_connections`).
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                registry.set_bad_connections();
            }
        });
    }

    broken_counter::spawn_reporter(broken_counter);

    orlinkd::metrics::init();
    let metrics_port = config.server.metrics_port;
    if metrics_port == 0 {
        info!("metrics endpoint disabled");
    } else {
        tokio::spawn(async move {
            orlinkd::metrics::serve(metrics_port).await;
        });
    }

    // Park the main task; the listener accept loops and supervisory tasks
    // above carry the process. Reconciliation has no running-config state
    // to persist on the way out, so SIGINT/SIGTERM just end the process.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    Ok(())
}

/// Load this relay's RSA identity key from `identity_key_path` and derive
/// its 20-byte identity digest (§4.7: SHA-1 of the DER-encoded public
/// key). The auth key used to sign AUTHENTICATE cells is generated fresh
/// at each startup: the engine has no persistence layer for a
/// medium-term auth key, so there is nothing to gain by pinning one
/// across restarts (see DESIGN.md).
fn load_local_identity(config: &Config) -> anyhow::Result<LocalIdentity> {
    use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    let pem = std::fs::read_to_string(&config.server.identity_key_path)?;
    let identity_private_key = RsaPrivateKey::from_pkcs8_pem(&pem).or_else(|_| {
        use rsa::pkcs1::DecodeRsaPrivateKey;
        RsaPrivateKey::from_pkcs1_pem(&pem)
    })?;
    let identity_public_key = RsaPublicKey::from(&identity_private_key);
    let identity_cert_der = identity_public_key.to_public_key_der()?.as_bytes().to_vec();
    let identity_digest = {
        use sha1::{Digest, Sha1};
        let digest = Sha1::digest(&identity_cert_der);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    };

    let mut rng = rand::thread_rng();
    let auth_private_key = RsaPrivateKey::new(&mut rng, 2048)?;
    let auth_public_key = RsaPublicKey::from(&auth_private_key);
    let auth_cert_der = auth_public_key.to_public_key_der()?.as_bytes().to_vec();

    Ok(LocalIdentity {
        identity_digest,
        identity_private_key,
        identity_cert_der,
        auth_private_key,
        auth_cert_der,
    })
}

/// Addresses this relay advertises to peers in NETINFO (§4.7), derived
/// from whatever non-wildcard addresses its OR ports are configured to
/// bind on. A relay listening only on `0.0.0.0`/`::` advertises nothing;
/// an operator who wants a specific advertised address should bind the
/// OR port to it explicitly rather than a wildcard.
fn advertised_addrs(config: &Config) -> Vec<IpAddr> {
    config
        .ports
        .iter()
        .filter(|p| p.kind == orlinkd::config::ListenKind::Or)
        .filter(|p| matches!(p.port, PortSpec::Fixed(_) | PortSpec::Auto))
        .filter_map(|p| p.address.parse::<IpAddr>().ok())
        .filter(|ip| !ip.is_unspecified())
        .collect()
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
