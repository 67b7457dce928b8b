//! Server acceptor: owns the listener, numbers connections, spawns one
//! engine per accepted stream and coordinates graceful stop.

use crate::conn::{serve_conn, ClientStream, ConnShared};
use crate::metrics::Metrics;
use crate::route::RouteMux;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Hook run for every accepted transport before any LDAP traffic. A
/// returned error closes the connection without an LDAP message.
pub type NewConnectionHook = Arc<dyn Fn(SocketAddr) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct ServerConfig {
    routes: Option<Arc<RouteMux>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    tls: Option<Arc<rustls::ServerConfig>>,
    on_new_connection: Option<NewConnectionHook>,
}

struct ServerInner {
    config: Mutex<ServerConfig>,
    stop: CancellationToken,
    accept_done: CancellationToken,
    serving: AtomicBool,
    conns: TaskTracker,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

/// An LDAP server. Cheap to clone; clones share the same state, so one
/// handle can serve while another stops.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config: Mutex::new(ServerConfig::default()),
                stop: CancellationToken::new(),
                accept_done: CancellationToken::new(),
                serving: AtomicBool::new(false),
                conns: TaskTracker::new(),
                next_id: AtomicU64::new(0),
                metrics: Arc::new(Metrics::new()),
            }),
        }
    }

    fn config(&self) -> std::sync::MutexGuard<'_, ServerConfig> {
        self.inner.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install the route table serving this server's requests.
    pub fn handle(&self, routes: RouteMux) {
        self.config().routes = Some(Arc::new(routes));
    }

    /// Optional per-read deadline, refreshed on each read cycle. Expiry
    /// while the server is not shutting down tears the connection down.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.config().read_timeout = timeout;
    }

    /// Optional per-write deadline applied by the serializer.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.config().write_timeout = timeout;
    }

    /// TLS configuration used for ldaps:// listeners and StartTLS upgrades.
    pub fn set_tls_config(&self, config: Arc<rustls::ServerConfig>) {
        self.config().tls = Some(config);
    }

    /// Hook invoked before any LDAP traffic on a new connection.
    pub fn on_new_connection<F>(&self, hook: F)
    where
        F: Fn(SocketAddr) -> Result<()> + Send + Sync + 'static,
    {
        self.config().on_new_connection = Some(Arc::new(hook));
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Listen on `addr` and serve. Accepts `ldap://host:port`,
    /// `ldaps://host:port` or a bare `host:port`; ldaps requires a TLS
    /// config to be set.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<()> {
        let (addr, ldaps) = parse_listen_url(addr)?;
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!("Listening on {}", addr);
        if ldaps {
            self.serve_tls(listener).await
        } else {
            self.serve(listener).await
        }
    }

    /// Serve cleartext LDAP on an existing listener. StartTLS is available
    /// when a TLS config is set.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.accept_loop(listener, false).await
    }

    /// Serve LDAP over TLS from the first byte (LDAPS) on an existing
    /// listener.
    pub async fn serve_tls(&self, listener: TcpListener) -> Result<()> {
        self.accept_loop(listener, true).await
    }

    async fn accept_loop(&self, listener: TcpListener, tls_mode: bool) -> Result<()> {
        let (shared, hook) = {
            let config = self.config();
            if tls_mode && config.tls.is_none() {
                bail!("serve_tls requires a TLS config");
            }
            let shared = Arc::new(ConnShared {
                routes: config.routes.clone().unwrap_or_else(|| Arc::new(RouteMux::new())),
                read_timeout: config.read_timeout,
                write_timeout: config.write_timeout,
                tls: config.tls.clone(),
                stop: self.inner.stop.clone(),
                metrics: Arc::clone(&self.inner.metrics),
            });
            (shared, config.on_new_connection.clone())
        };
        self.inner.serving.store(true, Ordering::SeqCst);

        loop {
            tokio::select! {
                _ = self.inner.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((sock, peer)) => {
                        self.accept_one(sock, peer, tls_mode, &shared, hook.as_ref());
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        // Unbind the port before reporting the accept loop done; stop()
        // waits on this, so the address is free when stop() returns.
        drop(listener);
        self.inner.accept_done.cancel();
        debug!("accept loop stopped");
        Ok(())
    }

    fn accept_one(
        &self,
        sock: TcpStream,
        peer: SocketAddr,
        tls_mode: bool,
        shared: &Arc<ConnShared>,
        hook: Option<&NewConnectionHook>,
    ) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.metrics.inc_connections();

        if let Some(hook) = hook {
            if let Err(e) = hook(peer) {
                warn!(client = id, %peer, "connection rejected by hook: {:#}", e);
                return;
            }
        }
        info!(client = id, %peer, "connection accepted");

        let shared = Arc::clone(shared);
        let _ = self.inner.conns.spawn(async move {
            let stream = if tls_mode {
                // The handshake runs on the connection task so a slow
                // client cannot stall the accept loop.
                let acceptor = match shared.tls.clone() {
                    Some(cfg) => TlsAcceptor::from(cfg),
                    None => return,
                };
                match acceptor.accept(sock).await {
                    Ok(tls_stream) => ClientStream::Tls(tls_stream),
                    Err(e) => {
                        error!(client = id, %peer, "TLS handshake failed: {}", e);
                        return;
                    }
                }
            } else {
                ClientStream::Tcp(sock)
            };
            serve_conn(id, stream, peer, shared).await;
            info!(client = id, "connection closed");
        });
    }

    /// Stop accepting, close the listener, notify every connection via the
    /// Notice of Disconnection and wait for their teardown. After this
    /// returns the listen port is unbound and new dials fail.
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        if self.inner.serving.load(Ordering::SeqCst) {
            self.inner.accept_done.cancelled().await;
        }
        info!("waiting for client connections to shut down");
        self.inner.conns.close();
        self.inner.conns.wait().await;
        info!("all client connections closed");
    }
}

/// Parse a listen address: `ldap://host:port`, `ldaps://host:port` or a
/// bare `host:port`. `ldap://:1389` binds all interfaces.
fn parse_listen_url(url: &str) -> Result<(SocketAddr, bool)> {
    let (rest, ldaps) = if let Some(rest) = url.strip_prefix("ldaps://") {
        (rest, true)
    } else if let Some(rest) = url.strip_prefix("ldap://") {
        (rest, false)
    } else if url.contains("://") {
        bail!("Invalid URL scheme, expected ldap:// or ldaps://");
    } else {
        (url, false)
    };

    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        return Ok((SocketAddr::from(([0, 0, 0, 0], 389)), ldaps));
    }
    if let Some(port) = rest.strip_prefix(':') {
        let port: u16 = port.parse().context("Invalid port number")?;
        return Ok((SocketAddr::from(([0, 0, 0, 0], port)), ldaps));
    }
    let addr = rest
        .parse()
        .with_context(|| format!("Failed to parse address: {}", rest))?;
    Ok((addr, ldaps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listen_url_ldap() {
        let (addr, ldaps) = parse_listen_url("ldap://127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert!(!ldaps);
    }

    #[test]
    fn parse_listen_url_ldaps() {
        let (addr, ldaps) = parse_listen_url("ldaps://0.0.0.0:636").unwrap();
        assert_eq!(addr.port(), 636);
        assert!(ldaps);
    }

    #[test]
    fn parse_listen_url_port_only() {
        let (addr, _) = parse_listen_url("ldap://:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
    }

    #[test]
    fn parse_listen_url_bare_addr() {
        let (addr, ldaps) = parse_listen_url("127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert!(!ldaps);
    }

    #[test]
    fn parse_listen_url_empty_defaults() {
        let (addr, _) = parse_listen_url("ldap://").unwrap();
        assert_eq!(addr.port(), 389);
    }

    #[test]
    fn parse_listen_url_with_slashes() {
        let (addr, _) = parse_listen_url("ldap:///127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
    }

    #[test]
    fn parse_listen_url_invalid() {
        assert!(parse_listen_url("http://127.0.0.1:1389").is_err());
        assert!(parse_listen_url("ldap://:99999").is_err());
        assert!(parse_listen_url("ldap://:abc").is_err());
        assert!(parse_listen_url("ldap://invalid:address").is_err());
    }
}
