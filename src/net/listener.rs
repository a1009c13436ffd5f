//! Bound listening socket plus the accept loop that feeds connections.
//!
//! Reload is modeled as (old listener, new config) -> new listener:
//! plaintext keeps the bound socket, TLS material is rebuilt from
//! scratch. A reload that cannot produce a working listener leaves the
//! old one serving.

use crate::capture::CaptureSession;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::net::connection::{AsyncStream, Connection};
use crate::net::tls;
use crate::state::AppState;
use socket2::{Domain, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

pub struct Listener {
    inner: TcpListener,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    upstream_tls: Option<(TlsConnector, rustls::pki_types::ServerName<'static>)>,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ProxyError::Listener(format!("cannot resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| ProxyError::Listener(format!("{host}:{port} resolves to nothing")))
}

/// Bind with an explicit, configurable accept backlog.
fn bind_socket(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
        .map_err(|e| ProxyError::Listener(format!("socket: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ProxyError::Listener(format!("reuse_address: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ProxyError::Listener(format!("nonblocking: {e}")))?;
    socket
        .bind(&addr.into())
        .map_err(|e| ProxyError::Listener(format!("bind {addr}: {e}")))?;
    socket
        .listen(backlog as i32)
        .map_err(|e| ProxyError::Listener(format!("listen {addr}: {e}")))?;
    TcpListener::from_std(socket.into())
        .map_err(|e| ProxyError::Listener(format!("register {addr}: {e}")))
}

fn upstream_tls(cfg: &Config) -> Result<Option<(TlsConnector, rustls::pki_types::ServerName<'static>)>> {
    match &cfg.tls {
        Some(tls_cfg) if tls_cfg.upstream_tls => {
            let connector = tls::build_connector(tls_cfg)?;
            let name = tls::server_name(&cfg.proxy.upstream_host)?;
            Ok(Some((connector, name)))
        }
        _ => Ok(None),
    }
}

impl Listener {
    pub fn build(cfg: &Config) -> Result<Self> {
        let acceptor = cfg.tls.as_ref().map(tls::build_acceptor).transpose()?;
        let upstream_tls = upstream_tls(cfg)?;
        let addr = resolve(&cfg.proxy.listen_host, cfg.proxy.listen_port)?;
        let inner = bind_socket(addr, cfg.proxy.backlog)?;
        Ok(Self {
            inner,
            addr,
            acceptor,
            upstream_tls,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr().unwrap_or(self.addr)
    }

    /// Build the successor listener for a new config. TLS material is
    /// validated before the old socket is touched, so a bad cert path
    /// hands the old listener back intact.
    pub fn rebuild(self, cfg: &Config) -> std::result::Result<Self, (Self, ProxyError)> {
        let acceptor = match cfg.tls.as_ref().map(tls::build_acceptor).transpose() {
            Ok(a) => a,
            Err(e) => return Err((self, e.into())),
        };
        let upstream_tls = match upstream_tls(cfg) {
            Ok(u) => u,
            Err(e) => return Err((self, e)),
        };
        let addr = match resolve(&cfg.proxy.listen_host, cfg.proxy.listen_port) {
            Ok(a) => a,
            Err(e) => return Err((self, e)),
        };

        if addr == self.addr {
            return Ok(Self {
                inner: self.inner,
                addr,
                acceptor,
                upstream_tls,
            });
        }

        // Different address: bind the new socket while the old one is
        // still serving, then let the old one drop.
        match bind_socket(addr, cfg.proxy.backlog) {
            Ok(inner) => Ok(Self {
                inner,
                addr,
                acceptor,
                upstream_tls,
            }),
            Err(e) => Err((self, e)),
        }
    }
}

enum Event {
    Shutdown,
    Reload,
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
}

/// Accept loop; transient accept errors and failed handshakes never
/// terminate it.
pub async fn run_accept_loop(
    mut listener: Listener,
    state: Arc<AppState>,
    mut reload_rx: mpsc::Receiver<()>,
) {
    info!(addr = %listener.local_addr(), "listening");

    loop {
        let event = tokio::select! {
            _ = state.shutdown.cancelled() => Event::Shutdown,
            Some(()) = reload_rx.recv() => Event::Reload,
            res = listener.inner.accept() => Event::Accepted(res),
        };

        match event {
            Event::Shutdown => break,
            Event::Reload => {
                let cfg = state.config();
                listener = match listener.rebuild(&cfg) {
                    Ok(next) => {
                        info!(addr = %next.local_addr(), "listener reloaded");
                        next
                    }
                    Err((old, e)) => {
                        error!(error = %e, "listener reload failed; keeping previous listener");
                        old
                    }
                };
            }
            Event::Accepted(Ok((stream, peer))) => {
                let acceptor = listener.acceptor.clone();
                let upstream_tls = listener.upstream_tls.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    handle_accept(stream, peer, acceptor, upstream_tls, state).await;
                });
            }
            Event::Accepted(Err(e)) => {
                warn!(error = %e, "accept failed");
            }
        }
    }

    info!("accept loop stopped");
}

async fn handle_accept(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    upstream_tls: Option<(TlsConnector, rustls::pki_types::ServerName<'static>)>,
    state: Arc<AppState>,
) {
    let conn_id = peer.to_string();
    let cfg = state.config();
    let filters = state.filters();

    // Dial the upstream first; a refused upstream closes the inbound
    // socket without spawning a relay.
    let upstream = match TcpStream::connect((cfg.proxy.upstream_host.as_str(), cfg.proxy.upstream_port)).await
    {
        Ok(s) => s,
        Err(e) => {
            warn!(
                conn_id = %conn_id,
                upstream = %format!("{}:{}", cfg.proxy.upstream_host, cfg.proxy.upstream_port),
                error = %e,
                "upstream dial failed; dropping inbound connection"
            );
            return;
        }
    };
    let upstream_addr = upstream.peer_addr().unwrap_or_else(|_| {
        SocketAddr::from(([0, 0, 0, 0], cfg.proxy.upstream_port))
    });

    let upstream: Box<dyn AsyncStream> = match upstream_tls {
        Some((connector, name)) => match connector.connect(name, upstream).await {
            Ok(s) => Box::new(s),
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "upstream TLS handshake failed");
                return;
            }
        },
        None => Box::new(upstream),
    };

    let client: Box<dyn AsyncStream> = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(s) => Box::new(s),
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "TLS handshake failed");
                return;
            }
        },
        None => Box::new(stream),
    };

    let capture = state
        .capture
        .as_ref()
        .map(|writer| CaptureSession::new(writer.clone(), peer, upstream_addr, &conn_id));

    let guard = state.track_connection();
    let connection = Connection::new(
        conn_id,
        filters,
        state.sessions.clone(),
        capture,
        cfg.proxy.idle_timeout_secs.map(Duration::from_secs),
    );
    connection
        .run(client, upstream, state.shutdown.clone())
        .await;
    drop(guard);
}
