//! Per-endpoint proxy listeners
//!
//! Each registered (ip, port) runs one [`ProxyListener`]. The listener
//! reads its [`Route`] through a shared cell on every connection (and, for
//! HTTP, on every request), so retargeting never touches sockets already
//! dialed.
//!
//! ```text
//! accept ──> tls/https? ──yes──> TLS handshake (CA leaf, h2 + http/1.1)
//!                │                      │
//!                no                     │
//!                ▼                      ▼
//!           http/https? ──yes──> hyper auto server ──> Upstream::forward
//!                │
//!                no
//!                ▼
//!           Upstream::connect ──> relay (half-close, idle timeout)
//! ```
//!
//! Stopping a listener fires its shutdown signal: the accept loop exits
//! and every connection it accepted is dropped, relays and upgraded
//! connections included. TLS handshakes, backend dials and idle relays
//! are all bounded by timeouts.

use crate::ca::CertificateAuthority;
use crate::error::{error_response, FrontendError};
use crate::relay::relay;
use crate::target::{Route, Scheme};
use crate::upstream::Upstream;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded port
const X_FORWARDED_PORT: &str = "x-forwarded-port";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Route cell shared between the registry (writer) and a listener
pub type SharedRoute = Arc<RwLock<Route>>;

/// Where terminating listeners get their server certificate
#[derive(Clone)]
pub enum TlsSource {
    /// Leaf issued by the in-memory CA for the listener's host
    Authority(Arc<CertificateAuthority>),
    /// Fixed configuration, e.g. loaded from PEM files
    Fixed(Arc<ServerConfig>),
}

impl TlsSource {
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, FrontendError> {
        match self {
            TlsSource::Authority(ca) => ca.server_config(host),
            TlsSource::Fixed(config) => Ok(Arc::clone(config)),
        }
    }
}

/// Everything a listener needs besides its route
pub struct ProxyContext {
    pub tls: TlsSource,
    pub upstream: Upstream,
    pub handshake_timeout: Duration,
}

/// What a connection knows about itself
#[derive(Debug, Clone)]
struct ConnInfo {
    peer: SocketAddr,
    listen_port: u16,
    alpn: Option<Vec<u8>>,
}

/// Control handle for a running listener
pub struct ProxyHandle {
    host: String,
    route: SharedRoute,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the current route
    pub fn route(&self) -> Route {
        self.route.read().clone()
    }

    /// Point new connections at `route`
    pub fn set_route(&self, route: Route) {
        *self.route.write() = route;
    }

    /// Close the listener and every connection it accepted, waiting up to
    /// `timeout` for the accept loop to finish
    pub async fn stop(mut self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(host = %self.host, addr = %self.local_addr, "Listener did not stop in time, aborting");
                abort.abort();
            }
        }

        debug!(host = %self.host, addr = %self.local_addr, "Listener stopped");
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub struct ProxyListener {
    listener: TcpListener,
    host: Arc<str>,
    route: SharedRoute,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyListener {
    /// Bind `addr` and start serving `route` in the background
    pub async fn start(
        addr: SocketAddr,
        host: &str,
        route: Route,
        ctx: Arc<ProxyContext>,
    ) -> Result<ProxyHandle, FrontendError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FrontendError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| FrontendError::Bind { addr, source })?;

        let route = Arc::new(RwLock::new(route));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let proxy = ProxyListener {
            listener,
            host: Arc::from(host),
            route: Arc::clone(&route),
            ctx,
            shutdown_rx,
        };
        let task = tokio::spawn(proxy.serve());

        Ok(ProxyHandle {
            host: host.to_string(),
            route,
            local_addr,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Accept until the shutdown signal fires
    pub async fn serve(self) {
        let local_addr = match self.listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(host = %self.host, error = %e, "Listener has no local address");
                return;
            }
        };
        let route = self.route.read().to_string();
        info!(host = %self.host, addr = %local_addr, route = %route, "Proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let host = Arc::clone(&self.host);
                            let route = Arc::clone(&self.route);
                            let ctx = Arc::clone(&self.ctx);
                            let shutdown_rx = self.shutdown_rx.clone();

                            tokio::spawn(async move {
                                handle_connection(stream, peer, local_addr.port(), host, route, ctx, shutdown_rx).await;
                            });
                        }
                        Err(e) => {
                            error!(host = %self.host, error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(host = %self.host, addr = %local_addr, "Proxy shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Resolves once `rx` reports shutdown or its sender is gone
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    listen_port: u16,
    host: Arc<str>,
    route: SharedRoute,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let scheme = route.read().scheme;
    debug!(host = %host, peer = %peer, scheme = %scheme, "Accepted connection");

    if !scheme.terminates_tls() {
        let info = ConnInfo {
            peer,
            listen_port,
            alpn: None,
        };
        serve_stream(stream, info, scheme, route, ctx, shutdown_rx).await;
        return;
    }

    let config = match ctx.tls.server_config(&host) {
        Ok(config) => config,
        Err(e) => {
            error!(host = %host, error = %e, "No certificate for listener");
            return;
        }
    };

    let acceptor = TlsAcceptor::from(config);
    let tls = match tokio::time::timeout(ctx.handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            debug!(host = %host, peer = %peer, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            debug!(host = %host, peer = %peer, "TLS handshake timed out");
            return;
        }
    };

    let info = ConnInfo {
        peer,
        listen_port,
        alpn: tls.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
    };
    serve_stream(tls, info, scheme, route, ctx, shutdown_rx).await;
}

async fn serve_stream<S>(
    stream: S,
    info: ConnInfo,
    scheme: Scheme,
    route: SharedRoute,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if scheme.is_http() {
        serve_http(stream, info, scheme, route, ctx, shutdown_rx).await;
    } else {
        let route = route.read().clone();
        serve_relay(stream, info, route, ctx, shutdown_rx).await;
    }
}

async fn serve_relay<S>(
    mut client: S,
    info: ConnInfo,
    route: Route,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let backend = match ctx.upstream.connect(&route, info.alpn.as_deref()).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!(peer = %info.peer, route = %route, error = %e, "Failed to reach backend");
            let _ = client.write_all(format!("error: {}\n", e).as_bytes()).await;
            let _ = client.shutdown().await;
            return;
        }
    };

    let backend_peer = backend.peer;
    match relay(client, backend.stream, ctx.upstream.idle_timeout(), shutdown_rx).await {
        Ok(stats) => debug!(
            peer = %info.peer,
            backend = %backend_peer,
            client_to_backend = stats.client_to_backend,
            backend_to_client = stats.backend_to_client,
            "Relay finished"
        ),
        Err(e) => debug!(peer = %info.peer, backend = %backend_peer, error = %e, "Relay ended"),
    }
}

async fn serve_http<S>(
    stream: S,
    info: ConnInfo,
    scheme: Scheme,
    route: SharedRoute,
    ctx: Arc<ProxyContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let peer = info.peer;
    let info = Arc::new(info);
    let request_shutdown = shutdown_rx.clone();

    let service = service_fn(move |req: Request<Incoming>| {
        let info = Arc::clone(&info);
        let route = Arc::clone(&route);
        let ctx = Arc::clone(&ctx);
        let shutdown_rx = request_shutdown.clone();
        async move { handle_request(req, info, scheme, route, ctx, shutdown_rx).await }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Connection error");
            }
        }
        _ = shutdown_signal(&mut shutdown_rx) => {
            debug!(peer = %peer, "Closing connection, endpoint shut down");
        }
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    info: Arc<ConnInfo>,
    scheme: Scheme,
    route: SharedRoute,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let route = route.read().clone();
    let request_id = inject_forwarded_headers(req.headers_mut(), info.peer, info.listen_port, scheme);

    debug!(method = %req.method(), uri = %req.uri(), route = %route, request_id, "Incoming request");

    match ctx
        .upstream
        .forward(req, &route, info.alpn.as_deref(), shutdown_rx)
        .await
    {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!(route = %route, request_id, error = %e, "Failed to forward request");
            Ok(error_response(&e))
        }
    }
}

/// Overwrite the `X-Forwarded-*` headers and add `X-Request-ID` when
/// absent; returns the request id
///
/// Client-supplied forwarding headers are replaced rather than appended:
/// this proxy is the first trusted hop.
pub fn inject_forwarded_headers(
    headers: &mut HeaderMap,
    peer: SocketAddr,
    listen_port: u16,
    scheme: Scheme,
) -> String {
    let request_id = headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(X_FORWARDED_PORT, HeaderValue::from(listen_port));
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));

    request_id
}
