//! Standalone edge balancer
//!
//! Each configured listener either answers every request with a 301 to a
//! target URL, or proxies to one fixed `host:port` through the same engine
//! the endpoint listeners use (minus the workload locator).

use crate::ca::{CertificateAuthority, SERVER_ALPN};
use crate::config::{BalancerConfig, BalancerListenerConfig, BalancerMode, ProxyConfig};
use crate::error::{error_response, FrontendError};
use crate::proxy::{ProxyContext, ProxyHandle, ProxyListener, TlsSource};
use crate::target::{Route, Scheme};
use crate::upstream::Upstream;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HOST, LOCATION};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Build the `Location` for a redirect target
///
/// Scheme, host and port come from `target`; an empty host falls back to
/// the request host (without its port). `*` in the target path is replaced
/// by the request path, an empty target path keeps the request path, and
/// the request query is carried over.
pub fn redirect_location(
    target: &str,
    request_host: Option<&str>,
    path: &str,
    query: Option<&str>,
) -> Result<String, FrontendError> {
    let (scheme, rest) = target
        .split_once("://")
        .filter(|(scheme, _)| !scheme.is_empty())
        .ok_or_else(|| FrontendError::InvalidTarget(target.to_string()))?;

    let (authority, target_path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    let (host, port) = split_authority(authority);
    let host = if host.is_empty() {
        request_host
            .map(|h| split_authority(h).0)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FrontendError::InvalidHost("request has no host".to_string()))?
    } else {
        host
    };

    let path = if path.is_empty() { "/" } else { path };
    let new_path = if target_path.is_empty() {
        path.to_string()
    } else {
        target_path
            .replace("/*", path)
            .replace('*', path.trim_start_matches('/'))
    };

    let mut location = format!("{}://{}", scheme, host);
    if let Some(port) = port {
        location.push(':');
        location.push_str(port);
    }
    location.push_str(&new_path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        location.push('?');
        location.push_str(query);
    }
    Ok(location)
}

/// Split `host[:port]`, keeping IPv6 brackets on the host
fn split_authority(authority: &str) -> (&str, Option<&str>) {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => {
                let (host, rest) = authority.split_at(end + 1);
                (host, rest.strip_prefix(':').filter(|p| !p.is_empty()))
            }
            None => (authority, None),
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() => (host, Some(port)),
        Some((host, _)) => (host, None),
        None => (authority, None),
    }
}

fn redirect_response(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .unwrap_or_else(|e| {
            error_response(&FrontendError::InvalidTarget(format!("{}: {}", location, e)))
        })
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}

/// Certificate source for a listener: PEM files when configured, otherwise
/// a leaf from `ca`
fn tls_source(
    listener: &BalancerListenerConfig,
    ca: &Arc<CertificateAuthority>,
) -> anyhow::Result<TlsSource> {
    match (&listener.tls_cert, &listener.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            let mut config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
            config.alpn_protocols = SERVER_ALPN.iter().map(|p| p.to_vec()).collect();
            info!(cert = %cert_path, key = %key_path, bind = %listener.bind, "Loaded balancer certificate");
            Ok(TlsSource::Fixed(Arc::new(config)))
        }
        _ => Ok(TlsSource::Authority(Arc::clone(ca))),
    }
}

/// A running balancer listener
pub enum BalancerListener {
    Redirect {
        local_addr: SocketAddr,
        shutdown_tx: watch::Sender<bool>,
        task: JoinHandle<()>,
    },
    Proxy(ProxyHandle),
}

impl BalancerListener {
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            BalancerListener::Redirect { local_addr, .. } => *local_addr,
            BalancerListener::Proxy(handle) => handle.local_addr(),
        }
    }

    pub async fn stop(self, timeout: Duration) {
        match self {
            BalancerListener::Redirect {
                shutdown_tx, task, ..
            } => {
                let _ = shutdown_tx.send(true);
                let abort = task.abort_handle();
                if tokio::time::timeout(timeout, task).await.is_err() {
                    abort.abort();
                }
            }
            BalancerListener::Proxy(handle) => handle.stop(timeout).await,
        }
    }
}

/// All listeners of one balancer process
pub struct Balancer {
    listeners: Vec<BalancerListener>,
    stop_timeout: Duration,
}

impl Balancer {
    /// Bind and start every configured listener
    pub async fn start(config: &BalancerConfig, proxy: &ProxyConfig) -> anyhow::Result<Self> {
        let ca = Arc::new(CertificateAuthority::generate()?);
        let mut listeners = Vec::with_capacity(config.listeners.len());

        for listener in &config.listeners {
            let started = start_listener(listener, proxy, &ca).await;
            match started {
                Ok(started) => listeners.push(started),
                Err(e) => {
                    for running in listeners {
                        running.stop(proxy.stop_timeout()).await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            listeners,
            stop_timeout: proxy.stop_timeout(),
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local_addr()).collect()
    }

    pub async fn stop(self) {
        for listener in self.listeners {
            listener.stop(self.stop_timeout).await;
        }
    }
}

async fn start_listener(
    listener: &BalancerListenerConfig,
    proxy: &ProxyConfig,
    ca: &Arc<CertificateAuthority>,
) -> anyhow::Result<BalancerListener> {
    let addr: SocketAddr = listener
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid balancer bind '{}': {}", listener.bind, e))?;
    let scheme: Scheme = listener.scheme.parse()?;
    let tls = tls_source(listener, ca)?;

    match listener.mode {
        BalancerMode::Proxy => {
            let route = Route::parse(&listener.target, Some(scheme))?;
            let ctx = Arc::new(ProxyContext {
                tls,
                upstream: Upstream::new(None, proxy.connect_timeout(), proxy.idle_timeout()),
                handshake_timeout: proxy.handshake_timeout(),
            });
            let handle = ProxyListener::start(addr, &listener.hostname, route, ctx).await?;
            Ok(BalancerListener::Proxy(handle))
        }
        BalancerMode::Redirect => {
            if !scheme.is_http() {
                anyhow::bail!(
                    "Balancer listener {} redirects but its scheme is {}",
                    listener.bind,
                    scheme
                );
            }
            // reject unusable targets before accepting anything
            redirect_location(&listener.target, Some(&listener.hostname), "/", None)?;

            let acceptor = if scheme.terminates_tls() {
                Some(TlsAcceptor::from(tls.server_config(&listener.hostname)?))
            } else {
                None
            };

            let tcp = TcpListener::bind(addr)
                .await
                .map_err(|source| FrontendError::Bind { addr, source })?;
            let local_addr = tcp.local_addr()?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let server = RedirectServer {
                listener: tcp,
                target: Arc::from(listener.target.as_str()),
                tls_acceptor: acceptor,
                handshake_timeout: proxy.handshake_timeout(),
                shutdown_rx,
            };
            let task = tokio::spawn(server.serve());

            Ok(BalancerListener::Redirect {
                local_addr,
                shutdown_tx,
                task,
            })
        }
    }
}

struct RedirectServer {
    listener: TcpListener,
    target: Arc<str>,
    tls_acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl RedirectServer {
    async fn serve(self) {
        let local_addr = match self.listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "Redirect listener has no local address");
                return;
            }
        };
        info!(addr = %local_addr, redirect = %self.target, "Redirect listener started");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let target = Arc::clone(&self.target);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let handshake_timeout = self.handshake_timeout;
                            let mut conn_shutdown = self.shutdown_rx.clone();

                            tokio::spawn(async move {
                                let served = async move {
                                    match tls_acceptor {
                                        Some(acceptor) => {
                                            match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                                                Ok(Ok(tls)) => serve_redirect(tls, target).await,
                                                Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                                                Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
                                            }
                                        }
                                        None => serve_redirect(stream, target).await,
                                    }
                                };
                                tokio::select! {
                                    _ = served => {}
                                    _ = conn_shutdown.wait_for(|stop| *stop) => {}
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept redirect connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(addr = %local_addr, "Redirect listener shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn serve_redirect<S>(stream: S, target: Arc<str>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let target = Arc::clone(&target);
        async move {
            let host = req
                .headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .or_else(|| req.uri().authority().map(|a| a.as_str()));
            let response = match redirect_location(&target, host, req.uri().path(), req.uri().query()) {
                Ok(location) => {
                    debug!(location = %location, "Redirecting");
                    redirect_response(&location)
                }
                Err(e) => error_response(&e),
            };
            Ok::<_, hyper::Error>(response)
        }
    });

    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
    {
        debug!(error = %e, "Redirect connection error");
    }
}
