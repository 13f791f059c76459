//! Dialing backends and forwarding HTTP requests to them
//!
//! Every connection (or HTTP request) resolves its target when it is
//! dialed, so a retargeted route takes effect for the next dial while
//! connections already established keep their backend.

use crate::ca::backend_client_config;
use crate::error::FrontendError;
use crate::locator::{choose_instance, BoxedStream, SharedLocator};
use crate::relay::relay;
use crate::target::{Route, Scheme, Target};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// An established backend connection
pub struct BackendConn {
    pub stream: BoxedStream,
    /// Protocol the backend selected during its TLS handshake
    pub alpn: Option<Vec<u8>>,
    pub peer: String,
}

/// Dials route targets, through the locator for backend references
#[derive(Clone)]
pub struct Upstream {
    locator: Option<SharedLocator>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl Upstream {
    pub fn new(locator: Option<SharedLocator>, connect_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            locator,
            connect_timeout,
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Open a plain stream to the current target
    async fn dial(&self, target: &Target) -> Result<(BoxedStream, String), FrontendError> {
        match target {
            Target::Static { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| FrontendError::Backend(format!("{}: {}", target, e)))?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), target.to_string()))
            }
            Target::Backend { app, name, port, .. } => {
                let locator = self
                    .locator
                    .as_ref()
                    .ok_or_else(|| FrontendError::NoBackend(target.label()))?;

                let instances = locator.list_instances(app, name).await?;
                let instance = choose_instance(&instances)
                    .ok_or_else(|| FrontendError::NoBackend(target.label()))?;

                match instance.ip {
                    Some(ip) => {
                        let addr = SocketAddr::new(ip, *port);
                        let stream = TcpStream::connect(addr)
                            .await
                            .map_err(|e| FrontendError::Backend(format!("{}: {}", addr, e)))?;
                        let _ = stream.set_nodelay(true);
                        Ok((Box::new(stream), addr.to_string()))
                    }
                    None => {
                        let stream = locator.open_backend_stream(app, &instance.id, *port).await?;
                        Ok((stream, format!("{}/{}:{}", app, instance.id, port)))
                    }
                }
            }
        }
    }

    async fn dial_tls(
        &self,
        target: &Target,
        alpn: Option<&[u8]>,
    ) -> Result<BackendConn, FrontendError> {
        let (stream, peer) = self.dial(target).await?;

        let server_name = match target {
            Target::Static { host, .. } => host.clone(),
            Target::Backend { app, name, .. } => format!("{}.{}", name, app),
        };
        let server_name = ServerName::try_from(server_name)
            .map_err(|e| FrontendError::Backend(format!("invalid server name: {}", e)))?;

        let connector = TlsConnector::from(backend_client_config(alpn));
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| FrontendError::Backend(format!("TLS handshake with {} failed: {}", peer, e)))?;

        let alpn = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
        Ok(BackendConn {
            stream: Box::new(tls),
            alpn,
            peer,
        })
    }

    /// Connect for `route`: over TLS when the listener terminates TLS,
    /// offering `alpn` to the backend
    pub async fn connect(&self, route: &Route, alpn: Option<&[u8]>) -> Result<BackendConn, FrontendError> {
        let dial = async {
            if route.scheme.terminates_tls() {
                self.dial_tls(&route.target, alpn).await
            } else {
                let (stream, peer) = self.dial(&route.target).await?;
                Ok::<_, FrontendError>(BackendConn {
                    stream,
                    alpn: None,
                    peer,
                })
            }
        };

        match tokio::time::timeout(self.connect_timeout, dial).await {
            Ok(result) => result,
            Err(_) => Err(FrontendError::Timeout(format!(
                "dialing {} took longer than {}s",
                route.target,
                self.connect_timeout.as_secs()
            ))),
        }
    }

    /// Forward one HTTP request to a freshly dialed backend
    ///
    /// `client_alpn` is what the client negotiated with us; HTTP/2 is used
    /// towards the backend when the backend agrees to it (TLS) or when
    /// the client spoke it in cleartext. Upgraded connections are relayed
    /// until `shutdown` fires.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        route: &Route,
        client_alpn: Option<&[u8]>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, FrontendError> {
        let upgrade = is_upgrade_request(&req);
        let wants_h2 = !upgrade
            && match route.scheme {
                Scheme::Https => client_alpn == Some(b"h2".as_slice()),
                _ => req.version() == Version::HTTP_2,
            };

        let offer: &[u8] = if wants_h2 { b"h2" } else { b"http/1.1" };
        let conn = self.connect(route, Some(offer)).await?;

        let http2 = match route.scheme {
            Scheme::Https => conn.alpn.as_deref() == Some(b"h2".as_slice()),
            _ => wants_h2,
        };

        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));
        let req = rewrite_request(req, route, http2, upgrade)?;

        debug!(
            backend = %conn.peer,
            method = %req.method(),
            uri = %req.uri(),
            http2,
            "Forwarding request"
        );

        let peer = conn.peer.clone();
        let backend_err = move |e: hyper::Error| FrontendError::Backend(format!("{}: {}", peer, e));
        let io = TokioIo::new(conn.stream);

        let mut response = if http2 {
            let (mut sender, connection) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
                    .await
                    .map_err(&backend_err)?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!(error = %e, "Backend HTTP/2 connection closed with error");
                }
            });
            sender.send_request(req).await.map_err(&backend_err)?
        } else {
            let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(&backend_err)?;
            tokio::spawn(async move {
                if let Err(e) = connection.with_upgrades().await {
                    debug!(error = %e, "Backend HTTP/1 connection closed with error");
                }
            });
            sender.send_request(req).await.map_err(&backend_err)?
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                let idle = self.idle_timeout;
                tokio::spawn(async move {
                    match tokio::try_join!(client_upgrade, backend_upgrade) {
                        Ok((client, backend)) => {
                            let result =
                                relay(TokioIo::new(client), TokioIo::new(backend), idle, shutdown).await;
                            debug!(result = ?result, "Upgraded connection closed");
                        }
                        Err(e) => debug!(error = %e, "Connection upgrade failed"),
                    }
                });
            }
        } else {
            strip_hop_by_hop(response.headers_mut());
        }

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// `Connection: upgrade` plus an `Upgrade` header
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    for name in named.iter().map(String::as_str).chain(HOP_BY_HOP) {
        headers.remove(name);
    }
    headers.remove(hyper::header::UPGRADE);
}

/// Turn a client request into one a backend connection can send:
/// origin-form URI for HTTP/1.1, absolute URI without `Host` for HTTP/2
fn rewrite_request(
    req: Request<Incoming>,
    route: &Route,
    http2: bool,
    upgrade: bool,
) -> Result<Request<Incoming>, FrontendError> {
    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let authority = parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(String::from)
        })
        .unwrap_or_else(|| route.target.to_string());

    if !upgrade {
        strip_hop_by_hop(&mut parts.headers);
    }

    let invalid_uri = |e: hyper::http::uri::InvalidUri| {
        FrontendError::Internal(format!("cannot build backend request URI: {}", e))
    };

    if http2 {
        let scheme = if route.scheme.terminates_tls() { "https" } else { "http" };
        parts.uri = format!("{}://{}{}", scheme, authority, path)
            .parse()
            .map_err(invalid_uri)?;
        parts.headers.remove(HOST);
        parts.version = Version::HTTP_2;
    } else {
        if !parts.headers.contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&authority) {
                parts.headers.insert(HOST, value);
            }
        }
        parts.uri = path.parse().map_err(invalid_uri)?;
        parts.version = Version::HTTP_11;
    }

    Ok(Request::from_parts(parts, body))
}
