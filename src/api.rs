//! Control API
//!
//! | Method | Path                              | Form             | Response        |
//! |--------|-----------------------------------|------------------|-----------------|
//! | GET    | /endpoints                        |                  | `[Endpoint]`    |
//! | POST   | /endpoints/{host}                 | port, target     | `Endpoint`      |
//! | DELETE | /endpoints/{host}                 |                  | 204             |
//! | POST   | /endpoints/{host}/proxies/{port}  | scheme, target   | 204             |
//! | GET    | /health                           |                  | `{"status":..}` |
//! | GET    | /version                          |                  | name, version   |
//!
//! Form fields come from an urlencoded body or the query string; body
//! values win. Errors are JSON bodies with an `X-Proxy-Error` code.

use crate::error::{error_response, json_error_response, ErrorCode, FrontendError};
use crate::registry::EndpointRegistry;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Version information for the frontend
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

type ApiResponse = Response<BoxBody<Bytes, hyper::Error>>;

fn json_response(status: StatusCode, body: impl Serialize) -> ApiResponse {
    match serde_json::to_vec(&body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(bytes)).map_err(|never| match never {}).boxed())
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => json_error_response(ErrorCode::InternalError, e.to_string()),
    }
}

fn empty_response() -> ApiResponse {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// Decode `a=1&b=two+words` into a map; later keys win
pub fn parse_form(input: &str) -> HashMap<String, String> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(&key.replace('+', " ")).ok()?.into_owned();
            let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

/// Non-empty form field or a missing-parameter error
fn required<'a>(form: &'a HashMap<String, String>, name: &'static str) -> Result<&'a str, FrontendError> {
    form.get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or(FrontendError::MissingParameter(name))
}

fn parse_port(value: &str) -> Result<u16, FrontendError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(FrontendError::InvalidPort(value.to_string())),
    }
}

/// A routed request
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Version,
    ListEndpoints,
    CreateEndpoint(String),
    DeleteEndpoint(String),
    AttachProxy(String, String),
    NotFound,
}

fn route(method: &Method, path: &str) -> Route {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let decode = |s: &str| {
        urlencoding::decode(s)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| s.to_string())
    };

    match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Route::Health,
        (&Method::GET, ["version"]) => Route::Version,
        (&Method::GET, ["endpoints"]) => Route::ListEndpoints,
        (&Method::POST, ["endpoints", host]) => Route::CreateEndpoint(decode(host)),
        (&Method::DELETE, ["endpoints", host]) => Route::DeleteEndpoint(decode(host)),
        (&Method::POST, ["endpoints", host, "proxies", port]) => {
            Route::AttachProxy(decode(host), decode(port))
        }
        _ => Route::NotFound,
    }
}

/// HTTP(S) server in front of an [`EndpointRegistry`]
pub struct ControlApi {
    bind_addr: SocketAddr,
    registry: Arc<EndpointRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ControlApi {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<EndpointRegistry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Bind the listener; separate from [`serve`](Self::serve) so bind
    /// failures surface before startup completes
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind control API on {}: {}", self.bind_addr, e))
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %addr, protocol, "Control API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = serve_api_connection(tls_stream, registry).await {
                                                debug!(addr = %addr, error = %e, "Control API TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "Control API TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = serve_api_connection(stream, registry).await {
                                    debug!(addr = %addr, error = %e, "Control API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control API connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_api_connection<S>(stream: S, registry: Arc<EndpointRegistry>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        async move { handle_api_request(req, registry).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_api_request(
    req: Request<Incoming>,
    registry: Arc<EndpointRegistry>,
) -> Result<ApiResponse, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Control API request");

    let result = match route(&method, &path) {
        Route::Health => Ok(json_response(
            StatusCode::OK,
            serde_json::json!({ "status": "ok" }),
        )),
        Route::Version => Ok(json_response(
            StatusCode::OK,
            serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
        )),
        Route::ListEndpoints => Ok(json_response(StatusCode::OK, registry.list())),
        Route::CreateEndpoint(host) => {
            let form = read_form(req).await?;
            create_endpoint(&registry, &host, &form).await
        }
        Route::DeleteEndpoint(host) => registry.delete(&host).await.map(|()| empty_response()),
        Route::AttachProxy(host, port) => {
            let form = read_form(req).await?;
            attach_proxy(&registry, &host, &port, &form).await
        }
        Route::NotFound => {
            return Ok(json_response(
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": "not found" }),
            ))
        }
    };

    Ok(result.unwrap_or_else(|e| {
        debug!(%method, %path, error = %e, "Control API request failed");
        error_response(&e)
    }))
}

/// Query string fields overlaid with urlencoded body fields
async fn read_form(req: Request<Incoming>) -> Result<HashMap<String, String>, hyper::Error> {
    let mut form = parse_form(req.uri().query().unwrap_or(""));
    let body = req.collect().await?.to_bytes();
    form.extend(parse_form(&String::from_utf8_lossy(&body)));
    Ok(form)
}

async fn create_endpoint(
    registry: &EndpointRegistry,
    host: &str,
    form: &HashMap<String, String>,
) -> Result<ApiResponse, FrontendError> {
    let port = parse_port(required(form, "port")?)?;
    let target = required(form, "target")?;

    let endpoint = registry.create_or_renew(host, port, target).await?;
    Ok(json_response(StatusCode::OK, endpoint))
}

async fn attach_proxy(
    registry: &EndpointRegistry,
    host: &str,
    port: &str,
    form: &HashMap<String, String>,
) -> Result<ApiResponse, FrontendError> {
    let port = parse_port(port)?;
    let scheme = required(form, "scheme")?;
    let target = required(form, "target")?;

    registry.attach_proxy(host, port, scheme, target).await?;
    Ok(empty_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_form() {
        let form = parse_form("port=8080&target=http%3A%2F%2F10.0.0.5%3A9000&note=two+words&flag");
        assert_eq!(form.get("port").unwrap(), "8080");
        assert_eq!(form.get("target").unwrap(), "http://10.0.0.5:9000");
        assert_eq!(form.get("note").unwrap(), "two words");
        assert_eq!(form.get("flag").unwrap(), "");
        assert!(parse_form("").is_empty());
    }

    #[test]
    fn test_required_field() {
        let form = parse_form("port=&target=x");
        assert!(matches!(required(&form, "port"), Err(FrontendError::MissingParameter("port"))));
        assert!(matches!(required(&form, "scheme"), Err(FrontendError::MissingParameter("scheme"))));
        assert_eq!(required(&form, "target").unwrap(), "x");
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("8080").unwrap(), 8080);
        assert!(parse_port("0").is_err());
        assert!(parse_port("http").is_err());
        assert!(parse_port("70000").is_err());
    }

    #[test]
    fn test_routes() {
        assert_eq!(route(&Method::GET, "/endpoints"), Route::ListEndpoints);
        assert_eq!(route(&Method::GET, "/health"), Route::Health);
        assert_eq!(
            route(&Method::POST, "/endpoints/web.convox"),
            Route::CreateEndpoint("web.convox".to_string())
        );
        assert_eq!(
            route(&Method::DELETE, "/endpoints/web.convox"),
            Route::DeleteEndpoint("web.convox".to_string())
        );
        assert_eq!(
            route(&Method::POST, "/endpoints/web.convox/proxies/443"),
            Route::AttachProxy("web.convox".to_string(), "443".to_string())
        );
        assert_eq!(route(&Method::PUT, "/endpoints/web.convox"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/endpoints/web.convox/extra"), Route::NotFound);
    }

    #[test]
    fn test_empty_response_is_204() {
        assert_eq!(empty_response().status(), StatusCode::NO_CONTENT);
    }
}
