//! Control-plane errors and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes surfaced in the `X-Proxy-Error` header and JSON bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A required form field was absent or empty
    MissingParameter,
    /// A form field could not be parsed
    InvalidParameter,
    /// No endpoint is registered for the host
    UnknownEndpoint,
    /// The virtual IP pool has no free address
    PoolExhausted,
    /// The OS refused an interface or socket operation
    SystemError,
    /// Issuing a certificate failed
    CertificateError,
    /// The backend reference resolved to zero live instances
    NoBackend,
    /// Dialing or talking to the backend failed
    ConnectionFailed,
    /// The backend did not answer in time
    RequestTimeout,
    /// Internal error
    InternalError,
}

impl ErrorCode {
    /// Client-caused errors are 4xx, allocation and backend failures 5xx
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::MissingParameter => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidParameter => StatusCode::BAD_REQUEST,
            ErrorCode::UnknownEndpoint => StatusCode::NOT_FOUND,
            ErrorCode::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::SystemError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::CertificateError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::NoBackend => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::MissingParameter => "MISSING_PARAMETER",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::UnknownEndpoint => "UNKNOWN_ENDPOINT",
            ErrorCode::PoolExhausted => "POOL_EXHAUSTED",
            ErrorCode::SystemError => "SYSTEM_ERROR",
            ErrorCode::CertificateError => "CERTIFICATE_ERROR",
            ErrorCode::NoBackend => "NO_BACKEND",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Errors raised by registry, proxy and control API operations
#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid scheme: {0}")]
    InvalidScheme(String),

    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("no such endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("no free address left in {0}")]
    PoolExhausted(String),

    #[error("interface error: {0}")]
    Interface(String),

    #[error("could not listen on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("no backend available for {0}")]
    NoBackend(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl FrontendError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FrontendError::MissingParameter(_) => ErrorCode::MissingParameter,
            FrontendError::InvalidPort(_)
            | FrontendError::InvalidTarget(_)
            | FrontendError::InvalidScheme(_)
            | FrontendError::InvalidHost(_) => ErrorCode::InvalidParameter,
            FrontendError::UnknownEndpoint(_) => ErrorCode::UnknownEndpoint,
            FrontendError::PoolExhausted(_) => ErrorCode::PoolExhausted,
            FrontendError::Interface(_) | FrontendError::Bind { .. } => ErrorCode::SystemError,
            FrontendError::Certificate(_) => ErrorCode::CertificateError,
            FrontendError::NoBackend(_) => ErrorCode::NoBackend,
            FrontendError::Backend(_) => ErrorCode::ConnectionFailed,
            FrontendError::Timeout(_) => ErrorCode::RequestTimeout,
            FrontendError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code().status_code()
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Error response for a failed operation, carrying its text
pub fn error_response(err: &FrontendError) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(err.code(), err.to_string())
}
