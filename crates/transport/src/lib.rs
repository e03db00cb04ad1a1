//! Transport abstraction for outbound HTTP exchanges
//!
//! Defines the `Transport` trait that decouples the API client core from the
//! HTTP stack. A transport performs exactly one exchange: it never retries,
//! never attaches credentials, and never interprets status codes. Everything
//! above the wire (auth, retry, classification) lives in `api-core`.
//!
//! `ReqwestTransport` is the production implementation; tests substitute
//! scripted transports that implement the same trait.

pub mod reqwest_transport;

pub use reqwest::Method;
pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use reqwest_transport::ReqwestTransport;

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default per-exchange timeout when the caller does not supply one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A single outbound HTTP exchange, fully assembled.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Serialize `value` as the request body and set `content-type: application/json`.
    pub fn with_json(mut self, value: &serde_json::Value) -> Self {
        self.body = Some(Bytes::from(value.to_string()));
        self.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Status, headers and body of a completed exchange (any status code).
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Failure before any response reached the client.
///
/// Each variant carries the underlying error chain as text for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection failed: {0}")]
    Connect(String),

    /// The request could not be built (invalid URL, header, or body).
    /// Retrying the same request cannot succeed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportFailure {
    /// Short reason label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            TransportFailure::Timeout(_) => "timeout",
            TransportFailure::Dns(_) => "dns",
            TransportFailure::ConnectionRefused(_) => "connection_refused",
            TransportFailure::Connect(_) => "connect",
            TransportFailure::MalformedRequest(_) => "malformed_request",
            TransportFailure::Other(_) => "other",
        }
    }

    /// Whether the failure is a permanent local condition.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportFailure::MalformedRequest(_))
    }
}

/// Abstraction over the HTTP stack.
///
/// Uses a `Pin<Box<dyn Future>>` return type for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Perform one exchange. Non-2xx statuses are `Ok`; only failures where no
    /// response was received are `Err`.
    fn execute(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportFailure>> + Send + '_>>;
}
