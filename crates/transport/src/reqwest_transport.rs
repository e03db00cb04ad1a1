//! reqwest-backed transport.
//!
//! Maps reqwest's error flags onto `TransportFailure` so the classifier never
//! needs to know which HTTP stack is underneath.

use crate::{HttpRequest, HttpResponse, Transport, TransportFailure};
use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Error chain fragments hyper-util emits when name resolution fails.
const DNS_PATTERNS: &[&str] = &["dns error", "failed to lookup address", "name or service not known"];

/// Transport over a shared `reqwest::Client` (connection pooling lives there).
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn execute(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportFailure>> + Send + '_>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method, &request.url)
                .headers(request.headers)
                .timeout(request.timeout);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(map_reqwest_error)?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(map_reqwest_error)?;

            debug!(status, bytes = body.len(), "exchange completed");
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

/// Translate a reqwest error into the transport failure taxonomy.
pub fn map_reqwest_error(err: reqwest::Error) -> TransportFailure {
    let chain = error_chain(&err);
    if err.is_timeout() {
        return TransportFailure::Timeout(chain);
    }
    if err.is_builder() {
        return TransportFailure::MalformedRequest(chain);
    }
    if err.is_connect() {
        return classify_connect_failure(chain, is_connection_refused(&err));
    }
    TransportFailure::Other(chain)
}

/// Narrow a connect-phase failure based on its error chain.
fn classify_connect_failure(chain: String, refused: bool) -> TransportFailure {
    if refused {
        return TransportFailure::ConnectionRefused(chain);
    }
    let lower = chain.to_lowercase();
    if DNS_PATTERNS.iter().any(|p| lower.contains(p)) {
        return TransportFailure::Dns(chain);
    }
    TransportFailure::Connect(chain)
}

fn is_connection_refused(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        let refused = e
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::ConnectionRefused);
        if refused {
            return true;
        }
        current = e.source();
    }
    false
}

/// Render an error with all of its sources, `outer: inner: root`.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        out.push_str(": ");
        out.push_str(&e.to_string());
        current = e.source();
    }
    out
}
