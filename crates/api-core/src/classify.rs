//! Error classification for transport outcomes
//!
//! Maps a transport failure or a non-2xx response onto the taxonomy in
//! `ErrorCode`, deciding retryability and the user-facing message. The
//! classifier is a pure function of its inputs: it performs no I/O, reads no
//! clock, and keeps no state.

use std::time::Duration;

use transport::{HeaderMap, HttpResponse, TransportFailure};

use crate::error::{ClassifiedError, ErrorCode, ErrorContext};

/// Longest slice of a response body kept in `raw_details`.
const MAX_RAW_BODY: usize = 1024;

/// Body members that mark a 400 as a structured validation failure.
const VALIDATION_MEMBERS: &[&str] = &["errors", "fields", "details", "violations"];

/// What came back from one exchange.
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    /// No response: the exchange failed below HTTP
    Transport(&'a TransportFailure),
    Response {
        status: u16,
        headers: &'a HeaderMap,
        body: &'a [u8],
    },
}

impl<'a> From<&'a HttpResponse> for Outcome<'a> {
    fn from(response: &'a HttpResponse) -> Self {
        Outcome::Response {
            status: response.status,
            headers: &response.headers,
            body: &response.body,
        }
    }
}

impl<'a> From<&'a TransportFailure> for Outcome<'a> {
    fn from(failure: &'a TransportFailure) -> Self {
        Outcome::Transport(failure)
    }
}

/// Classify one failed exchange.
///
/// `context` is attached verbatim; callers build it per attempt.
pub fn classify(outcome: Outcome<'_>, context: ErrorContext) -> ClassifiedError {
    match outcome {
        Outcome::Transport(failure) => classify_transport(failure),
        Outcome::Response {
            status,
            headers,
            body,
        } => classify_response(status, headers, body),
    }
    .with_context(context)
}

fn classify_transport(failure: &TransportFailure) -> ClassifiedError {
    let code = match failure {
        TransportFailure::Timeout(_) => ErrorCode::Timeout,
        TransportFailure::Dns(_) => ErrorCode::DnsFailure,
        TransportFailure::ConnectionRefused(_) => ErrorCode::ConnectionRefused,
        TransportFailure::MalformedRequest(_) => ErrorCode::InvalidRequest,
        TransportFailure::Connect(_) | TransportFailure::Other(_) => ErrorCode::NetworkError,
    };
    ClassifiedError::new(code, !failure.is_permanent(), false).with_raw_details(failure.to_string())
}

fn classify_response(status: u16, headers: &HeaderMap, body: &[u8]) -> ClassifiedError {
    let parsed: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    let server_message = parsed.as_ref().and_then(body_message);

    let error = match status {
        401 => ClassifiedError::new(ErrorCode::AuthenticationRequired, false, false),
        403 => ClassifiedError::new(ErrorCode::PermissionDenied, false, true),
        400 => {
            let code = if parsed.as_ref().is_some_and(is_structured_validation) {
                ErrorCode::ValidationError
            } else {
                ErrorCode::BadRequest
            };
            user_error(code, server_message)
        }
        404 => user_error(ErrorCode::NotFound, server_message),
        409 => user_error(ErrorCode::Conflict, server_message),
        422 => user_error(ErrorCode::ValidationError, server_message),
        408 => ClassifiedError::new(ErrorCode::Timeout, true, false),
        429 => {
            let mut error = ClassifiedError::new(ErrorCode::RateLimited, true, false);
            if let Some(wait) = retry_after(headers) {
                error = error.with_retry_after(wait);
            }
            error
        }
        s if s >= 500 => ClassifiedError::new(ErrorCode::ServerError, true, false),
        s => ClassifiedError::new(ErrorCode::Http(s), false, false),
    };

    error
        .with_status(status)
        .with_raw_details(format!("HTTP {status}: {}", truncated(body)))
}

/// Non-retryable user error, preferring the server's own message.
fn user_error(code: ErrorCode, server_message: Option<String>) -> ClassifiedError {
    let error = ClassifiedError::new(code, false, true);
    match server_message {
        Some(message) => error.with_user_message(message),
        None => error,
    }
}

/// Extract a human-readable message from common error body shapes:
/// `{"message": ..}`, `{"error": {"message": ..}}`, `{"error": ".."}`.
fn body_message(body: &serde_json::Value) -> Option<String> {
    let candidates = [
        body.get("message"),
        body.get("error").and_then(|e| e.get("message")),
        body.get("error"),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_owned)
}

fn is_structured_validation(body: &serde_json::Value) -> bool {
    VALIDATION_MEMBERS
        .iter()
        .any(|member| body.get(member).is_some_and(|v| !v.is_null()))
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncated(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.is_empty() {
        return String::from("<no body>");
    }
    text.chars().take(MAX_RAW_BODY).collect()
}
