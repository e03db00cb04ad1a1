//! Client-side counters
//!
//! Emitted through the `metrics` facade; without an installed recorder every
//! call is a no-op. The binary installs a Prometheus recorder.
//!
//! - `api_requests_total` (counter): label `status`
//! - `api_transport_failures_total` (counter): label `reason`
//! - `api_refresh_total` (counter): label `outcome` (`success`, `failure`, `no_token`, `reused`)
//! - `api_refresh_waiters_total` (counter): callers that joined an in-flight refresh
//! - `api_retries_total` (counter): label `code`
//! - `api_reported_errors_total` (counter): label `code`
//! - `api_call_duration_seconds` (histogram): label `outcome` (`success` or the error code)

use crate::error::ErrorCode;

pub(crate) fn record_response(status: u16) {
    metrics::counter!("api_requests_total", "status" => status.to_string()).increment(1);
}

pub(crate) fn record_transport_failure(reason: &'static str) {
    metrics::counter!("api_transport_failures_total", "reason" => reason).increment(1);
}

pub(crate) fn record_refresh(outcome: &'static str) {
    metrics::counter!("api_refresh_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_refresh_waiter() {
    metrics::counter!("api_refresh_waiters_total").increment(1);
}

pub(crate) fn record_retry(code: ErrorCode) {
    metrics::counter!("api_retries_total", "code" => code.to_string()).increment(1);
}

pub(crate) fn record_reported(code: ErrorCode) {
    metrics::counter!("api_reported_errors_total", "code" => code.to_string()).increment(1);
}

/// Record a finished logical call, retries included.
pub(crate) fn record_call(outcome: Option<ErrorCode>, duration_secs: f64) {
    let outcome = outcome.map_or_else(|| "success".to_string(), |code| code.to_string());
    metrics::histogram!("api_call_duration_seconds", "outcome" => outcome).record(duration_secs);
}
