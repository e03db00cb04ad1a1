//! Token refresh exchange
//!
//! POSTs the current refresh token to the token endpoint and returns the new
//! pair. The exchange goes straight to the `Transport`: it must never pass
//! through the authenticated request pipeline, whose 401 handling would
//! recurse into another refresh.

use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;
use transport::{HttpRequest, Method, Transport};

use crate::constants::REFRESH_GRANT_TYPE;
use crate::error::{Error, Result};

/// Longest slice of an error body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. Both snake_case
/// and camelCase field names are accepted.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(alias = "refreshToken")]
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(alias = "expiresIn")]
    pub expires_in: u64,
}

/// Exchange a refresh token for a new credential pair.
///
/// 400/401/403 mean the refresh token is revoked or invalid and map to
/// `Error::InvalidCredentials`. Other non-2xx statuses and undecodable bodies
/// map to `Error::TokenExchange`; transport failures to `Error::Http`.
pub async fn refresh_exchange(
    transport: &dyn Transport,
    token_url: &str,
    refresh: &Secret<String>,
    timeout: Duration,
) -> Result<TokenResponse> {
    let payload = serde_json::json!({
        "grant_type": REFRESH_GRANT_TYPE,
        "refresh_token": refresh.expose(),
    });
    let request = HttpRequest::new(Method::POST, token_url)
        .with_json(&payload)
        .with_timeout(timeout);

    let response = transport.execute(request).await?;
    debug!(status = response.status, "token endpoint responded");

    if !response.is_success() {
        let body = truncated_body(&response.body);
        if matches!(response.status, 400 | 401 | 403) {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({}): {body}",
                response.status
            )));
        }
        return Err(Error::TokenExchange(format!(
            "token refresh returned {}: {body}",
            response.status
        )));
    }

    serde_json::from_slice::<TokenResponse>(&response.body)
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}

fn truncated_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.is_empty() {
        return String::from("<no body>");
    }
    text.chars().take(MAX_ERROR_BODY).collect()
}
