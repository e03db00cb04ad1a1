//! Ordered request stages
//!
//! Each stage adds headers to an outgoing attempt. The pipeline runs its
//! stages in list order on a fresh header map for every attempt, so a resend
//! after a credential refresh picks up the new token.

use std::str::FromStr;

use common::Secret;
use serde::Deserialize;
use tracing::warn;
use transport::{HeaderMap, HeaderName, HeaderValue};

use crate::error::ConfigError;
use crate::pipeline::RequestContext;

pub const PLATFORM_HEADER: &str = "x-platform";
pub const APP_VERSION_HEADER: &str = "x-app-version";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const REQUEST_TIMESTAMP_HEADER: &str = "x-request-timestamp";

/// What a stage may read about the attempt it decorates.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext<'a> {
    pub request: &'a RequestContext,
    /// Token the pipeline read for this attempt; `None` when signed out or skipped
    pub access_token: Option<&'a Secret<String>>,
}

/// One step in the request decoration chain.
pub trait RequestStage: Send + Sync {
    /// Identifier for logs
    fn name(&self) -> &str;

    fn apply(&self, headers: &mut HeaderMap, attempt: &AttemptContext<'_>);
}

/// Header injection rule (name + value pair from config).
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// Configured extra headers. Never touches `authorization`.
pub struct StaticHeaders {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl StaticHeaders {
    /// Invalid entries and attempts to set `authorization` are skipped with a warning.
    pub fn new(injections: Vec<HeaderInjection>) -> Self {
        let mut headers = Vec::with_capacity(injections.len());
        for injection in &injections {
            let name = match HeaderName::from_str(&injection.name) {
                Ok(n) => n,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header name");
                    continue;
                }
            };
            if name.as_str() == "authorization" {
                warn!(header = %injection.name, "refusing to configure authorization as a static header");
                continue;
            }
            let value = match HeaderValue::from_str(&injection.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header value");
                    continue;
                }
            };
            headers.push((name, value));
        }
        Self { headers }
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl RequestStage for StaticHeaders {
    fn name(&self) -> &str {
        "static_headers"
    }

    fn apply(&self, headers: &mut HeaderMap, _attempt: &AttemptContext<'_>) {
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
    }
}

/// Platform, app version, request id and request timestamp.
pub struct ContextHeaders {
    platform: HeaderValue,
    app_version: HeaderValue,
}

impl ContextHeaders {
    pub fn new(platform: &str, app_version: &str) -> Result<Self, ConfigError> {
        let value = |name: &str, raw: &str| {
            if raw.trim().is_empty() {
                return Err(ConfigError::InvalidHeader {
                    name: name.to_string(),
                    reason: "value is empty".to_string(),
                });
            }
            HeaderValue::from_str(raw).map_err(|e| ConfigError::InvalidHeader {
                name: name.to_string(),
                reason: e.to_string(),
            })
        };
        Ok(Self {
            platform: value(PLATFORM_HEADER, platform)?,
            app_version: value(APP_VERSION_HEADER, app_version)?,
        })
    }
}

impl RequestStage for ContextHeaders {
    fn name(&self) -> &str {
        "context_headers"
    }

    fn apply(&self, headers: &mut HeaderMap, attempt: &AttemptContext<'_>) {
        headers.insert(PLATFORM_HEADER, self.platform.clone());
        headers.insert(APP_VERSION_HEADER, self.app_version.clone());
        // Request ids are `req_` + hex, always valid header values
        if let Ok(id) = HeaderValue::from_str(&attempt.request.request_id) {
            headers.insert(REQUEST_ID_HEADER, id);
        }
        headers.insert(
            REQUEST_TIMESTAMP_HEADER,
            HeaderValue::from(attempt.request.timestamp),
        );
    }
}

/// `authorization: Bearer <token>` when the attempt carries a token.
pub struct BearerAuth;

impl RequestStage for BearerAuth {
    fn name(&self) -> &str {
        "bearer_auth"
    }

    fn apply(&self, headers: &mut HeaderMap, attempt: &AttemptContext<'_>) {
        let Some(token) = attempt.access_token.filter(|t| !t.is_empty()) else {
            return;
        };
        match HeaderValue::from_str(&format!("Bearer {}", token.expose())) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert("authorization", value);
            }
            Err(_) => warn!("access token is not a valid header value, sending unauthenticated"),
        }
    }
}

/// The standard chain: static headers, context headers, bearer auth.
pub fn default_stages(
    platform: &str,
    app_version: &str,
    extra_headers: Vec<HeaderInjection>,
) -> Result<Vec<Box<dyn RequestStage>>, ConfigError> {
    Ok(vec![
        Box::new(StaticHeaders::new(extra_headers)),
        Box::new(ContextHeaders::new(platform, app_version)?),
        Box::new(BearerAuth),
    ])
}
