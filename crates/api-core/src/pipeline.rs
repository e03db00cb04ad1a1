//! Authenticated request pipeline
//!
//! One logical call: decorate the request through the stage list, send it,
//! and on a 401 recover credentials once (reusing a token another caller
//! already refreshed, or joining the coordinator's single flight) before
//! resending exactly once. Any other failure is classified and returned.
//!
//! Attempt lifecycle: `Unsent -> Sent -> (AuthRetryPending -> Sent)? -> Classified | Succeeded`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::Secret;
use serde::de::DeserializeOwned;
use session_auth::{CredentialStore, now_millis};
use tracing::{debug, info, instrument, warn};
use transport::{HeaderMap, HttpRequest, HttpResponse, Method, Transport, DEFAULT_TIMEOUT};

use crate::classify::{Outcome, classify};
use crate::coordinator::{Generation, RefreshCoordinator};
use crate::error::{ClassifiedError, ConfigError, ErrorCode, ErrorContext};
use crate::metrics;
use crate::stages::{AttemptContext, RequestStage};

/// Pipeline-wide settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    base_url: String,
    timeout: Duration,
    refresh_ahead: Option<Duration>,
}

impl PipelineConfig {
    /// `base_url` must be an absolute http(s) URL. A trailing slash is dropped.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ConfigError> {
        let base_url = base_url.into();
        let trimmed = base_url.trim().trim_end_matches('/');
        let host = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"));
        if host.is_none_or(str::is_empty) {
            return Err(ConfigError::Pipeline(format!(
                "base URL must be an absolute http(s) URL, got {base_url:?}"
            )));
        }
        Ok(Self {
            base_url: trimmed.to_string(),
            timeout: DEFAULT_TIMEOUT,
            refresh_ahead: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::Pipeline("timeout must be non-zero".into()));
        }
        self.timeout = timeout;
        Ok(self)
    }

    /// Refresh before sending when the stored token expires within `window`.
    pub fn with_refresh_ahead(mut self, window: Duration) -> Self {
        self.refresh_ahead = (!window.is_zero()).then_some(window);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn refresh_ahead(&self) -> Option<Duration> {
        self.refresh_ahead
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the pipeline timeout for this call
    pub timeout: Option<Duration>,
    /// Applied before the stage list; stages win on conflicts
    pub headers: HeaderMap,
    /// Send without credentials and do not attempt recovery on 401
    pub skip_auth: bool,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn unauthenticated(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

/// Identity of one logical call, shared by all of its attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// `req_` followed by a simple-format v4 UUID
    pub request_id: String,
    /// Unix milliseconds at which the current attempt was built
    pub timestamp: u64,
    pub retry_count: u32,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            timestamp: now_millis(),
            retry_count: 0,
        }
    }

    /// Same call, next attempt: keeps the id, stamps a new timestamp.
    pub fn for_attempt(&self, retry_count: u32) -> Self {
        Self {
            request_id: self.request_id.clone(),
            timestamp: now_millis(),
            retry_count,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A 2xx response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_id: String,
}

impl ApiResponse {
    /// Decode the body as JSON. An empty body decodes as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClassifiedError> {
        let decoded = if self.body.iter().all(u8::is_ascii_whitespace) {
            serde_json::from_value(serde_json::Value::Null)
        } else {
            serde_json::from_slice(&self.body)
        };
        decoded.map_err(|e| {
            ClassifiedError::new(ErrorCode::Unknown, false, false)
                .with_status(self.status)
                .with_raw_details(format!("response body did not decode: {e}"))
        })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    transport: Arc<dyn Transport>,
    coordinator: RefreshCoordinator,
    stages: Vec<Box<dyn RequestStage>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        transport: Arc<dyn Transport>,
        coordinator: RefreshCoordinator,
        stages: Vec<Box<dyn RequestStage>>,
    ) -> Self {
        Self {
            config,
            transport,
            coordinator,
            stages,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Absolute URLs pass through; paths are joined to the base URL.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url,
            path.trim_start_matches('/')
        )
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<ApiResponse, ClassifiedError> {
        self.send_with_context(RequestContext::new(), method, path, body, options)
            .await
    }

    /// Send one logical call under an existing context (the retry executor
    /// passes one per attempt).
    #[instrument(
        skip_all,
        fields(request_id = %ctx.request_id, method = %method, path = %path, attempt = ctx.retry_count)
    )]
    pub async fn send_with_context(
        &self,
        ctx: RequestContext,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<ApiResponse, ClassifiedError> {
        let error_context = || ErrorContext {
            endpoint: path.to_string(),
            method: method.to_string(),
            attempt: ctx.retry_count,
            timestamp: now_millis(),
        };
        let url = self.url_for(path);

        // Taken before the token is read so recovery can tell whether it is stale
        let seen = self.coordinator.generation();
        let token = if options.skip_auth {
            None
        } else {
            self.refresh_if_expiring(seen)
                .await
                .map_err(|e| e.with_context(error_context()))?;
            self.coordinator
                .store()
                .get()
                .await
                .map(|pair| pair.access_token)
        };

        let mut response = self
            .dispatch(&ctx, &method, &url, body, options, token.as_ref())
            .await
            .map_err(|failure| classify(Outcome::from(&failure), error_context()))?;

        if response.status == 401 && !options.skip_auth {
            info!("request unauthorized, recovering credentials");
            let renewed = self
                .recover_credentials(seen, token.as_ref())
                .await
                .map_err(|e| e.with_status(401).with_context(error_context()))?;

            response = self
                .dispatch(&ctx, &method, &url, body, options, Some(&renewed))
                .await
                .map_err(|failure| classify(Outcome::from(&failure), error_context()))?;

            if response.status == 401 {
                warn!("request unauthorized again after credential refresh");
                return Err(ClassifiedError::authentication_required(
                    "rejected with a freshly refreshed token",
                )
                .with_status(401)
                .with_context(error_context()));
            }
        }

        if !response.is_success() {
            let error = classify(Outcome::from(&response), error_context());
            debug!(
                status = response.status,
                code = %error.code(),
                "request failed"
            );
            return Err(error);
        }

        Ok(ApiResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
            request_id: ctx.request_id.clone(),
        })
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        method: &Method,
        url: &str,
        body: Option<&serde_json::Value>,
        options: &RequestOptions,
        token: Option<&Secret<String>>,
    ) -> Result<HttpResponse, transport::TransportFailure> {
        let mut request = HttpRequest::new(method.clone(), url)
            .with_timeout(options.timeout.unwrap_or(self.config.timeout));
        if let Some(body) = body {
            request = request.with_json(body);
        }
        for (name, value) in &options.headers {
            request.headers.insert(name.clone(), value.clone());
        }

        let attempt = AttemptContext {
            request: ctx,
            access_token: token,
        };
        for stage in &self.stages {
            stage.apply(&mut request.headers, &attempt);
        }

        debug!(authenticated = token.is_some(), "sending request");
        match self.transport.execute(request).await {
            Ok(response) => {
                metrics::record_response(response.status);
                debug!(status = response.status, "response received");
                Ok(response)
            }
            Err(failure) => {
                metrics::record_transport_failure(failure.reason());
                warn!(reason = failure.reason(), error = %failure, "transport failure");
                Err(failure)
            }
        }
    }

    /// Token to resend with after a 401.
    ///
    /// If another caller refreshed after `seen`, its token is reused.
    async fn recover_credentials(
        &self,
        seen: Generation,
        sent: Option<&Secret<String>>,
    ) -> Result<Secret<String>, ClassifiedError> {
        self.coordinator
            .refresh_if_stale(seen, sent)
            .await
            .map(|pair| pair.access_token)
            .map_err(session_ended)
    }

    async fn refresh_if_expiring(&self, seen: Generation) -> Result<(), ClassifiedError> {
        let Some(window) = self.config.refresh_ahead else {
            return Ok(());
        };
        match self.coordinator.store().get().await {
            Some(pair) if pair.expires_within(now_millis(), window) => {
                debug!(expires_at = pair.expires_at, "token expiring soon, refreshing ahead");
                self.coordinator
                    .refresh_if_stale(seen, Some(&pair.access_token))
                    .await
                    .map(|_| ())
                    .map_err(session_ended)
            }
            _ => Ok(()),
        }
    }
}

/// A failed refresh has already signed the session out.
fn session_ended(error: ClassifiedError) -> ClassifiedError {
    match error.code() {
        ErrorCode::AuthenticationRequired => error,
        _ => ClassifiedError::authentication_required(
            error.raw_details().unwrap_or("credential refresh failed").to_string(),
        ),
    }
}
