//! Stable error taxonomy for API calls
//!
//! Every failed attempt becomes exactly one `ClassifiedError`. Its fields are
//! private and there are no setters: the `with_*` builders consume the value,
//! so an error is complete before anyone else can observe it.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

/// Machine-readable failure code. `Display` renders the wire string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No response reached the client
    NetworkError,
    Timeout,
    DnsFailure,
    ConnectionRefused,
    /// The request could not be built locally
    InvalidRequest,
    /// 401 that refresh could not recover
    AuthenticationRequired,
    /// Refresh attempted with no stored refresh token
    NoRefreshToken,
    PermissionDenied,
    BadRequest,
    ValidationError,
    NotFound,
    Conflict,
    RateLimited,
    ServerError,
    /// Status with no dedicated classification
    Http(u16),
    Unknown,
}

impl ErrorCode {
    /// Fixed user-facing message used when the server supplies none.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError | ErrorCode::DnsFailure | ErrorCode::ConnectionRefused => {
                "Unable to reach the server. Check your connection and try again."
            }
            ErrorCode::Timeout => "The request timed out. Please try again.",
            ErrorCode::InvalidRequest => "The request could not be sent.",
            ErrorCode::AuthenticationRequired => "Your session has expired. Please sign in again.",
            ErrorCode::NoRefreshToken => "Please sign in to continue.",
            ErrorCode::PermissionDenied => "You don't have permission to perform this action.",
            ErrorCode::BadRequest => "The request was invalid.",
            ErrorCode::ValidationError => "Some of the information provided is invalid.",
            ErrorCode::NotFound => "The requested item could not be found.",
            ErrorCode::Conflict => "This item was changed elsewhere. Refresh and try again.",
            ErrorCode::RateLimited => "Too many requests. Please wait a moment and try again.",
            ErrorCode::ServerError => "Something went wrong on our end. Please try again later.",
            ErrorCode::Http(_) | ErrorCode::Unknown => "Something went wrong. Please try again.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DnsFailure => "DNS_FAILURE",
            ErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            ErrorCode::NoRefreshToken => "NO_REFRESH_TOKEN",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::Http(status) => return write!(f, "HTTP_{status}"),
            ErrorCode::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where and when a failure happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Request path relative to the API base URL
    pub endpoint: String,
    pub method: String,
    /// Zero-based attempt number within the retry sequence
    pub attempt: u32,
    /// Unix milliseconds
    pub timestamp: u64,
}

/// A failed attempt, classified.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {user_message}")]
pub struct ClassifiedError {
    code: ErrorCode,
    retryable: bool,
    user_error: bool,
    user_message: String,
    raw_details: Option<String>,
    status: Option<u16>,
    retry_after: Option<Duration>,
    context: ErrorContext,
}

impl ClassifiedError {
    /// New error carrying the code's default message.
    pub fn new(code: ErrorCode, retryable: bool, user_error: bool) -> Self {
        Self {
            code,
            retryable,
            user_error,
            user_message: code.default_message().to_string(),
            raw_details: None,
            status: None,
            retry_after: None,
            context: ErrorContext::default(),
        }
    }

    /// Refresh failed or was impossible; the user must sign in again.
    pub fn authentication_required(details: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthenticationRequired, false, false).with_raw_details(details)
    }

    /// No refresh token stored.
    pub fn no_refresh_token() -> Self {
        Self::new(ErrorCode::NoRefreshToken, false, true)
            .with_raw_details("credential store holds no refresh token")
    }

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    pub fn with_raw_details(mut self, details: impl Into<String>) -> Self {
        self.raw_details = Some(details.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_user_error(&self) -> bool {
        self.user_error
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Diagnostic detail (transport chain, truncated body). Never show to users.
    pub fn raw_details(&self) -> Option<&str> {
        self.raw_details.as_deref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Server-requested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Whether this failure belongs on the external monitoring channel.
    pub fn should_report(&self) -> bool {
        !self.user_error && self.status.is_some_and(|s| s >= 500)
    }
}

/// Invalid client configuration (retry policy, pipeline, headers).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid retry policy: {0}")]
    RetryPolicy(String),

    #[error("invalid pipeline configuration: {0}")]
    Pipeline(String),

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
}
