//! Error types for credential storage and token exchange

use transport::TransportFailure;

/// Errors from credential storage and token refresh operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] TransportFailure),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// The token endpoint rejected the refresh token (revoked, expired, or unknown).
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for credential and token operations.
pub type Result<T> = std::result::Result<T, Error>;
