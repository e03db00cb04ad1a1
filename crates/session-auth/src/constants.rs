//! Token endpoint constants
//!
//! Wire-level values of the refresh exchange. The endpoint URL itself is
//! configuration (`[api] token_path`), not a constant.

/// Default path of the token endpoint, relative to the API base URL.
pub const DEFAULT_TOKEN_PATH: &str = "/auth/refresh";

/// Grant type sent with every refresh exchange.
pub const REFRESH_GRANT_TYPE: &str = "refresh_token";

/// Timeout for the refresh exchange.
pub const REFRESH_TIMEOUT_SECS: u64 = 15;
