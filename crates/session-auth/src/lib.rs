//! Session credential storage and token refresh exchange
//!
//! Provides the credential pair model, the `CredentialStore` seam with
//! in-memory and file-backed implementations, and the token refresh exchange
//! against the API's token endpoint. This crate knows nothing about retries
//! or single-flight coordination; `api-core` layers those on top.
//!
//! Credential flow:
//! 1. App signs in and stores a pair via `CredentialStore::set()`
//! 2. Request pipeline reads the access token via `CredentialStore::get()`
//! 3. On expiry the refresh coordinator calls `token::refresh_exchange()`
//! 4. The new pair replaces the old one in a single `set()` call
//! 5. An unrecoverable refresh calls `CredentialStore::delete()` (sign-out)

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{
    CredentialPair, CredentialStore, FileCredentialStore, MemoryCredentialStore, now_millis,
};
pub use error::{Error, Result};
pub use token::{TokenResponse, refresh_exchange};
