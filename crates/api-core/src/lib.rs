//! Resilient API client core
//!
//! Authenticates every outbound request, recovers from expired credentials
//! without duplicating work across concurrent callers, retries transient
//! failures with bounded backoff, and reduces every failure to a stable
//! `ErrorCode`.
//!
//! Request flow:
//! 1. `ApiClient` runs the call under the retry executor
//! 2. `Pipeline` decorates each attempt through its ordered `RequestStage`s
//! 3. A 401 is recovered once through the shared `RefreshCoordinator`
//! 4. Any remaining failure is classified into a `ClassifiedError`
//! 5. The caller receives an `ApiResult`

pub mod background;
pub mod classify;
pub mod client;
pub mod coordinator;
pub mod error;
mod metrics;
pub mod pipeline;
pub mod retry;
pub mod stages;

#[cfg(test)]
pub(crate) mod test_support;

pub use background::{CycleOutcome, refresh_cycle, spawn_refresh_task};
pub use classify::{Outcome, classify};
pub use client::{ApiClient, ApiErrorBody, ApiResult, ErrorReporter};
pub use coordinator::{Generation, RefreshConfig, RefreshCoordinator, RefreshOutcome, SessionState};
pub use error::{ClassifiedError, ConfigError, ErrorCode, ErrorContext};
pub use pipeline::{ApiResponse, Pipeline, PipelineConfig, RequestContext, RequestOptions};
pub use retry::{RetryPolicy, execute_with_retry};
pub use stages::{
    AttemptContext, BearerAuth, ContextHeaders, HeaderInjection, RequestStage, StaticHeaders,
    default_stages,
};
