//! Retry executor with exponential backoff
//!
//! Runs an operation up to `max_retries + 1` times. Between attempts it waits
//! `min(base_delay * multiplier^attempt, max_delay)` on the tokio timer; there
//! is no jitter unless the policy asks for it. The retry decision belongs to
//! the policy's predicate, which defaults to `ClassifiedError::is_retryable`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tracing::{debug, warn};

use crate::error::{ClassifiedError, ConfigError};
use crate::metrics;

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&ClassifiedError) -> bool + Send + Sync>;

/// Observes each scheduled retry: `(error, next_attempt)`.
pub type RetryObserver = Arc<dyn Fn(&ClassifiedError, u32) + Send + Sync>;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10_000);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Backoff configuration for one retry sequence.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: f64,
    retry_predicate: RetryPredicate,
    on_retry: Option<RetryObserver>,
}

impl RetryPolicy {
    /// Build a validated policy with the default predicate and no jitter.
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, ConfigError> {
        if !backoff_multiplier.is_finite() || backoff_multiplier <= 1.0 {
            return Err(ConfigError::RetryPolicy(format!(
                "backoff_multiplier must be greater than 1.0, got {backoff_multiplier}"
            )));
        }
        if base_delay > max_delay {
            return Err(ConfigError::RetryPolicy(format!(
                "base_delay ({base_delay:?}) must not exceed max_delay ({max_delay:?})"
            )));
        }
        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier,
            jitter: 0.0,
            retry_predicate: Arc::new(ClassifiedError::is_retryable),
            on_retry: None,
        })
    }

    /// Single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Shorten each delay by a random fraction in `[0, jitter]`.
    pub fn with_jitter(mut self, jitter: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::RetryPolicy(format!(
                "jitter must be within [0, 1], got {jitter}"
            )));
        }
        self.jitter = jitter;
        Ok(self)
    }

    pub fn with_retry_predicate(
        mut self,
        predicate: impl Fn(&ClassifiedError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_predicate = Arc::new(predicate);
        self
    }

    pub fn on_retry(mut self, observer: impl Fn(&ClassifiedError, u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Whether the predicate allows retrying `error`.
    pub fn allows_retry(&self, error: &ClassifiedError) -> bool {
        (self.retry_predicate)(error)
    }

    /// Deterministic backoff after the zero-based `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.base_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let cap = self.max_delay.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= cap {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    /// Actual wait before the next attempt: backoff, jitter, then the
    /// server's `retry_after` as a floor, all capped by `max_delay`.
    fn next_delay(&self, attempt: u32, error: &ClassifiedError) -> Duration {
        let mut delay = self.delay_for(attempt);
        if self.jitter > 0.0 {
            let cut = rand::rng().random_range(0.0..=self.jitter);
            delay = delay.mul_f64(1.0 - cut);
        }
        if let Some(wait) = error.retry_after() {
            delay = delay.max(wait);
        }
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: 0.0,
            retry_predicate: Arc::new(ClassifiedError::is_retryable),
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("on_retry", &self.on_retry.is_some())
            .finish_non_exhaustive()
    }
}

/// Run `operation` under `policy`.
///
/// `operation` receives the zero-based attempt number. A success returns
/// immediately; a failure is final when attempts are exhausted or the
/// predicate refuses it, otherwise the executor sleeps and tries again.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, ClassifiedError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClassifiedError>>,
{
    let total = policy.max_retries.saturating_add(1);
    let mut attempt = 0u32;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, of = total, "attempt succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if attempt >= policy.max_retries {
                    if policy.max_retries > 0 {
                        warn!(attempts = total, code = %error.code(), "retries exhausted");
                    }
                    return Err(error);
                }
                if !policy.allows_retry(&error) {
                    debug!(attempt = attempt + 1, code = %error.code(), "failure not retryable");
                    return Err(error);
                }

                let delay = policy.next_delay(attempt, &error);
                warn!(
                    attempt = attempt + 1,
                    of = total,
                    code = %error.code(),
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying"
                );
                metrics::record_retry(error.code());
                if let Some(observer) = &policy.on_retry {
                    observer(&error, attempt + 1);
                }

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
