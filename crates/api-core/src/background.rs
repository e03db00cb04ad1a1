//! Proactive background token refresh
//!
//! Spawns a periodic task that refreshes the session's token when it is
//! approaching expiration, so most requests never see a 401. The task goes
//! through the coordinator and therefore shares the single flight with any
//! request-time refresh.

use std::time::Duration;

use session_auth::{CredentialStore, now_millis};
use tracing::{debug, info, warn};

use crate::coordinator::RefreshCoordinator;

/// What one refresh cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nobody is signed in
    NoCredentials,
    /// Token not expiring within the threshold
    Fresh,
    Refreshed,
    /// Refresh failed; the coordinator has signed the session out
    Failed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::NoCredentials => "no_credentials",
            CycleOutcome::Fresh => "fresh",
            CycleOutcome::Refreshed => "refreshed",
            CycleOutcome::Failed => "failed",
        }
    }
}

/// Spawn a background task that proactively refreshes an expiring token.
///
/// Runs every `interval` and refreshes when the stored token expires within
/// `threshold`. Returns a `JoinHandle` for the spawned task.
pub fn spawn_refresh_task(
    coordinator: RefreshCoordinator,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&coordinator, threshold).await;
        }
    })
}

/// Run one refresh cycle.
pub async fn refresh_cycle(coordinator: &RefreshCoordinator, threshold: Duration) -> CycleOutcome {
    let seen = coordinator.generation();
    let Some(pair) = coordinator.store().get().await else {
        debug!("no stored credentials, skipping background refresh");
        return CycleOutcome::NoCredentials;
    };

    if !pair.expires_within(now_millis(), threshold) {
        return CycleOutcome::Fresh;
    }

    debug!(expires_at = pair.expires_at, "token expiring within threshold, refreshing");
    match coordinator
        .refresh_if_stale(seen, Some(&pair.access_token))
        .await
    {
        Ok(_) => {
            info!("background token refresh succeeded");
            CycleOutcome::Refreshed
        }
        Err(e) => {
            warn!(code = %e.code(), "background token refresh failed");
            CycleOutcome::Failed
        }
    }
}
