//! Single-flight credential refresh
//!
//! At most one refresh exchange runs at a time per coordinator. The first
//! caller to need a refresh marks the state in-flight and spawns the exchange;
//! every caller, initiator included, parks on a oneshot receiver queued in
//! arrival order. When the exchange settles the queue is drained under the
//! same lock that clears the in-flight flag, and each waiter receives a clone
//! of the single outcome.
//!
//! Callers that already hold a token use `refresh_if_stale` with the
//! `Generation` they observed before reading it. The generation advances each
//! time a refresh settles, and the comparison happens under the same lock as
//! the in-flight check, so a caller that lost the race to another refresh
//! picks up the newer pair instead of starting a second exchange.
//!
//! The exchange runs on its own task, so dropping a waiting request (timeout,
//! cancellation) never cancels the refresh other waiters depend on.
//!
//! Refresh failure is terminal for the session: stored credentials are
//! deleted and `SessionState::SignedOut` is published.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::Secret;
use session_auth::{CredentialPair, CredentialStore, REFRESH_TIMEOUT_SECS, now_millis};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use transport::Transport;

use crate::error::{ClassifiedError, ErrorCode};
use crate::metrics;

/// Result every waiter receives when a refresh settles.
pub type RefreshOutcome = Result<CredentialPair, ClassifiedError>;

/// Session lifecycle as seen by the application shell.
///
/// `SignedOut` is published after a refresh fails or `sign_out` is called;
/// the UI reacts by routing to sign-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    SignedOut,
}

/// Token endpoint settings for the refresh exchange.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Absolute URL of the token endpoint
    pub token_url: String,
    pub timeout: Duration,
}

impl RefreshConfig {
    pub fn new(token_url: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            timeout: Duration::from_secs(REFRESH_TIMEOUT_SECS),
        }
    }
}

/// Count of settled refreshes (and sign-ins) at the time it was taken.
///
/// Take it before reading the access token a request will be sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    generation: u64,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

struct Inner {
    state: Mutex<RefreshState>,
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn Transport>,
    config: RefreshConfig,
    session: watch::Sender<SessionState>,
}

/// Shared refresh coordinator. Cloning shares the same single-flight state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn Transport>,
        config: RefreshConfig,
    ) -> Self {
        let (session, _) = watch::channel(SessionState::Active);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RefreshState::default()),
                store,
                transport,
                config,
                session,
            }),
        }
    }

    /// The credential store this coordinator refreshes.
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    /// Subscribe to session lifecycle changes.
    pub fn session_events(&self) -> watch::Receiver<SessionState> {
        self.inner.session.subscribe()
    }

    /// Whether a refresh exchange is currently running.
    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_state().in_flight
    }

    /// Current credential generation.
    pub fn generation(&self) -> Generation {
        Generation(self.inner.lock_state().generation)
    }

    /// Obtain a fresh credential pair, joining an in-flight refresh if one exists.
    pub async fn refresh(&self) -> RefreshOutcome {
        let (rx, initiate) = self.inner.lock_state().enqueue();
        self.wait(rx, initiate).await
    }

    /// Refresh on behalf of a caller whose token `sent` was read at `seen`.
    ///
    /// If a refresh settled since `seen` and the store now holds a different
    /// non-empty access token, that pair is returned without an exchange.
    /// Otherwise this joins the in-flight refresh or starts one.
    pub async fn refresh_if_stale(
        &self,
        mut seen: Generation,
        sent: Option<&Secret<String>>,
    ) -> RefreshOutcome {
        loop {
            let queued = {
                let mut state = self.inner.lock_state();
                if state.in_flight || state.generation == seen.0 {
                    Some(state.enqueue())
                } else {
                    seen = Generation(state.generation);
                    None
                }
            };
            if let Some((rx, initiate)) = queued {
                return self.wait(rx, initiate).await;
            }

            if let Some(current) = self.inner.store.get().await {
                let changed = sent.is_none_or(|s| *s != current.access_token);
                if changed && !current.access_token.is_empty() {
                    debug!("credentials renewed since the request was sent, reusing them");
                    metrics::record_refresh("reused");
                    return Ok(current);
                }
            }
        }
    }

    async fn wait(
        &self,
        rx: oneshot::Receiver<RefreshOutcome>,
        initiate: bool,
    ) -> RefreshOutcome {
        if initiate {
            debug!("starting credential refresh");
            tokio::spawn(self.inner.clone().run());
        } else {
            debug!("joining in-flight credential refresh");
            metrics::record_refresh_waiter();
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClassifiedError::authentication_required(
                "refresh task ended without an outcome",
            )),
        }
    }

    /// Store a pair obtained by signing in and mark the session active.
    pub async fn sign_in(&self, pair: CredentialPair) -> session_auth::Result<()> {
        self.inner.store.set(pair).await?;
        self.inner.lock_state().generation += 1;
        self.inner.session.send_replace(SessionState::Active);
        info!("session signed in");
        Ok(())
    }

    /// Delete stored credentials and publish `SignedOut`.
    pub async fn sign_out(&self) -> session_auth::Result<()> {
        self.inner.store.delete().await?;
        self.inner.session.send_replace(SessionState::SignedOut);
        info!("session signed out");
        Ok(())
    }
}

impl RefreshState {
    /// Queue a waiter. Returns its receiver and whether the caller must start
    /// the exchange.
    fn enqueue(&mut self) -> (oneshot::Receiver<RefreshOutcome>, bool) {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        let initiate = !self.in_flight;
        self.in_flight = true;
        (rx, initiate)
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The spawned refresh task: exchange, persist or tear down, settle.
    async fn run(self: Arc<Self>) {
        let mut guard = SettleGuard {
            inner: Some(self.clone()),
        };

        let outcome = self.exchange().await;
        match &outcome {
            Ok(pair) => {
                info!(expires_at = pair.expires_at, "credential refresh succeeded");
                self.session.send_replace(SessionState::Active);
            }
            Err(error) => {
                warn!(
                    code = %error.code(),
                    details = error.raw_details().unwrap_or_default(),
                    "credential refresh failed, signing out"
                );
                if let Err(e) = self.store.delete().await {
                    warn!(error = %e, "failed to delete credentials after refresh failure");
                }
                self.session.send_replace(SessionState::SignedOut);
            }
        }

        guard.inner = None;
        self.settle(outcome);
    }

    async fn exchange(&self) -> RefreshOutcome {
        let current = match self.store.get().await {
            Some(pair) if !pair.refresh_token.is_empty() => pair,
            _ => {
                metrics::record_refresh("no_token");
                return Err(ClassifiedError::no_refresh_token());
            }
        };

        let response = session_auth::refresh_exchange(
            self.transport.as_ref(),
            &self.config.token_url,
            &current.refresh_token,
            self.config.timeout,
        )
        .await
        .map_err(|e| {
            metrics::record_refresh("failure");
            ClassifiedError::authentication_required(e.to_string())
        })?;

        let pair = CredentialPair::from_token_response(response, now_millis());
        self.store.set(pair.clone()).await.map_err(|e| {
            metrics::record_refresh("failure");
            ClassifiedError::authentication_required(format!(
                "persisting refreshed credentials: {e}"
            ))
        })?;

        metrics::record_refresh("success");
        Ok(pair)
    }

    /// Clear the in-flight flag and complete every queued waiter, in order.
    fn settle(&self, outcome: RefreshOutcome) {
        let waiters = {
            let mut state = self.lock_state();
            state.in_flight = false;
            state.generation += 1;
            std::mem::take(&mut state.waiters)
        };
        debug!(
            waiters = waiters.len(),
            ok = outcome.is_ok(),
            "credential refresh settled"
        );
        for waiter in waiters {
            // A dropped receiver is a cancelled request; nothing to deliver
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Settles with a failure if the refresh task unwinds before settling.
struct SettleGuard {
    inner: Option<Arc<Inner>>,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.settle(Err(ClassifiedError::new(
                ErrorCode::AuthenticationRequired,
                false,
                false,
            )
            .with_raw_details("refresh task aborted")));
        }
    }
}
