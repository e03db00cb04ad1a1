//! Scripted transport and fixtures shared by the crate's tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use session_auth::{CredentialPair, CredentialStore, MemoryCredentialStore};
use tokio::sync::Barrier;
use transport::{HeaderMap, HttpRequest, HttpResponse, Transport, TransportFailure};

use crate::coordinator::{RefreshConfig, RefreshCoordinator};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::stages::{HeaderInjection, default_stages};

pub const BASE_URL: &str = "https://api.test";
pub const TOKEN_URL: &str = "https://api.test/auth/refresh";

type ExchangeResult = Result<HttpResponse, TransportFailure>;
type RefreshHandler = Box<dyn Fn(usize) -> ExchangeResult + Send + Sync>;
type ApiHandler = Box<dyn Fn(&HttpRequest, usize) -> ExchangeResult + Send + Sync>;

/// Pair whose access token the default API handler rejects.
pub fn old_pair() -> CredentialPair {
    CredentialPair::new("at_old", "rt_old", 4_102_444_800_000)
}

pub fn token_body(access: &str, refresh: &str, expires_in: u64) -> String {
    serde_json::json!({
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": expires_in,
    })
    .to_string()
}

pub fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Routes token endpoint requests and API requests to separate handlers.
///
/// Defaults: the token endpoint issues `at_new`/`rt_new`; the API answers 200
/// for `Bearer at_new` and 401 for anything else.
pub struct ScriptedTransport {
    refresh: RefreshHandler,
    api: ApiHandler,
    refresh_delay: Duration,
    old_token_barrier: Option<Arc<Barrier>>,
    refresh_calls: AtomicUsize,
    api_calls: AtomicUsize,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            refresh: Box::new(|_| Ok(HttpResponse::new(200, token_body("at_new", "rt_new", 3600)))),
            api: Box::new(|request, _| match bearer(&request.headers) {
                Some("at_new") => Ok(HttpResponse::new(200, r#"{"ok":true}"#)),
                _ => Ok(HttpResponse::new(401, r#"{"message":"token expired"}"#)),
            }),
            refresh_delay: Duration::ZERO,
            old_token_barrier: None,
            refresh_calls: AtomicUsize::new(0),
            api_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn on_refresh(mut self, handler: impl Fn(usize) -> ExchangeResult + Send + Sync + 'static) -> Self {
        self.refresh = Box::new(handler);
        self
    }

    pub fn on_api(
        mut self,
        handler: impl Fn(&HttpRequest, usize) -> ExchangeResult + Send + Sync + 'static,
    ) -> Self {
        self.api = Box::new(handler);
        self
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    /// Hold requests carrying `at_old` until `parties` of them have arrived.
    pub fn with_old_token_barrier(mut self, parties: usize) -> Self {
        self.old_token_barrier = Some(Arc::new(Barrier::new(parties)));
        self
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn api_calls(&self) -> usize {
        self.api_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.refresh_calls() + self.api_calls()
    }

    pub fn refresh_requests(&self) -> Vec<HttpRequest> {
        self.recorded(|r| r.url == TOKEN_URL)
    }

    pub fn api_requests(&self) -> Vec<HttpRequest> {
        self.recorded(|r| r.url != TOKEN_URL)
    }

    fn recorded(&self, filter: impl Fn(&HttpRequest) -> bool) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| filter(r))
            .cloned()
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn execute(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = ExchangeResult> + Send + '_>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());

            if request.url == TOKEN_URL {
                let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                if !self.refresh_delay.is_zero() {
                    tokio::time::sleep(self.refresh_delay).await;
                }
                return (self.refresh)(call);
            }

            let call = self.api_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(barrier) = &self.old_token_barrier {
                if bearer(&request.headers) == Some("at_old") {
                    barrier.wait().await;
                }
            }
            (self.api)(&request, call)
        })
    }
}

/// Memory store whose `stall_at`-th read (zero-based) snapshots the pair,
/// then sleeps before returning it, like a caller descheduled mid-read.
pub struct StallingStore {
    inner: MemoryCredentialStore,
    stall_at: usize,
    stall: Duration,
    reads: AtomicUsize,
}

impl StallingStore {
    pub fn new(pair: CredentialPair, stall_at: usize, stall: Duration) -> Self {
        Self {
            inner: MemoryCredentialStore::with_pair(pair),
            stall_at,
            stall,
            reads: AtomicUsize::new(0),
        }
    }
}

impl CredentialStore for StallingStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<CredentialPair>> + Send + '_>> {
        Box::pin(async move {
            let read = self.reads.fetch_add(1, Ordering::SeqCst);
            let snapshot = self.inner.get().await;
            if read == self.stall_at {
                tokio::time::sleep(self.stall).await;
            }
            snapshot
        })
    }

    fn set(
        &self,
        pair: CredentialPair,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + '_>> {
        self.inner.set(pair)
    }

    fn delete(&self) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + '_>> {
        self.inner.delete()
    }
}

pub fn coordinator_for(
    store: Arc<dyn CredentialStore>,
    transport: Arc<ScriptedTransport>,
) -> RefreshCoordinator {
    RefreshCoordinator::new(store, transport, RefreshConfig::new(TOKEN_URL))
}

/// Pipeline against `BASE_URL` with the standard stages (`ios`, `1.4.0`,
/// static header `x-client: tests`).
pub fn pipeline_for(
    store: Arc<dyn CredentialStore>,
    transport: Arc<ScriptedTransport>,
) -> Pipeline {
    let stages = default_stages(
        "ios",
        "1.4.0",
        vec![HeaderInjection {
            name: "x-client".into(),
            value: "tests".into(),
        }],
    )
    .unwrap();
    let coordinator = coordinator_for(store, transport.clone());
    Pipeline::new(
        PipelineConfig::new(BASE_URL).unwrap(),
        transport,
        coordinator,
        stages,
    )
}
