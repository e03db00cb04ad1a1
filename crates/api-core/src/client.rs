//! Caller-facing client
//!
//! `ApiClient` wraps the pipeline in the retry executor and folds the outcome
//! into `ApiResult`, the only shape the rest of the application sees. Server
//! failures that survive every retry go to the configured `ErrorReporter`.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error};
use transport::Method;

use crate::error::{ClassifiedError, ErrorCode};
use crate::metrics;
use crate::pipeline::{Pipeline, RequestContext, RequestOptions};
use crate::retry::{RetryPolicy, execute_with_retry};

/// External monitoring hook for final, reportable failures.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &ClassifiedError);
}

impl<F> ErrorReporter for F
where
    F: Fn(&ClassifiedError) + Send + Sync,
{
    fn report(&self, error: &ClassifiedError) {
        self(error)
    }
}

/// Code and user-facing message of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Result of a call as presented to the application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

impl<T> ApiResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: &ClassifiedError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: error.code(),
                message: error.user_message().to_string(),
            }),
        }
    }
}

impl<T> From<Result<T, ClassifiedError>> for ApiResult<T> {
    fn from(result: Result<T, ClassifiedError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(error) => Self::failure(&error),
        }
    }
}

pub struct ApiClient {
    pipeline: Arc<Pipeline>,
    default_policy: RetryPolicy,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl ApiClient {
    pub fn new(pipeline: Pipeline, default_policy: RetryPolicy) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            default_policy,
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: impl ErrorReporter + 'static) -> Self {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Send a call under `policy` (or the default) and decode the JSON body.
    ///
    /// Every attempt shares one request id. Failures are logged with their raw
    /// details at debug level and reported only once retries are exhausted.
    pub async fn try_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        options: &RequestOptions,
        policy: Option<&RetryPolicy>,
    ) -> Result<T, ClassifiedError> {
        let policy = policy.unwrap_or(&self.default_policy);
        let base = RequestContext::new();
        let started = Instant::now();

        let result = execute_with_retry(policy, |attempt| {
            let ctx = base.for_attempt(attempt);
            let method = method.clone();
            async move {
                self.pipeline
                    .send_with_context(ctx, method, path, body, options)
                    .await?
                    .json::<T>()
            }
        })
        .await;

        metrics::record_call(
            result.as_ref().err().map(ClassifiedError::code),
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = &result {
            debug!(
                request_id = %base.request_id,
                code = %e.code(),
                status = e.status(),
                attempt = e.context().attempt,
                details = e.raw_details().unwrap_or_default(),
                "request failed"
            );
            if e.should_report() {
                error!(request_id = %base.request_id, code = %e.code(), path, "reporting server failure");
                metrics::record_reported(e.code());
                if let Some(reporter) = &self.reporter {
                    reporter.report(e);
                }
            }
        }
        result
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        policy: Option<&RetryPolicy>,
    ) -> ApiResult<T> {
        self.try_request(method, path, body, &RequestOptions::default(), policy)
            .await
            .into()
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.request(Method::GET, path, None, None).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> ApiResult<T> {
        self.request(Method::POST, path, Some(body), None).await
    }

    pub async fn put<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> ApiResult<T> {
        self.request(Method::PUT, path, Some(body), None).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.request(Method::DELETE, path, None, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedTransport, old_pair, pipeline_for};
    use serde::Deserialize;
    use session_auth::MemoryCredentialStore;
    use std::sync::Mutex;
    use std::time::Duration;
    use transport::HttpResponse;

    #[derive(Debug, Deserialize, PartialEq)]
    struct List {
        id: u64,
        title: String,
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
        )
        .unwrap()
    }

    fn client(transport: ScriptedTransport, max_retries: u32) -> (ApiClient, Arc<ScriptedTransport>) {
        let store = Arc::new(MemoryCredentialStore::with_pair(old_pair()));
        let transport = Arc::new(transport);
        let pipeline = pipeline_for(store, transport.clone());
        (ApiClient::new(pipeline, fast_policy(max_retries)), transport)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let (client, transport) = client(
            ScriptedTransport::new().on_api(|_, call| match call {
                0 | 1 => Ok(HttpResponse::new(500, "boom")),
                _ => Ok(HttpResponse::new(200, r#"{"id":1,"title":"Groceries"}"#)),
            }),
            2,
        );
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let client = client.with_reporter(move |e: &ClassifiedError| sink.lock().unwrap().push(e.code()));

        let start = tokio::time::Instant::now();
        let result: ApiResult<List> = client.get("/lists/1").await;
        assert!(result.success);
        assert_eq!(
            result.data,
            Some(List {
                id: 1,
                title: "Groceries".into()
            })
        );
        assert_eq!(transport.api_calls(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert!(reported.lock().unwrap().is_empty());

        let ids: Vec<_> = transport
            .api_requests()
            .iter()
            .map(|r| r.headers.get("x-request-id").unwrap().clone())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_server_failure_is_reported_once() {
        let (client, transport) = client(
            ScriptedTransport::new().on_api(|_, _| Ok(HttpResponse::new(503, "busy"))),
            2,
        );
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let client = client.with_reporter(move |e: &ClassifiedError| {
            sink.lock().unwrap().push((e.code(), e.context().attempt))
        });

        let result: ApiResult<List> = client.get("/lists").await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code, ErrorCode::ServerError);
        assert_eq!(error.message, ErrorCode::ServerError.default_message());
        assert_eq!(transport.api_calls(), 3);
        assert_eq!(*reported.lock().unwrap(), vec![(ErrorCode::ServerError, 2)]);
    }

    #[tokio::test]
    async fn user_errors_are_not_retried_or_reported() {
        let (client, transport) = client(
            ScriptedTransport::new()
                .on_api(|_, _| Ok(HttpResponse::new(404, r#"{"message":"List not found"}"#))),
            3,
        );
        let reported = Arc::new(Mutex::new(0usize));
        let sink = reported.clone();
        let client = client.with_reporter(move |_: &ClassifiedError| *sink.lock().unwrap() += 1);

        let result: ApiResult<List> = client.delete("/lists/9").await;
        assert_eq!(
            result.error,
            Some(ApiErrorBody {
                code: ErrorCode::NotFound,
                message: "List not found".into()
            })
        );
        assert_eq!(transport.api_calls(), 1);
        assert_eq!(*reported.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_token_recovers_inside_retry_wrapper() {
        let (client, transport) = client(ScriptedTransport::new(), 3);

        let result: ApiResult<serde_json::Value> = client
            .post("/lists", &serde_json::json!({"title": "Weekend"}))
            .await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["ok"], true);
        assert_eq!(transport.api_calls(), 2);
        assert_eq!(transport.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn per_call_policy_overrides_default() {
        let (client, transport) = client(
            ScriptedTransport::new().on_api(|_, _| Ok(HttpResponse::new(502, ""))),
            3,
        );

        let result: ApiResult<List> = client
            .request(Method::PUT, "/lists/1", None, Some(&RetryPolicy::no_retry()))
            .await;
        assert_eq!(result.error.unwrap().code, ErrorCode::ServerError);
        assert_eq!(transport.api_calls(), 1);
    }

    #[tokio::test]
    async fn undecodable_success_body_is_unknown() {
        let (client, transport) = client(
            ScriptedTransport::new().on_api(|_, _| Ok(HttpResponse::new(200, "not json"))),
            3,
        );

        let result = client
            .try_request::<List>(Method::GET, "/lists/1", None, &RequestOptions::default(), None)
            .await;
        assert_eq!(result.unwrap_err().code(), ErrorCode::Unknown);
        assert_eq!(transport.api_calls(), 1);
    }

    #[test]
    fn api_result_serializes_without_absent_members() {
        let ok: ApiResult<serde_json::Value> = ApiResult::ok(serde_json::json!({"id": 1}));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"success": true, "data": {"id": 1}})
        );

        let err = ClassifiedError::new(ErrorCode::Conflict, false, true).with_raw_details("etag");
        let failed: ApiResult<serde_json::Value> = Err(err).into();
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({
                "success": false,
                "error": {"code": "CONFLICT", "message": ErrorCode::Conflict.default_message()}
            })
        );
    }
}
