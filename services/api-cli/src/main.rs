//! API client
//!
//! Diagnostic command-line client over the resilient API core:
//! 1. Loads `[api]`, `[credentials]`, `[retry]` and `[[headers]]` from TOML
//! 2. Keeps the session's credential pair in a local credentials file
//! 3. Sends authenticated requests with refresh-on-401 and retry
//! 4. Prints every outcome as an `ApiResult` JSON document

mod cli;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use api_core::{
    ApiClient, ApiResult, ClassifiedError, Pipeline, RefreshConfig, RefreshCoordinator,
    RequestOptions, default_stages, refresh_cycle,
};
use serde::Serialize;
use session_auth::{CredentialPair, CredentialStore, FileCredentialStore, now_millis};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{ReqwestTransport, Transport};

use crate::cli::{Cli, Command};
use crate::config::Config;

/// Everything a command needs, built once from configuration.
struct App {
    client: ApiClient,
    coordinator: RefreshCoordinator,
    refresh_threshold: Duration,
}

impl App {
    async fn build(config: &Config) -> Result<Self> {
        let store = FileCredentialStore::load(config.credentials.path.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to open credentials file {}",
                    config.credentials.path.display()
                )
            })?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("api-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(http));

        let coordinator = RefreshCoordinator::new(
            Arc::new(store),
            transport.clone(),
            RefreshConfig::new(config.token_url()),
        );
        let stages = default_stages(
            &config.api.platform,
            &config.api.app_version,
            config.headers.clone(),
        )?;
        let pipeline = Pipeline::new(
            config.pipeline_config()?,
            transport,
            coordinator.clone(),
            stages,
        );
        let client = ApiClient::new(pipeline, config.retry_policy()?).with_reporter(
            |e: &ClassifiedError| {
                error!(
                    code = %e.code(),
                    status = e.status(),
                    endpoint = %e.context().endpoint,
                    attempts = e.context().attempt + 1,
                    "server failure after exhausting retries"
                );
            },
        );

        Ok(Self {
            client,
            coordinator,
            refresh_threshold: Duration::from_secs(config.credentials.refresh_threshold_secs),
        })
    }

    /// Run one command and print its outcome. Returns whether it succeeded.
    async fn run(&self, command: Command) -> Result<bool> {
        match command {
            Command::Login {
                access,
                refresh,
                expires_in,
            } => {
                let expires_at = now_millis().saturating_add(expires_in.saturating_mul(1000));
                self.coordinator
                    .sign_in(CredentialPair::new(access, refresh, expires_at))
                    .await
                    .context("failed to store credentials")?;
                info!(expires_at, "credentials stored");
                print_json(&ApiResult::ok(SessionStatus::signed_in(expires_at)))?;
                Ok(true)
            }
            Command::Logout => {
                self.coordinator
                    .sign_out()
                    .await
                    .context("failed to delete credentials")?;
                print_json(&ApiResult::ok(SessionStatus::signed_out()))?;
                Ok(true)
            }
            Command::Status => {
                let status = match self.coordinator.store().get().await {
                    Some(pair) => SessionStatus::signed_in(pair.expires_at),
                    None => SessionStatus::signed_out(),
                };
                print_json(&ApiResult::ok(status))?;
                Ok(true)
            }
            Command::Refresh { force: true } => {
                let result: ApiResult<SessionStatus> = self
                    .coordinator
                    .refresh()
                    .await
                    .map(|pair| SessionStatus::signed_in(pair.expires_at))
                    .into();
                print_json(&result)?;
                Ok(result.success)
            }
            Command::Refresh { force: false } => {
                let outcome = refresh_cycle(&self.coordinator, self.refresh_threshold).await;
                info!(outcome = outcome.as_str(), "refresh cycle finished");
                let ok = outcome != api_core::CycleOutcome::Failed;
                print_json(&serde_json::json!({
                    "success": ok,
                    "data": { "outcome": outcome.as_str() },
                }))?;
                Ok(ok)
            }
            Command::Request {
                method,
                path,
                data,
                skip_auth,
                timeout,
            } => {
                let options = RequestOptions {
                    timeout,
                    skip_auth,
                    ..RequestOptions::default()
                };
                let result: ApiResult<serde_json::Value> = self
                    .client
                    .try_request(method, &path, data.as_ref(), &options, None)
                    .await
                    .into();
                print_json(&result)?;
                Ok(result.success)
            }
        }
    }
}

/// Session summary printed by login, logout, status and refresh. Never
/// includes tokens.
#[derive(Debug, Serialize, PartialEq)]
struct SessionStatus {
    signed_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expired: Option<bool>,
}

impl SessionStatus {
    fn signed_in(expires_at: u64) -> Self {
        Self {
            signed_in: true,
            expires_at: Some(expires_at),
            expired: Some(expires_at <= now_millis()),
        }
    }

    fn signed_out() -> Self {
        Self {
            signed_in: false,
            expires_at: None,
            expired: None,
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render result")?;
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs to stderr, LOG_LEVEL / RUST_LOG support; stdout carries results
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    // Install the recorder before any metrics are emitted
    let prometheus = if cli.metrics {
        Some(metrics::install_recorder().context("failed to install Prometheus recorder")?)
    } else {
        None
    };

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        base_url = %config.api.base_url,
        platform = %config.api.platform,
        headers = config.headers.len(),
        max_retries = config.retry.max_retries,
        "configuration loaded"
    );

    let app = App::build(&config).await?;
    let succeeded = app.run(cli.command).await?;

    if let Some(handle) = prometheus {
        print!("{}", handle.render());
    }

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
