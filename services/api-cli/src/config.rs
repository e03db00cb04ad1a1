//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Tokens never live in the TOML; they are kept in the credentials file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use api_core::{ConfigError, HeaderInjection, PipelineConfig, RetryPolicy};
use serde::Deserialize;
use session_auth::DEFAULT_TOKEN_PATH;

const DEFAULT_CONFIG_FILE: &str = "api-client.toml";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
}

/// API endpoint settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Refresh before sending when the token expires within this window (0 disables)
    #[serde(default)]
    pub refresh_ahead_secs: u64,
    /// Token endpoint, relative to `base_url` or absolute
    #[serde(default = "default_token_path")]
    pub token_path: String,
}

/// Credential storage settings
#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_credentials_path")]
    pub path: PathBuf,
    /// `refresh` command refreshes when the token expires within this window
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: default_credentials_path(),
            refresh_threshold_secs: default_refresh_threshold(),
        }
    }
}

/// Backoff settings for the default retry policy
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: 0.0,
        }
    }
}

fn default_platform() -> String {
    "cli".to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_token_path() -> String {
    DEFAULT_TOKEN_PATH.to_string()
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_refresh_threshold() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    api_core::retry::DEFAULT_MAX_RETRIES
}

fn default_base_delay_ms() -> u64 {
    api_core::retry::DEFAULT_BASE_DELAY.as_millis() as u64
}

fn default_max_delay_ms() -> u64 {
    api_core::retry::DEFAULT_MAX_DELAY.as_millis() as u64
}

fn default_backoff_multiplier() -> f64 {
    api_core::retry::DEFAULT_BACKOFF_MULTIPLIER
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// `API_BASE_URL` overrides `[api].base_url`.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("API_BASE_URL") {
            config.api.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::invalid("api.timeout_secs", "must be greater than 0"));
        }

        if self.api.platform.trim().is_empty() {
            return Err(common::Error::invalid("api.platform", "must not be empty"));
        }

        // Policy and pipeline constructors carry the backoff and URL rules
        self.retry_policy()
            .map_err(|e| common::Error::invalid("retry", e.to_string()))?;
        self.pipeline_config()
            .map_err(|e| common::Error::invalid("api", e.to_string()))?;
        Ok(())
    }

    /// Default retry policy described by `[retry]`.
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let retry = &self.retry;
        RetryPolicy::new(
            retry.max_retries,
            Duration::from_millis(retry.base_delay_ms),
            Duration::from_millis(retry.max_delay_ms),
            retry.backoff_multiplier,
        )?
        .with_jitter(retry.jitter)
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        Ok(PipelineConfig::new(&self.api.base_url)?
            .with_timeout(Duration::from_secs(self.api.timeout_secs))?
            .with_refresh_ahead(Duration::from_secs(self.api.refresh_ahead_secs)))
    }

    /// Absolute token endpoint URL.
    pub fn token_url(&self) -> String {
        let path = &self.api.token_path;
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.clone();
        }
        format!(
            "{}/{}",
            self.api.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[api]
base_url = "https://api.example.com/"
platform = "ios"
app_version = "3.2.0"

[retry]
max_retries = 2
base_delay_ms = 250

[[headers]]
name = "x-client"
value = "api-client"
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("API_BASE_URL") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.api.platform, "ios");
        assert_eq!(config.api.app_version, "3.2.0");
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.api.refresh_ahead_secs, 0);
        assert_eq!(config.credentials.path, PathBuf::from("credentials.json"));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert_eq!(config.headers.len(), 1);
        assert_eq!(config.token_url(), "https://api.example.com/auth/refresh");

        let policy = config.retry_policy().unwrap();
        assert_eq!(policy.max_retries(), 2);
        assert_eq!(policy.base_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("API_BASE_URL") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[api]\nbase_url = \"http://localhost:8080\"\n");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.api.platform, "cli");
        assert_eq!(config.api.token_path, "/auth/refresh");
        assert_eq!(config.credentials.refresh_threshold_secs, 300);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert!(config.headers.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("API_BASE_URL") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[api]\nbase_url = \"ftp://files.example.com\"\n");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("http://"), "{err}");
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("API_BASE_URL") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[api]\nbase_url = \"https://api.example.com\"\ntimeout_secs = 0\n",
        );
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(
            err,
            common::Error::InvalidValue {
                field: "api.timeout_secs",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_invalid_backoff() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("API_BASE_URL") };
        let dir = tempfile::tempdir().unwrap();
        for retry in [
            "backoff_multiplier = 1.0",
            "base_delay_ms = 5000\nmax_delay_ms = 100",
            "jitter = 1.5",
        ] {
            let path = write_config(
                &dir,
                &format!("[api]\nbase_url = \"https://api.example.com\"\n\n[retry]\n{retry}\n"),
            );
            let err = Config::load(&path).unwrap_err();
            assert!(
                matches!(err, common::Error::InvalidValue { field: "retry", .. }),
                "{retry}: {err}"
            );
        }
    }

    #[test]
    fn test_base_url_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe { set_env("API_BASE_URL", "https://staging.example.com") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("API_BASE_URL") };

        assert_eq!(config.api.base_url, "https://staging.example.com");
        assert_eq!(config.token_url(), "https://staging.example.com/auth/refresh");
    }

    #[test]
    fn test_absolute_token_path_is_used_verbatim() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("API_BASE_URL") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[api]\nbase_url = \"https://api.example.com\"\ntoken_path = \"https://auth.example.com/token\"\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.token_url(), "https://auth.example.com/token");
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("api-client.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }
}
