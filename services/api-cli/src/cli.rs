//! Command-line interface
//!
//! `api-client [--config PATH] [--metrics] <command> [args]`

use std::time::Duration;

use clap::{Parser, Subcommand};
use transport::Method;

const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Diagnostic client for the authenticated API
#[derive(Debug, Parser)]
#[command(name = "api-client", version)]
pub struct Cli {
    /// Config file (default: $CONFIG_PATH, then ./api-client.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<String>,

    /// Print Prometheus metrics after the command runs
    #[arg(long, global = true)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Subcommand)]
pub enum Command {
    /// Store a credential pair obtained by signing in
    Login {
        #[arg(long, value_name = "TOKEN")]
        access: String,

        #[arg(long, value_name = "TOKEN")]
        refresh: String,

        /// Seconds until the access token expires
        #[arg(long, value_name = "SECS", default_value_t = DEFAULT_EXPIRES_IN_SECS)]
        expires_in: u64,
    },

    /// Delete stored credentials
    Logout,

    /// Show whether a session is stored and when it expires
    Status,

    /// Refresh the token if it expires within the configured threshold
    Refresh {
        /// Refresh regardless of expiry
        #[arg(long)]
        force: bool,
    },

    /// Send one request and print the result envelope
    Request {
        #[arg(value_parser = parse_method)]
        method: Method,

        /// Path relative to the base URL, or an absolute URL
        path: String,

        /// JSON request body
        #[arg(long, value_name = "JSON", value_parser = parse_json)]
        data: Option<serde_json::Value>,

        /// Send without credentials
        #[arg(long = "no-auth")]
        skip_auth: bool,

        /// Per-request timeout in seconds
        #[arg(long, value_name = "SECS", value_parser = parse_timeout)]
        timeout: Option<Duration>,
    },
}

fn parse_method(raw: &str) -> Result<Method, String> {
    Method::from_bytes(raw.to_ascii_uppercase().as_bytes()).map_err(|e| e.to_string())
}

fn parse_json(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| e.to_string())
}

fn parse_timeout(raw: &str) -> Result<Duration, String> {
    let secs: u64 = raw.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
    if secs == 0 {
        return Err("must be greater than 0".into());
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(line: &str) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("api-client").chain(line.split_whitespace()))
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_are_accepted_anywhere() {
        let cli = parse("status --config /etc/api.toml --metrics").unwrap();
        assert_eq!(cli.config.as_deref(), Some("/etc/api.toml"));
        assert!(cli.metrics);
        assert_eq!(cli.command, Command::Status);

        let cli = parse("--metrics logout").unwrap();
        assert_eq!(cli.command, Command::Logout);
        assert!(cli.config.is_none());
    }

    #[test]
    fn login_requires_both_tokens() {
        let cli = parse("login --access at_1 --refresh rt_1 --expires-in 900").unwrap();
        assert_eq!(
            cli.command,
            Command::Login {
                access: "at_1".into(),
                refresh: "rt_1".into(),
                expires_in: 900,
            }
        );

        let cli = parse("login --access at_1 --refresh rt_1").unwrap();
        assert!(matches!(cli.command, Command::Login { expires_in: 3600, .. }));

        assert_eq!(
            parse("login --access at_1").unwrap_err().kind(),
            ErrorKind::MissingRequiredArgument
        );
        assert!(parse("login --access").is_err());
    }

    #[test]
    fn request_parses_method_path_and_body() {
        let cli = parse(r#"request post /lists --data {"title":"Weekend"} --timeout 5"#).unwrap();
        match cli.command {
            Command::Request {
                method,
                path,
                data,
                skip_auth,
                timeout,
            } => {
                assert_eq!(method, Method::POST);
                assert_eq!(path, "/lists");
                assert_eq!(data.unwrap()["title"], "Weekend");
                assert!(!skip_auth);
                assert_eq!(timeout, Some(Duration::from_secs(5)));
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = parse("request GET /health --no-auth").unwrap();
        assert!(matches!(cli.command, Command::Request { skip_auth: true, .. }));
    }

    #[test]
    fn request_rejects_bad_input() {
        assert_eq!(
            parse("request GET").unwrap_err().kind(),
            ErrorKind::MissingRequiredArgument
        );
        assert_eq!(
            parse("request GET /lists --data {nope").unwrap_err().kind(),
            ErrorKind::ValueValidation
        );
        assert_eq!(
            parse("request GET /lists --timeout 0").unwrap_err().kind(),
            ErrorKind::ValueValidation
        );
        assert_eq!(
            parse("request GET /lists extra").unwrap_err().kind(),
            ErrorKind::UnknownArgument
        );
    }

    #[test]
    fn refresh_and_unknown_commands() {
        assert_eq!(
            parse("refresh --force").unwrap().command,
            Command::Refresh { force: true }
        );
        assert!(parse("").is_err());
        assert_eq!(
            parse("fetch /lists").unwrap_err().kind(),
            ErrorKind::InvalidSubcommand
        );
        assert_eq!(
            parse("status now").unwrap_err().kind(),
            ErrorKind::UnknownArgument
        );
    }

    #[test]
    fn timeout_parser_rejects_zero_and_garbage() {
        assert_eq!(parse_timeout("30"), Ok(Duration::from_secs(30)));
        assert!(parse_timeout("0").unwrap_err().contains("greater than 0"));
        assert!(parse_timeout("soon").is_err());
    }
}
