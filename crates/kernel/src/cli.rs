//! `keystone plugins ...` client.
//!
//! Talks to a running server's control plane with the service token from
//! the config file. Exit codes: 0 success, 1 validation or lifecycle
//! failure, 2 server unreachable.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

use crate::config_store::ConfigStore;

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_UNREACHABLE: u8 = 2;

#[derive(Debug, Clone, Subcommand)]
pub enum PluginCommand {
    /// List every plugin in the catalog.
    List,
    /// Show one plugin.
    Show { id: String },
    /// Enable a plugin and its dependencies.
    Enable {
        id: String,
        /// Deadline in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Disable a plugin.
    Disable {
        id: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Disable and re-enable a plugin with a freshly read manifest.
    Reload {
        id: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Check the catalog for broken dependencies.
    Validate,
}

impl PluginCommand {
    fn request(&self) -> (Method, String) {
        fn lifecycle(id: &str, action: &str, timeout_ms: Option<u64>) -> String {
            match timeout_ms {
                Some(ms) => format!("/plugins/{id}/{action}?timeout_ms={ms}"),
                None => format!("/plugins/{id}/{action}"),
            }
        }

        match self {
            Self::List => (Method::GET, "/plugins".to_string()),
            Self::Show { id } => (Method::GET, format!("/plugins/{id}")),
            Self::Enable { id, timeout_ms } => (Method::POST, lifecycle(id, "enable", *timeout_ms)),
            Self::Disable { id, timeout_ms } => {
                (Method::POST, lifecycle(id, "disable", *timeout_ms))
            }
            Self::Reload { id, timeout_ms } => (Method::POST, lifecycle(id, "reload", *timeout_ms)),
            Self::Validate => (Method::POST, "/plugins/validate".to_string()),
        }
    }
}

/// Outcome of one control-plane call.
#[derive(Debug)]
pub enum Outcome {
    Success(Value),
    Failure { status: StatusCode, body: Value },
    Unreachable(String),
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Success(body) if body.get("valid") == Some(&Value::Bool(false)) => EXIT_FAILURE,
            Self::Success(_) => EXIT_OK,
            Self::Failure { .. } => EXIT_FAILURE,
            Self::Unreachable(_) => EXIT_UNREACHABLE,
        }
    }
}

/// Control-plane client.
pub struct ControlClient {
    http: Client,
    base_url: String,
    token: String,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    /// Client for the server described by the config file at `path`.
    pub fn from_config(path: &Path) -> Result<Self> {
        let config = ConfigStore::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        let server = config.server();
        let host = match server.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1".to_string(),
            host => host.to_string(),
        };
        Self::new(
            format!("http://{host}:{}", server.port),
            config.auth().service_token,
        )
    }

    pub async fn send(&self, command: &PluginCommand) -> Outcome {
        let (method, path) = command.request();
        let url = format!("{}{path}", self.base_url);

        let response = match self
            .http
            .request(method, &url)
            .bearer_auth(&self.token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_connect() || e.is_timeout() => {
                return Outcome::Unreachable(format!("{}: {e}", self.base_url));
            }
            Err(e) => {
                return Outcome::Failure {
                    status: StatusCode::BAD_GATEWAY,
                    body: serde_json::json!({ "error": e.to_string() }),
                };
            }
        };

        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        if status.is_success() {
            Outcome::Success(body)
        } else {
            Outcome::Failure { status, body }
        }
    }
}

/// Run one `plugins` subcommand and print its result.
pub async fn run(config_path: &Path, command: PluginCommand) -> ExitCode {
    let client = match ControlClient::from_config(config_path) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let outcome = client.send(&command).await;
    match &outcome {
        Outcome::Success(body) => println!("{}", pretty(body)),
        Outcome::Failure { status, body } => {
            eprintln!("error ({status}): {}", pretty(body));
        }
        Outcome::Unreachable(message) => eprintln!("server unreachable: {message}"),
    }
    ExitCode::from(outcome.exit_code())
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
