//! Typed views over sections of the config tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::migration::{DEFAULT_HOST, DEFAULT_PORT, DEFAULT_PROJECT_ID};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_project")]
    pub default_project: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            default_project: default_project(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default)]
    pub jwt_expires_in: Option<String>,
    #[serde(default)]
    pub session_secret: String,
    #[serde(default)]
    pub service_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevSettings {
    #[serde(default = "yes")]
    pub enable_logging: bool,
    #[serde(default = "yes")]
    pub enable_cors: bool,
}

impl Default for DevSettings {
    fn default() -> Self {
        Self {
            enable_logging: true,
            enable_cors: true,
        }
    }
}

/// One project from `projects[]`, without its plugin map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// A plugin's entry under `projects[p].plugins.<id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEntry {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_by_dependency: Option<String>,
    /// Plugin directory; relative paths resolve against the config file's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default)]
    pub suppressed: bool,
    /// Operator settings for the plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

fn default_port() -> u16 {
    u16::try_from(DEFAULT_PORT).unwrap_or(3012)
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_project() -> String {
    DEFAULT_PROJECT_ID.to_string()
}

fn yes() -> bool {
    true
}
