//! Bootstrap settings loaded from environment variables.
//!
//! These only say where things are. Everything the runtime itself is
//! configured with lives in the YAML config file.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Process bootstrap configuration.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    /// Path to the YAML config file (default: ./config.yml).
    pub config_path: PathBuf,

    /// Bundled plugins (default: ./plugins).
    pub core_plugins_dir: PathBuf,

    /// Operator plugins (default: ./user_plugins).
    pub user_plugins_dir: PathBuf,

    /// Example plugins, scanned last when set.
    pub example_plugins_dir: Option<PathBuf>,

    /// Maximum database connections in pool (default: 5).
    pub database_max_connections: u32,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("./config.yml"),
            core_plugins_dir: PathBuf::from("./plugins"),
            user_plugins_dir: PathBuf::from("./user_plugins"),
            example_plugins_dir: None,
            database_max_connections: 5,
        }
    }
}

impl Bootstrap {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config_path = env::var("KEYSTONE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or(defaults.config_path);

        let core_plugins_dir = env::var("CORE_PLUGINS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.core_plugins_dir);

        let user_plugins_dir = env::var("USER_PLUGINS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.user_plugins_dir);

        let example_plugins_dir = env::var("EXAMPLE_PLUGINS_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let database_max_connections = match env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(v) => v
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?,
            Err(_) => defaults.database_max_connections,
        };

        Ok(Self {
            config_path,
            core_plugins_dir,
            user_plugins_dir,
            example_plugins_dir,
            database_max_connections,
        })
    }
}
