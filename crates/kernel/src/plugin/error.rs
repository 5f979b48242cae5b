//! Plugin system error types with clear, actionable messages.
//!
//! All errors include the plugin name and relevant context to help
//! operators quickly identify and fix issues.

use keystone_sdk::ErrorKind;
use thiserror::Error;

use super::record::PluginState;
use crate::config_store::ConfigError;
use crate::host::HostError;

/// Errors raised while reading, merging, and validating plugin manifests.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A manifest or entry file could not be read from disk.
    #[error("plugin directory '{path}': failed to read {file}: {details}")]
    Unreadable {
        path: String,
        file: String,
        details: String,
    },

    /// The manifest could not be parsed or failed validation.
    #[error("plugin '{plugin}': invalid manifest: {details}")]
    InvalidManifest { plugin: String, details: String },

    /// The entry file names a module the host binary does not provide.
    #[error(
        "plugin '{plugin}': entry file names module '{module}' which is not compiled into this runtime. Available modules: {available}"
    )]
    UnknownModule {
        plugin: String,
        module: String,
        available: String,
    },

    /// The manifest declares a hook the module does not export.
    #[error("plugin '{plugin}': declares hook '{hook}' in manifest but the module does not export it")]
    MissingHookExport { plugin: String, hook: String },

    /// The manifest declares hooks but no entry module exists to provide them.
    #[error(
        "plugin '{plugin}': declares hooks ({hooks}) but has no entry module; add plugin.toml with `module = \"...\"`"
    )]
    HooksWithoutModule { plugin: String, hooks: String },

    /// The plugin targets a runtime version this kernel does not satisfy.
    #[error("plugin '{plugin}': requires runtime '{constraint}', this is {runtime}")]
    IncompatibleRuntime {
        plugin: String,
        constraint: String,
        runtime: String,
    },

    /// No plugin with this id is known.
    #[error("plugin '{plugin}': not found")]
    NotFound { plugin: String },

    /// The plugin's directory is gone.
    #[error("plugin '{plugin}': directory {path} no longer exists")]
    DirectoryGone { plugin: String, path: String },
}

impl PluginError {
    pub fn invalid(plugin: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvalidManifest {
            plugin: plugin.into(),
            details: details.into(),
        }
    }

    pub fn unknown_module(plugin: impl Into<String>, module: impl Into<String>, available: &[String]) -> Self {
        let available = if available.is_empty() {
            "none".to_string()
        } else {
            available.join(", ")
        };
        Self::UnknownModule {
            plugin: plugin.into(),
            module: module.into(),
            available,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unreadable { .. } | Self::DirectoryGone { .. } => ErrorKind::Io,
            _ => ErrorKind::Validation,
        }
    }
}

/// Errors raised by lifecycle transitions.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("plugin '{0}': not found")]
    NotFound(String),

    /// The operation is not valid from the plugin's current state.
    #[error("plugin '{plugin}': cannot {operation} while {state}")]
    InvalidState {
        plugin: String,
        state: PluginState,
        operation: &'static str,
    },

    /// The dependency graph reachable from the target contains a cycle.
    #[error("circular dependency detected involving plugins: {}", plugins.join(", "))]
    Cycle { plugins: Vec<String> },

    /// One or more dependencies cannot be activated.
    #[error("plugin '{plugin}': dependencies cannot be satisfied: {}", blocking.join(", "))]
    DependencyUnmet {
        plugin: String,
        blocking: Vec<String>,
    },

    /// A lifecycle hook returned an error or panicked.
    #[error("plugin '{plugin}': hook '{hook}' failed: {message}")]
    HookFailure {
        plugin: String,
        hook: &'static str,
        message: String,
    },

    /// The operation's deadline passed; the plugin was left in its prior state.
    #[error("plugin '{plugin}': {operation} did not finish before the deadline")]
    DeadlineExceeded {
        plugin: String,
        operation: &'static str,
    },

    #[error(transparent)]
    Manifest(#[from] PluginError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::Conflict,
            Self::Cycle { .. } => ErrorKind::Validation,
            Self::DependencyUnmet { .. } => ErrorKind::DependencyUnmet,
            Self::HookFailure { .. } => ErrorKind::HookFailure,
            Self::DeadlineExceeded { .. } => ErrorKind::Timeout,
            Self::Manifest(e) => e.kind(),
            Self::Host(e) => e.kind(),
            Self::Config(e) => e.kind(),
        }
    }

    /// Extra structured detail for API responses.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::DependencyUnmet { blocking, .. } => {
                Some(serde_json::json!({ "blocking": blocking }))
            }
            Self::Cycle { plugins } => Some(serde_json::json!({ "cycle": plugins })),
            _ => None,
        }
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn unknown_module_lists_available() {
        let err = PluginError::unknown_module(
            "shop",
            "shopping",
            &["economy".to_string(), "inventory".to_string()],
        );
        let msg = err.to_string();
        assert!(msg.contains("shopping"));
        assert!(msg.contains("economy, inventory"));
    }

    #[test]
    fn hooks_without_module_suggests_entry_file() {
        let err = PluginError::HooksWithoutModule {
            plugin: "shop".into(),
            hooks: "on_load".into(),
        };
        assert!(err.to_string().contains("plugin.toml"));
    }

    #[test]
    fn dependency_unmet_carries_blocking_list() {
        let err = LifecycleError::DependencyUnmet {
            plugin: "shop".into(),
            blocking: vec!["economy".into()],
        };
        assert_eq!(err.kind(), ErrorKind::DependencyUnmet);
        assert_eq!(err.details().unwrap()["blocking"][0], "economy");
    }

    #[test]
    fn deadline_maps_to_timeout() {
        let err = LifecycleError::DeadlineExceeded {
            plugin: "shop".into(),
            operation: "enable",
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
