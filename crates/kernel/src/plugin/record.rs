//! The runtime's view of a plugin.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::manifest::PluginManifest;

/// Which scan root a plugin came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Core,
    User,
    Example,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::User => "user",
            Self::Example => "example",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "core" => Some(Self::Core),
            "user" => Some(Self::User),
            "example" => Some(Self::Example),
            _ => None,
        }
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Discovered,
    Loaded,
    Active,
    Disabled,
    Failed,
    Missing,
    Suppressed,
}

impl PluginState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loaded => "loaded",
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Failed => "failed",
            Self::Missing => "missing",
            Self::Suppressed => "suppressed",
        }
    }

    /// States whose module instance is live and must not be replaced by a rescan.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Loaded | Self::Active)
    }

    /// States with no files on disk behind them.
    pub fn is_absent(self) -> bool {
        matches!(self, Self::Missing | Self::Suppressed)
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The phase a Failed plugin failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedPhase {
    ManifestLoad,
    Load,
    Activate,
    Deactivate,
}

impl FailedPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManifestLoad => "manifest_load",
            Self::Load => "load",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
        }
    }
}

/// A plugin as the registry knows it.
#[derive(Debug, Clone, Serialize)]
pub struct PluginRecord {
    /// Config key; normally the manifest name.
    pub id: String,
    pub origin: Origin,
    pub directory_path: PathBuf,
    /// `plugin.json` or the entry file, whichever supplied the manifest.
    pub manifest_source_path: Option<PathBuf>,
    /// Compiled-in module named by the entry file.
    pub module: Option<String>,
    pub manifest: Option<PluginManifest>,
    pub load_error: Option<String>,
    pub state: PluginState,
    pub failed_phase: Option<FailedPhase>,
    /// Most recent hook error, kept even when the plugin did not end up Failed.
    pub last_error: Option<String>,
    pub last_transition_at: DateTime<Utc>,
    /// A `migrations/` folder exists. Never executed by the runtime.
    pub has_migrations: bool,
    /// Id of the plugin whose enable pulled this one in.
    pub enabled_by_dependency: Option<String>,
}

impl PluginRecord {
    /// A freshly discovered plugin with a parsed manifest.
    pub fn discovered(
        id: impl Into<String>,
        origin: Origin,
        directory_path: PathBuf,
        manifest: PluginManifest,
    ) -> Self {
        Self {
            id: id.into(),
            origin,
            directory_path,
            manifest_source_path: None,
            module: None,
            manifest: Some(manifest),
            load_error: None,
            state: PluginState::Discovered,
            failed_phase: None,
            last_error: None,
            last_transition_at: Utc::now(),
            has_migrations: false,
            enabled_by_dependency: None,
        }
    }

    /// A plugin whose manifest could not be loaded.
    pub fn failed_manifest(
        id: impl Into<String>,
        origin: Origin,
        directory_path: PathBuf,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            origin,
            directory_path,
            manifest_source_path: None,
            module: None,
            manifest: None,
            load_error: Some(error.into()),
            state: PluginState::Failed,
            failed_phase: Some(FailedPhase::ManifestLoad),
            last_error: None,
            last_transition_at: Utc::now(),
            has_migrations: false,
            enabled_by_dependency: None,
        }
    }

    /// A configured plugin whose directory is absent.
    pub fn missing(id: impl Into<String>, origin: Origin, directory_path: PathBuf, suppressed: bool) -> Self {
        Self {
            id: id.into(),
            origin,
            directory_path,
            manifest_source_path: None,
            module: None,
            manifest: None,
            load_error: None,
            state: if suppressed {
                PluginState::Suppressed
            } else {
                PluginState::Missing
            },
            failed_phase: None,
            last_error: None,
            last_transition_at: Utc::now(),
            has_migrations: false,
            enabled_by_dependency: None,
        }
    }

    pub fn dependencies(&self) -> &[String] {
        self.manifest
            .as_ref()
            .map(|m| m.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Move to `state`, clearing the failure phase unless entering Failed.
    pub fn transition(&mut self, state: PluginState) {
        self.state = state;
        if state != PluginState::Failed {
            self.failed_phase = None;
        }
        self.last_transition_at = Utc::now();
    }

    pub fn fail(&mut self, phase: FailedPhase, error: impl Into<String>) {
        let error = error.into();
        self.state = PluginState::Failed;
        self.failed_phase = Some(phase);
        if phase == FailedPhase::ManifestLoad {
            self.load_error = Some(error.clone());
        }
        self.last_error = Some(error);
        self.last_transition_at = Utc::now();
    }

    /// Human-readable error for catalog listings.
    pub fn error_message(&self) -> Option<&str> {
        self.load_error.as_deref().or(self.last_error.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_then_recover_clears_phase() {
        let mut record = PluginRecord::failed_manifest("x", Origin::User, PathBuf::from("/p/x"), "bad");
        assert_eq!(record.failed_phase, Some(FailedPhase::ManifestLoad));
        record.transition(PluginState::Discovered);
        assert_eq!(record.failed_phase, None);
    }

    #[test]
    fn suppressed_missing_records() {
        let record = PluginRecord::missing("gone", Origin::User, PathBuf::from("/p/gone"), true);
        assert_eq!(record.state, PluginState::Suppressed);
        assert!(record.state.is_absent());
    }

    #[test]
    fn states_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(FailedPhase::ManifestLoad).ok(),
            Some(serde_json::json!("manifest_load"))
        );
        assert_eq!(PluginState::Active.to_string(), "active");
    }
}
