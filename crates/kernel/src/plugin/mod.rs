//! Plugin system for Keystone.
//!
//! This module handles:
//! - Discovering plugin directories and merging their manifests
//! - Reconciling the catalog with the project's `plugins` config
//! - Enabling, disabling, and reloading plugins with dependency awareness
//! - Checking the catalog for broken dependencies

pub mod dependency;
mod error;
pub mod lifecycle;
pub mod manifest;
pub mod module;
pub mod record;
pub mod registry;
mod validate;

pub use dependency::{DependencyError, DependencyGraph, resolve_order};
pub use error::{LifecycleError, PluginError};
pub use lifecycle::{BootReport, LifecycleController, OpOptions, Transition};
pub use manifest::{
    AdminUi, LoadedManifest, NavEntry, PluginManifest, RouteSpec, SettingSpec, SettingType,
    load_manifest,
};
pub use module::{ModuleHandle, ModuleRegistry};
pub use record::{FailedPhase, Origin, PluginRecord, PluginState};
pub use registry::{PluginRoots, Registry, RegistryWarning, ScanReport};
pub use validate::{ValidationIssue, ValidationReport, ValidationSummary, validate_system};
