//! Plugin manifests: parsing, merging, and validation.
//!
//! A plugin directory may carry:
//! - `plugin.json`, the manifest as JSON
//! - `plugin.toml` or `index.toml`, an entry file naming the compiled-in
//!   module (`module = "economy"`) and optionally an inline `[manifest]` table
//!
//! The effective manifest is `plugin.json`, overlaid by the entry file's
//! `[manifest]`, overlaid by the module's exported manifest. Overlays replace
//! top-level keys.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use keystone_sdk::HookSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::PluginError;
use super::module::ModuleRegistry;

/// File names that mark a directory as a plugin.
pub const MANIFEST_FILE: &str = "plugin.json";
pub const ENTRY_FILES: &[&str] = &["plugin.toml", "index.toml"];

/// Hook names a manifest may declare.
pub const KNOWN_HOOKS: &[&str] = &["on_load", "on_activate", "on_deactivate"];

/// Middleware tags routes may reference.
pub const MIDDLEWARE_TAGS: &[&str] = &["auth", "admin", "cors"];

/// Top-level path segments owned by the control plane.
pub const RESERVED_NAMES: &[&str] = &["plugins", "health", "audit"];

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Version plugins check `runtime_version_constraint` against.
pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plugin metadata after merging every source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Machine name; also the route prefix and the default config key.
    pub name: String,

    /// Semantic version (e.g., "1.0.0").
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub author: String,

    /// Semver range of runtimes this plugin targets.
    #[serde(default, alias = "runtime_version", alias = "runtimeVersion")]
    pub runtime_version_constraint: Option<String>,

    /// Plugins that must be Active before this one activates.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Recognized settings with their defaults.
    #[serde(default)]
    pub config_schema: BTreeMap<String, SettingSpec>,

    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    /// Idempotent table-creation statements.
    #[serde(default)]
    pub schemas: Vec<String>,

    /// Idempotent index-creation statements.
    #[serde(default)]
    pub indexes: Vec<String>,

    #[serde(default)]
    pub admin_ui: Option<AdminUi>,

    /// Lifecycle hooks the module is expected to export.
    #[serde(default)]
    pub hooks: Vec<String>,
}

/// One contributed route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub method: String,
    /// Path relative to the plugin prefix, with `{param}` captures.
    pub path: String,
    /// Key into the module's handler set.
    #[serde(alias = "handler")]
    pub handler_ref: String,
    #[serde(default, alias = "middleware")]
    pub middleware_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminUi {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub nav: Option<NavEntry>,
    #[serde(default)]
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavEntry {
    pub label: String,
    pub path: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub weight: i32,
}

/// A recognized setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingSpec {
    #[serde(rename = "type")]
    pub kind: SettingType,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl SettingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl PluginManifest {
    /// Defaults from `config_schema`.
    pub fn config_defaults(&self) -> Map<String, Value> {
        self.config_schema
            .iter()
            .filter_map(|(key, spec)| spec.default.clone().map(|d| (key.clone(), d)))
            .collect()
    }

    /// Schema defaults overlaid with the operator's settings.
    pub fn resolve_config(&self, overrides: Option<&Value>) -> Value {
        let mut resolved = self.config_defaults();
        if let Some(Value::Object(overrides)) = overrides {
            for (key, value) in overrides {
                resolved.insert(key.clone(), value.clone());
            }
        }
        Value::Object(resolved)
    }

    /// Check operator settings against `config_schema`.
    ///
    /// Unknown keys are rejected when the schema is non-empty. Returns every
    /// offending field.
    pub fn check_settings(&self, settings: &Value) -> Result<(), Vec<String>> {
        let Value::Object(settings) = settings else {
            return Err(vec!["settings must be an object".to_string()]);
        };

        let mut problems = Vec::new();
        for (key, value) in settings {
            match self.config_schema.get(key) {
                Some(spec) if !value.is_null() && !spec.kind.accepts(value) => {
                    problems.push(format!("{key}: expected {}", spec.kind.as_str()));
                }
                Some(_) => {}
                None if !self.config_schema.is_empty() => {
                    problems.push(format!("{key}: unknown setting"));
                }
                None => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    pub fn declared_hooks(&self) -> HookSet {
        HookSet {
            on_load: self.declares_hook("on_load"),
            on_activate: self.declares_hook("on_activate"),
            on_deactivate: self.declares_hook("on_deactivate"),
        }
    }

    pub fn declares_hook(&self, hook: &str) -> bool {
        self.hooks.iter().any(|h| h == hook)
    }

    /// Structural validation. Collects every problem before failing.
    pub fn validate(&self) -> Result<(), PluginError> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("name is empty".to_string());
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            problems.push(format!(
                "name '{}' may only contain letters, digits, '-' and '_'",
                self.name
            ));
        } else if RESERVED_NAMES.contains(&self.name.as_str()) {
            problems.push(format!(
                "name '{}' collides with a control-plane prefix",
                self.name
            ));
        }

        if let Err(e) = semver::Version::parse(&self.version) {
            problems.push(format!("version '{}' is not semver: {e}", self.version));
        }

        if let Some(constraint) = &self.runtime_version_constraint {
            match semver::VersionReq::parse(constraint) {
                Ok(req) => {
                    if let Ok(runtime) = semver::Version::parse(RUNTIME_VERSION)
                        && !req.matches(&runtime)
                    {
                        return Err(PluginError::IncompatibleRuntime {
                            plugin: self.name.clone(),
                            constraint: constraint.clone(),
                            runtime: RUNTIME_VERSION.to_string(),
                        });
                    }
                }
                Err(e) => problems.push(format!(
                    "runtime_version_constraint '{constraint}' is not a semver range: {e}"
                )),
            }
        }

        let mut seen_deps = HashSet::new();
        for dep in &self.dependencies {
            if dep == &self.name {
                problems.push("plugin depends on itself".to_string());
            } else if !seen_deps.insert(dep) {
                problems.push(format!("dependency '{dep}' listed twice"));
            }
        }

        let mut seen_routes = HashSet::new();
        for route in &self.routes {
            let method = route.method.to_ascii_uppercase();
            if !HTTP_METHODS.contains(&method.as_str()) {
                problems.push(format!("route {} {}: unknown method", route.method, route.path));
            }
            if let Err(reason) = check_route_path(&route.path) {
                problems.push(format!("route {} {}: {reason}", route.method, route.path));
            }
            if route.handler_ref.trim().is_empty() {
                problems.push(format!("route {} {}: handler_ref is empty", route.method, route.path));
            }
            for tag in &route.middleware_tags {
                if !MIDDLEWARE_TAGS.contains(&tag.as_str()) {
                    problems.push(format!(
                        "route {} {}: unknown middleware tag '{tag}'. Valid tags: {}",
                        route.method,
                        route.path,
                        MIDDLEWARE_TAGS.join(", ")
                    ));
                }
            }
            if !seen_routes.insert((method, route.path.clone())) {
                problems.push(format!("route {} {} declared twice", route.method, route.path));
            }
        }

        // A cors route answers its own preflight.
        for route in &self.routes {
            let explicit_options = route.method.eq_ignore_ascii_case("OPTIONS");
            let cors_sibling = self.routes.iter().any(|other| {
                other.path == route.path
                    && !other.method.eq_ignore_ascii_case("OPTIONS")
                    && other.middleware_tags.iter().any(|t| t == "cors")
            });
            if explicit_options && cors_sibling {
                problems.push(format!(
                    "route {} {}: OPTIONS is already answered by a cors route on this path",
                    route.method, route.path
                ));
            }
        }

        for hook in &self.hooks {
            if !KNOWN_HOOKS.contains(&hook.as_str()) {
                problems.push(format!(
                    "unknown hook '{hook}'. Valid hooks: {}",
                    KNOWN_HOOKS.join(", ")
                ));
            }
        }

        for (key, spec) in &self.config_schema {
            if let Some(default) = &spec.default
                && !spec.kind.accepts(default)
            {
                problems.push(format!("config_schema.{key}: default does not match its type"));
            }
        }

        if let Some(ui) = &self.admin_ui {
            for route in ui.routes.iter().chain(ui.nav.as_ref().map(|n| &n.path)) {
                if !route.starts_with('/') {
                    problems.push(format!("admin_ui route '{route}' must start with '/'"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PluginError::invalid(&self.name, problems.join("; ")))
        }
    }
}

fn check_route_path(path: &str) -> Result<(), &'static str> {
    if !path.starts_with('/') {
        return Err("path must start with '/'");
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err("path must not end with '/'");
    }
    for segment in path.split('/').skip(1) {
        if path != "/" && segment.is_empty() {
            return Err("path has an empty segment");
        }
        if segment.starts_with(':') || segment.starts_with('*') {
            return Err("use {param} captures, not ':' or '*'");
        }
        let opens = segment.matches('{').count();
        let closes = segment.matches('}').count();
        if opens != closes || opens > 1 {
            return Err("malformed capture");
        }
        if opens == 1 {
            let inner = segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .ok_or("a capture must span the whole segment")?;
            if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err("capture names must be identifiers");
            }
        }
    }
    Ok(())
}

/// Contents of `plugin.toml` / `index.toml`.
#[derive(Debug, Default, Deserialize)]
struct EntryFile {
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    manifest: Option<toml::Table>,
}

/// A manifest read from disk, with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub manifest: PluginManifest,
    pub source_path: PathBuf,
    pub module: Option<String>,
}

/// A manifest that could not be loaded.
#[derive(Debug)]
pub struct ManifestFailure {
    /// Best guess at the plugin id: the declared name, else the directory name.
    pub id: String,
    pub error: PluginError,
}

/// Whether `dir` holds any plugin marker file.
pub fn is_plugin_dir(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).is_file() || ENTRY_FILES.iter().any(|f| dir.join(f).is_file())
}

/// Read, merge, and validate the manifest in `dir`.
///
/// The module named by the entry file is instantiated once to read its
/// exported manifest and hook set, then dropped.
pub fn load_manifest(dir: &Path, modules: &ModuleRegistry) -> Result<LoadedManifest, ManifestFailure> {
    let dir_name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let fail = |id: &str, error: PluginError| ManifestFailure {
        id: id.to_string(),
        error,
    };

    let mut merged = Map::new();
    let mut source_path = None;

    let json_path = dir.join(MANIFEST_FILE);
    if json_path.is_file() {
        let text = fs::read_to_string(&json_path).map_err(|e| {
            fail(&dir_name, unreadable(dir, MANIFEST_FILE, e.to_string()))
        })?;
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => merged = map,
            Ok(_) => {
                return Err(fail(
                    &dir_name,
                    PluginError::invalid(&dir_name, "plugin.json must contain an object"),
                ));
            }
            Err(e) => {
                return Err(fail(
                    &dir_name,
                    PluginError::invalid(&dir_name, format!("plugin.json: {e}")),
                ));
            }
        }
        source_path = Some(json_path);
    }

    let mut entry = EntryFile::default();
    if let Some(file) = ENTRY_FILES.iter().find(|f| dir.join(f).is_file()) {
        let entry_path = dir.join(file);
        let id = declared_name(&merged).unwrap_or(&dir_name).to_string();
        let text = fs::read_to_string(&entry_path)
            .map_err(|e| fail(&id, unreadable(dir, file, e.to_string())))?;
        entry = toml::from_str(&text)
            .map_err(|e| fail(&id, PluginError::invalid(&id, format!("{file}: {e}"))))?;
        if let Some(table) = entry.manifest.take() {
            let overlay = serde_json::to_value(table)
                .map_err(|e| fail(&id, PluginError::invalid(&id, format!("{file}: {e}"))))?;
            overlay_object(&mut merged, overlay);
        }
        if source_path.is_none() {
            source_path = Some(entry_path);
        }
    }

    let mut exported_hooks = None;
    if let Some(module) = &entry.module {
        let id = declared_name(&merged).unwrap_or(&dir_name).to_string();
        let Some(factory) = modules.get(module) else {
            return Err(fail(
                &id,
                PluginError::unknown_module(&id, module, &modules.names()),
            ));
        };
        let instance = factory();
        if let Some(exported) = instance.manifest() {
            overlay_object(&mut merged, exported);
        }
        exported_hooks = Some(instance.hooks());
    }

    let id = declared_name(&merged).unwrap_or(&dir_name).to_string();
    let manifest: PluginManifest = serde_json::from_value(Value::Object(merged))
        .map_err(|e| fail(&id, PluginError::invalid(&id, e.to_string())))?;
    manifest.validate().map_err(|e| fail(&id, e))?;

    match exported_hooks {
        Some(exported) => {
            if let Some(hook) = manifest.hooks.iter().find(|h| !exported.exports(h)) {
                return Err(fail(
                    &id,
                    PluginError::MissingHookExport {
                        plugin: id.clone(),
                        hook: hook.clone(),
                    },
                ));
            }
        }
        None if !manifest.hooks.is_empty() => {
            return Err(fail(
                &id,
                PluginError::HooksWithoutModule {
                    plugin: id.clone(),
                    hooks: manifest.hooks.join(", "),
                },
            ));
        }
        None => {}
    }

    Ok(LoadedManifest {
        manifest,
        source_path: source_path.unwrap_or_else(|| dir.to_path_buf()),
        module: entry.module,
    })
}

fn declared_name(merged: &Map<String, Value>) -> Option<&str> {
    merged
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty())
}

fn overlay_object(base: &mut Map<String, Value>, overlay: Value) {
    if let Value::Object(overlay) = overlay {
        for (key, value) in overlay {
            base.insert(key, value);
        }
    }
}

fn unreadable(dir: &Path, file: &str, details: String) -> PluginError {
    PluginError::Unreadable {
        path: dir.display().to_string(),
        file: file.to_string(),
        details,
    }
}
