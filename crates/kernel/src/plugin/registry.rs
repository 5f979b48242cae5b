//! Plugin discovery and the in-memory catalog.
//!
//! The registry scans the plugin roots for plugin directories, reads their
//! manifests, and reconciles what it found with the current project's
//! `plugins` config mapping. The resulting [`PluginRecord`]s are kept behind
//! a read-write lock: scans hold the write lock for their whole duration,
//! queries take the read lock.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_yml::Value as YamlValue;
use tracing::{debug, info, warn};

use super::dependency::DependencyGraph;
use super::error::PluginError;
use super::manifest::{is_plugin_dir, load_manifest};
use super::module::ModuleRegistry;
use super::record::{Origin, PluginRecord, PluginState};
use crate::config_store::{ConfigStore, PluginEntry};

/// Directories scanned for plugins, in precedence order.
#[derive(Debug, Clone)]
pub struct PluginRoots {
    pub core: PathBuf,
    pub user: PathBuf,
    pub example: Option<PathBuf>,
}

impl PluginRoots {
    fn ordered(&self) -> Vec<(Origin, &Path)> {
        let mut roots = vec![
            (Origin::Core, self.core.as_path()),
            (Origin::User, self.user.as_path()),
        ];
        if let Some(example) = &self.example {
            roots.push((Origin::Example, example.as_path()));
        }
        roots
    }
}

/// A non-fatal scan finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryWarning {
    pub code: &'static str,
    pub plugin: String,
    pub message: String,
}

/// Outcome of a full scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub total: usize,
    pub failed: usize,
    pub missing: usize,
    pub auto_registered: Vec<String>,
}

#[derive(Debug, Default)]
struct Catalog {
    records: BTreeMap<String, PluginRecord>,
    warnings: Vec<RegistryWarning>,
}

/// The plugin catalog.
#[derive(Debug)]
pub struct Registry {
    roots: PluginRoots,
    modules: Arc<ModuleRegistry>,
    catalog: RwLock<Catalog>,
}

impl Registry {
    pub fn new(roots: PluginRoots, modules: Arc<ModuleRegistry>) -> Self {
        Self {
            roots,
            modules,
            catalog: RwLock::new(Catalog::default()),
        }
    }

    pub fn roots(&self) -> &PluginRoots {
        &self.roots
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// Scan every root and reconcile with `config`.
    ///
    /// Records in a live state (Loaded, Active) are kept as they are so a
    /// rescan never swaps a manifest out from under a running plugin. So are
    /// records that failed at runtime; only a reload clears those.
    pub fn scan(&self, config: &ConfigStore) -> ScanReport {
        let mut catalog = self.catalog.write();

        let entries = config.plugin_entries();
        let base = config.base_dir();
        let mut found: BTreeMap<String, PluginRecord> = BTreeMap::new();
        let mut warnings = Vec::new();

        for (origin, root) in self.roots.ordered() {
            for dir in candidate_dirs(root) {
                let record = self.read_record(&dir, origin);
                insert_first(&mut found, &mut warnings, record);
            }
        }

        // Config entries may point at directories outside the roots.
        for (id, entry) in &entries {
            let Some(path) = &entry.path else { continue };
            let dir = resolve_path(&base, path);
            if found.contains_key(id) || !dir.is_dir() || !is_plugin_dir(&dir) {
                continue;
            }
            let origin = entry
                .origin
                .as_deref()
                .and_then(Origin::parse)
                .unwrap_or(Origin::User);
            let record = self.read_record(&dir, origin);
            insert_first(&mut found, &mut warnings, record);
        }

        for (id, entry) in &entries {
            match found.get_mut(id) {
                Some(record) => {
                    apply_entry(record, entry);
                    if let Some(path) = &entry.path
                        && !same_path(&resolve_path(&base, path), &record.directory_path)
                    {
                        warnings.push(RegistryWarning {
                            code: "path_mismatch",
                            plugin: id.clone(),
                            message: format!(
                                "config path '{path}' differs from discovered directory {}",
                                record.directory_path.display()
                            ),
                        });
                    }
                }
                None => {
                    let origin = entry
                        .origin
                        .as_deref()
                        .and_then(Origin::parse)
                        .unwrap_or(Origin::User);
                    let dir = entry
                        .path
                        .as_deref()
                        .map(|p| resolve_path(&base, p))
                        .unwrap_or_else(|| self.roots.user.join(id));
                    warn!(plugin = %id, path = %dir.display(), "configured plugin is missing on disk");
                    found.insert(
                        id.clone(),
                        PluginRecord::missing(id.clone(), origin, dir, entry.suppressed),
                    );
                }
            }
        }

        let mut auto_registered = Vec::new();
        if config.auto_enable_discovered() {
            let configured: Vec<&str> = entries.iter().map(|(id, _)| id.as_str()).collect();
            for record in found.values() {
                if record.state == PluginState::Discovered && !configured.contains(&record.id.as_str()) {
                    auto_registered.push(record.id.clone());
                }
            }
            for id in &auto_registered {
                let Some(record) = found.get(id) else { continue };
                let fields = vec![
                    ("enabled", YamlValue::Bool(true)),
                    ("enabledAt", YamlValue::from(Utc::now().to_rfc3339())),
                    (
                        "path",
                        YamlValue::from(record.directory_path.display().to_string()),
                    ),
                    ("origin", YamlValue::from(record.origin.as_str())),
                ];
                match config.update_plugin_entry(id, fields) {
                    Ok(()) => info!(plugin = %id, "auto-registered discovered plugin"),
                    Err(e) => warn!(plugin = %id, error = %e, "failed to auto-register plugin"),
                }
            }
        }

        for (id, existing) in &catalog.records {
            if existing.state.is_live() || failed_at_runtime(existing) {
                found.insert(id.clone(), existing.clone());
            }
        }

        let report = ScanReport {
            total: found.len(),
            failed: found
                .values()
                .filter(|r| r.state == PluginState::Failed)
                .count(),
            missing: found.values().filter(|r| r.state.is_absent()).count(),
            auto_registered,
        };

        catalog.records = found;
        catalog.warnings = warnings;

        info!(
            total = report.total,
            failed = report.failed,
            missing = report.missing,
            "plugin scan complete"
        );
        report
    }

    /// Re-read a single plugin directory and replace its record.
    ///
    /// The caller is responsible for unloading the plugin first.
    pub fn rescan_one(&self, id: &str, config: &ConfigStore) -> Result<PluginRecord, PluginError> {
        let mut catalog = self.catalog.write();
        let existing = catalog
            .records
            .get(id)
            .ok_or_else(|| PluginError::NotFound {
                plugin: id.to_string(),
            })?;

        let dir = existing.directory_path.clone();
        if !dir.is_dir() || !is_plugin_dir(&dir) {
            return Err(PluginError::DirectoryGone {
                plugin: id.to_string(),
                path: dir.display().to_string(),
            });
        }

        let mut record = self.read_record(&dir, existing.origin);
        if record.id != id {
            let renamed = record.id.clone();
            record.fail(
                super::record::FailedPhase::ManifestLoad,
                format!("manifest name changed from '{id}' to '{renamed}'; re-register the plugin"),
            );
            record.id = id.to_string();
        }
        if let Some(entry) = config.plugin_entry(id) {
            apply_entry(&mut record, &entry);
        }

        debug!(plugin = %id, state = %record.state, "rescanned plugin");
        catalog.records.insert(id.to_string(), record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<PluginRecord> {
        self.catalog.read().records.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.catalog.read().records.contains_key(id)
    }

    /// All records, ordered by id.
    pub fn list(&self) -> Vec<PluginRecord> {
        self.catalog.read().records.values().cloned().collect()
    }

    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.catalog.read().records.get(id).map(|r| r.state)
    }

    /// Mutate a record in place.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut PluginRecord) -> R) -> Option<R> {
        self.catalog.write().records.get_mut(id).map(f)
    }

    pub fn insert(&self, record: PluginRecord) {
        self.catalog.write().records.insert(record.id.clone(), record);
    }

    pub fn remove(&self, id: &str) -> Option<PluginRecord> {
        self.catalog.write().records.remove(id)
    }

    pub fn warnings(&self) -> Vec<RegistryWarning> {
        self.catalog.read().warnings.clone()
    }

    /// Dependency edges of every record that has a manifest.
    pub fn dependency_graph(&self) -> DependencyGraph {
        self.catalog
            .read()
            .records
            .values()
            .filter(|r| r.manifest.is_some())
            .map(|r| (r.id.clone(), r.dependencies().to_vec()))
            .collect()
    }

    fn read_record(&self, dir: &Path, origin: Origin) -> PluginRecord {
        let has_migrations = dir.join("migrations").is_dir();
        let mut record = match load_manifest(dir, &self.modules) {
            Ok(loaded) => {
                let mut record = PluginRecord::discovered(
                    loaded.manifest.name.clone(),
                    origin,
                    dir.to_path_buf(),
                    loaded.manifest,
                );
                record.manifest_source_path = Some(loaded.source_path);
                record.module = loaded.module;
                record
            }
            Err(failure) => {
                warn!(
                    plugin = %failure.id,
                    path = %dir.display(),
                    error = %failure.error,
                    "failed to load plugin manifest"
                );
                PluginRecord::failed_manifest(
                    failure.id,
                    origin,
                    dir.to_path_buf(),
                    failure.error.to_string(),
                )
            }
        };
        record.has_migrations = has_migrations;
        record
    }
}

fn insert_first(
    found: &mut BTreeMap<String, PluginRecord>,
    warnings: &mut Vec<RegistryWarning>,
    record: PluginRecord,
) {
    if let Some(first) = found.get(&record.id) {
        warn!(
            plugin = %record.id,
            kept = %first.directory_path.display(),
            ignored = %record.directory_path.display(),
            "duplicate plugin name"
        );
        warnings.push(RegistryWarning {
            code: "duplicate_plugin",
            plugin: record.id.clone(),
            message: format!(
                "{} ignored; '{}' is already provided by {}",
                record.directory_path.display(),
                record.id,
                first.directory_path.display()
            ),
        });
        return;
    }
    found.insert(record.id.clone(), record);
}

/// Carry config-held state onto a freshly read record.
fn apply_entry(record: &mut PluginRecord, entry: &PluginEntry) {
    record.enabled_by_dependency = entry.enabled_by_dependency.clone();
    if record.state == PluginState::Discovered && !entry.enabled {
        record.state = PluginState::Disabled;
    }
}

/// Plugin directories directly under `root`, descending once into `@namespace` dirs.
fn candidate_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for dir in sorted_subdirs(root) {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if name.starts_with('@') {
            dirs.extend(sorted_subdirs(&dir).into_iter().filter(|d| is_plugin_dir(d)));
        } else if is_plugin_dir(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "plugin root not readable");
            return Vec::new();
        }
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Resolve a config-held path against the config file's directory.
pub fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Absolute, lexically cleaned, case-folded form of `path` for comparisons.
pub fn normalize_path(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned.to_string_lossy().to_lowercase()
}

pub fn same_path(a: &Path, b: &Path) -> bool {
    normalize_path(a) == normalize_path(b)
}

fn failed_at_runtime(record: &PluginRecord) -> bool {
    record.state == PluginState::Failed
        && record
            .failed_phase
            .is_some_and(|phase| phase != super::record::FailedPhase::ManifestLoad)
}
