//! On-disk configuration store.
//!
//! Owns the YAML config file: loads it (creating, recovering, or migrating
//! as needed), answers dot-path queries against an in-memory tree, and
//! persists every mutation with a temp-file + fsync + rename replacement.
//!
//! Writers to the same file are serialized through a process-wide lock
//! keyed by the file's absolute path, so two `ConfigStore` values opened on
//! one file never interleave their writes.

mod entries;
mod error;
mod migration;
mod tree;

pub use entries::{AuthSettings, DevSettings, PluginEntry, ProjectSettings, ServerSettings};
pub use error::ConfigError;
pub use migration::{
    DEFAULT_DATABASE, Layout, default_tree, detect_layout, generate_secret, migrate_legacy,
};
pub use tree::{ConfigPath, ConfigTree, Segment};

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_yml::Value;
use tracing::{error, info, warn};

use migration::{MixedLayout, ensure_secrets, fill_defaults};

/// Reserved key inside a project's `plugins` mapping.
pub const AUTO_ENABLE_KEY: &str = "auto_enable_discovered";

static WRITE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn write_lock_for(path: &Path) -> Arc<Mutex<()>> {
    WRITE_LOCKS
        .lock()
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// What `load` had to do to produce a usable tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// The file did not exist and was created from defaults.
    pub created: bool,
    /// A corrupt file was moved here and replaced with defaults.
    pub recovered_from: Option<PathBuf>,
    /// A legacy layout was migrated; the original is kept here.
    pub migrated_backup: Option<PathBuf>,
    /// Secrets that were generated during load.
    pub generated_secrets: Vec<String>,
}

/// The loaded config file plus its write discipline.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    tree: RwLock<ConfigTree>,
    report: LoadReport,
}

impl ConfigStore {
    /// Load the config file at `path`, creating, recovering, or migrating it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = absolute(path.as_ref());
        let lock = write_lock_for(&path);
        let _guard = lock.lock();

        let mut report = LoadReport::default();

        let mut tree = if path.exists() {
            let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            match parse_tree(&text) {
                Some(tree) => tree,
                None => {
                    let backup = backup_path_with_epoch(&path);
                    fs::rename(&path, &backup).map_err(|source| ConfigError::Write {
                        path: backup.clone(),
                        source,
                    })?;
                    error!(
                        backup = %backup.display(),
                        "CONFIG RECOVERY: {} could not be parsed; moved to {} and replaced with defaults",
                        path.display(),
                        backup.display()
                    );
                    report.recovered_from = Some(backup);
                    ConfigTree::default()
                }
            }
        } else {
            info!(path = %path.display(), "creating default config file");
            report.created = true;
            ConfigTree::default()
        };

        match detect_layout(&tree) {
            Err(MixedLayout) => return Err(ConfigError::SchemaMismatch { path }),
            Ok(Layout::Legacy) => {
                let backup = sibling(&path, ".backup");
                fs::copy(&path, &backup).map_err(|source| ConfigError::Write {
                    path: backup.clone(),
                    source,
                })?;
                migrate_legacy(&mut tree);
                info!(
                    path = %path.display(),
                    backup = %backup.display(),
                    "migrated legacy config to multi-project layout"
                );
                report.migrated_backup = Some(backup);
            }
            Ok(Layout::MultiProject | Layout::Bare) => {}
        }

        let filled = fill_defaults(&mut tree);
        let generated = ensure_secrets(&mut tree)?;
        if !generated.is_empty() {
            warn!(secrets = ?generated, "generated missing auth secrets");
        }
        report.generated_secrets = generated.iter().map(|s| s.to_string()).collect();

        let dirty = report.created
            || report.recovered_from.is_some()
            || report.migrated_backup.is_some()
            || filled
            || !generated.is_empty();
        if dirty {
            write_atomic(&path, &tree.to_yaml()?)?;
        }

        Ok(Self {
            path,
            tree: RwLock::new(tree),
            report,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory relative plugin paths and database files resolve against.
    pub fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    /// A copy of the whole tree.
    pub fn snapshot(&self) -> ConfigTree {
        self.tree.read().clone()
    }

    /// Value at `path`, cloned. Unparsable or missing paths yield `None`.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.tree.read().get_str_path(path).cloned()
    }

    pub fn get_path(&self, path: &ConfigPath) -> Option<Value> {
        self.tree.read().get(path).cloned()
    }

    pub fn get_or(&self, path: &str, default: Value) -> Value {
        self.get(path).unwrap_or(default)
    }

    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get(path).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(|v| v.as_bool())
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(|v| v.as_i64())
    }

    /// Deserialize the node at `path`. Missing or mistyped nodes yield `None`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.get(path)
            .and_then(|value| serde_yml::from_value(value).ok())
    }

    /// Set one value and persist.
    pub fn update(&self, path: &str, value: Value) -> Result<(), ConfigError> {
        let path = ConfigPath::parse(path)?;
        self.update_with(|tree| tree.set(&path, value))
    }

    /// Remove one node and persist. Returns the removed value.
    pub fn remove(&self, path: &ConfigPath) -> Result<Option<Value>, ConfigError> {
        self.update_with(|tree| Ok(tree.remove(path)))
    }

    /// Apply several mutations under one lock and one atomic write.
    ///
    /// The closure works on a copy; the in-memory tree is only replaced once
    /// the file write has succeeded. If the closure fails nothing is written.
    pub fn update_with<R>(
        &self,
        mutate: impl FnOnce(&mut ConfigTree) -> Result<R, ConfigError>,
    ) -> Result<R, ConfigError> {
        let lock = write_lock_for(&self.path);
        let _guard = lock.lock();

        let mut working = self.tree.read().clone();
        let result = mutate(&mut working)?;
        write_atomic(&self.path, &working.to_yaml()?)?;
        *self.tree.write() = working;
        Ok(result)
    }

    pub fn server(&self) -> ServerSettings {
        self.get_as("server").unwrap_or_default()
    }

    pub fn auth(&self) -> AuthSettings {
        self.get_as("auth").unwrap_or_default()
    }

    pub fn dev(&self) -> DevSettings {
        self.get_as("dev").unwrap_or_default()
    }

    /// Index of the current project: `server.default_project`, else the first.
    pub fn current_project_index(&self) -> Option<usize> {
        let tree = self.tree.read();
        current_project_index(&tree)
    }

    pub fn current_project(&self) -> Option<ProjectSettings> {
        let index = self.current_project_index()?;
        self.get_path(&ConfigPath::new().key("projects").index(index))
            .and_then(|value| serde_yml::from_value(value).ok())
    }

    /// Path of `projects[current].plugins`.
    pub fn plugins_path(&self) -> Option<ConfigPath> {
        self.current_project_index()
            .map(|index| ConfigPath::new().key("projects").index(index).key("plugins"))
    }

    /// Path of a plugin's entry in the current project.
    pub fn plugin_path(&self, id: &str) -> Option<ConfigPath> {
        self.plugins_path().map(|path| path.key(id))
    }

    /// Every plugin entry in the current project, in file order.
    ///
    /// Entries that fail to deserialize are skipped with a warning.
    pub fn plugin_entries(&self) -> Vec<(String, PluginEntry)> {
        let Some(path) = self.plugins_path() else {
            return Vec::new();
        };
        let Some(Value::Mapping(plugins)) = self.get_path(&path) else {
            return Vec::new();
        };

        plugins
            .into_iter()
            .filter_map(|(key, value)| {
                let id = key.as_str()?.to_string();
                if id == AUTO_ENABLE_KEY || !value.is_mapping() {
                    return None;
                }
                match serde_yml::from_value::<PluginEntry>(value) {
                    Ok(entry) => Some((id, entry)),
                    Err(e) => {
                        warn!(plugin = %id, error = %e, "ignoring malformed plugin entry");
                        None
                    }
                }
            })
            .collect()
    }

    pub fn plugin_entry(&self, id: &str) -> Option<PluginEntry> {
        let path = self.plugin_path(id)?;
        self.get_path(&path)
            .and_then(|value| serde_yml::from_value(value).ok())
    }

    /// The `plugins.auto_enable_discovered` switch of the current project.
    pub fn auto_enable_discovered(&self) -> bool {
        self.plugins_path()
            .and_then(|path| self.get_path(&path.key(AUTO_ENABLE_KEY)))
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }

    /// Merge `fields` into a plugin's entry, creating it if absent.
    pub fn update_plugin_entry(
        &self,
        id: &str,
        fields: Vec<(&'static str, Value)>,
    ) -> Result<(), ConfigError> {
        self.update_with(|tree| {
            let index = current_project_index(tree)
                .ok_or_else(|| ConfigError::Invalid("no project is configured".into()))?;
            let entry = ConfigPath::new()
                .key("projects")
                .index(index)
                .key("plugins")
                .key(id);
            if !tree.get(&entry).is_some_and(Value::is_mapping) {
                tree.set(&entry, Value::Mapping(serde_yml::Mapping::new()))?;
            }
            for (key, value) in fields {
                if value.is_null() {
                    tree.remove(&entry.clone().key(key));
                } else {
                    tree.set(&entry.clone().key(key), value)?;
                }
            }
            Ok(())
        })
    }

    /// Delete a plugin's entry from the current project.
    pub fn remove_plugin_entry(&self, id: &str) -> Result<bool, ConfigError> {
        let Some(path) = self.plugin_path(id) else {
            return Ok(false);
        };
        Ok(self.remove(&path)?.is_some())
    }
}

fn current_project_index(tree: &ConfigTree) -> Option<usize> {
    let projects = tree.get_str_path("projects")?.as_sequence()?;
    if projects.is_empty() {
        return None;
    }
    let wanted = tree
        .get_str_path("server.default_project")
        .and_then(Value::as_str);
    wanted
        .and_then(|id| {
            projects
                .iter()
                .position(|p| p.get("id").and_then(Value::as_str) == Some(id))
        })
        .or(Some(0))
}

/// Parse text into a tree. `None` means corrupt: unparsable or a non-mapping root.
///
/// An empty file parses as an empty mapping.
fn parse_tree(text: &str) -> Option<ConfigTree> {
    if text.trim().is_empty() {
        return Some(ConfigTree::default());
    }
    match serde_yml::from_str::<Value>(text) {
        Ok(value @ Value::Mapping(_)) => Some(ConfigTree::from_value(value)),
        Ok(_) => None,
        Err(_) => None,
    }
}

/// Replace `path` with `contents`: write a sibling temp file, fsync, rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), ConfigError> {
    let io_err = |source: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp = sibling(path, &format!(".tmp.{}", std::process::id()));
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(e));
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn backup_path_with_epoch(path: &Path) -> PathBuf {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    sibling(path, &format!(".backup.{epoch}"))
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
