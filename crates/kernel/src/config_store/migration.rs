//! Layout detection, legacy migration, and secret provisioning.

use chrono::Utc;
use rand::RngCore;
use serde_yml::{Mapping, Value};

use super::error::ConfigError;
use super::tree::{ConfigTree, mapping, remove_key_ordered};

pub const DEFAULT_PROJECT_ID: &str = "default";
pub const DEFAULT_PROJECT_NAME: &str = "Default Project";
pub const DEFAULT_DATABASE: &str = "keystone.db";
pub const DEFAULT_PORT: i64 = 3012;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Secrets provisioned on load, with their length in random bytes.
const SECRETS: [(&str, usize); 3] = [
    ("jwt_secret", 32),
    ("session_secret", 24),
    ("service_token", 32),
];

/// Which schema a parsed tree follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Root `plugins` mapping, no `projects`.
    Legacy,
    /// `projects` sequence.
    MultiProject,
    /// Neither marker is present; treated as multi-project once defaults are filled.
    Bare,
}

/// Classify a tree. Both markers at once is an error.
pub fn detect_layout(tree: &ConfigTree) -> Result<Layout, MixedLayout> {
    let Some(root) = tree.root_mapping() else {
        return Ok(Layout::Bare);
    };
    let legacy = root.get("plugins").is_some_and(Value::is_mapping);
    let modern = root.get("projects").is_some();

    match (legacy, modern) {
        (true, true) => Err(MixedLayout),
        (true, false) => Ok(Layout::Legacy),
        (false, true) => Ok(Layout::MultiProject),
        (false, false) => Ok(Layout::Bare),
    }
}

/// Marker returned by [`detect_layout`] when both layouts are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixedLayout;

/// Rewrite a legacy tree into the multi-project form in place.
///
/// Returns `false` when the tree was not legacy (already migrated trees are
/// left untouched).
pub fn migrate_legacy(tree: &mut ConfigTree) -> bool {
    if detect_layout(tree) != Ok(Layout::Legacy) {
        return false;
    }
    let Some(root) = tree.root_mapping_mut() else {
        return false;
    };

    let plugins = remove_key_ordered(root, "plugins").unwrap_or(Value::Mapping(Mapping::new()));
    let database = root
        .get("database")
        .and_then(|db| db.get("file"))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_DATABASE)
        .to_string();

    let project = mapping([
        ("id", Value::from(DEFAULT_PROJECT_ID)),
        ("name", Value::from(DEFAULT_PROJECT_NAME)),
        ("database", Value::from(database)),
        ("plugins", plugins),
        ("created_at", Value::from(Utc::now().to_rfc3339())),
    ]);
    root.insert(Value::from("projects"), Value::Sequence(vec![project]));

    let server = root
        .entry(Value::from("server"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !server.is_mapping() {
        *server = Value::Mapping(Mapping::new());
    }
    if let Some(server) = server.as_mapping_mut() {
        server.insert(Value::from("default_project"), Value::from(DEFAULT_PROJECT_ID));
    }

    true
}

/// Fill in missing sections of a multi-project tree.
///
/// Returns whether anything changed.
pub fn fill_defaults(tree: &mut ConfigTree) -> bool {
    let mut changed = false;
    if tree.root_mapping().is_none() {
        *tree = ConfigTree::default();
        changed = true;
    }
    let Some(root) = tree.root_mapping_mut() else {
        return changed;
    };

    let defaults = [
        (
            "server",
            mapping([
                ("port", Value::from(DEFAULT_PORT)),
                ("host", Value::from(DEFAULT_HOST)),
                ("default_project", Value::from(DEFAULT_PROJECT_ID)),
            ]),
        ),
        (
            "auth",
            mapping([("jwt_expires_in", Value::from("24h"))]),
        ),
        (
            "dev",
            mapping([
                ("enable_logging", Value::Bool(true)),
                ("enable_cors", Value::Bool(true)),
            ]),
        ),
    ];

    for (section, default) in defaults {
        let key = Value::from(section);
        match root.get_mut(&key) {
            Some(Value::Mapping(existing)) => {
                if let Value::Mapping(default) = default {
                    for (k, v) in default {
                        if !existing.contains_key(&k) {
                            existing.insert(k, v);
                            changed = true;
                        }
                    }
                }
            }
            _ => {
                root.insert(key, default);
                changed = true;
            }
        }
    }

    let has_projects = root
        .get("projects")
        .and_then(Value::as_sequence)
        .is_some_and(|projects| !projects.is_empty());
    if !has_projects {
        root.insert(
            Value::from("projects"),
            Value::Sequence(vec![default_project()]),
        );
        changed = true;
    }

    changed
}

/// Generate any missing or empty auth secret.
///
/// Returns the names of the secrets that were generated. A present secret
/// that is not a string is an error.
pub fn ensure_secrets(tree: &mut ConfigTree) -> Result<Vec<&'static str>, ConfigError> {
    let Some(root) = tree.root_mapping_mut() else {
        return Err(ConfigError::Invalid("config root is not a mapping".into()));
    };
    let auth = root
        .entry(Value::from("auth"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let Some(auth) = auth.as_mapping_mut() else {
        return Err(ConfigError::Invalid("'auth' must be a mapping".into()));
    };

    let mut generated = Vec::new();
    for (name, bytes) in SECRETS {
        match auth.get(name) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            None | Some(Value::Null) | Some(Value::String(_)) => {
                auth.insert(Value::from(name), Value::from(generate_secret(bytes)));
                generated.push(name);
            }
            Some(_) => {
                return Err(ConfigError::Invalid(format!(
                    "auth.{name} must be a string"
                )));
            }
        }
    }

    Ok(generated)
}

/// A fresh tree following the default skeleton, secrets included.
pub fn default_tree() -> Result<ConfigTree, ConfigError> {
    let mut tree = ConfigTree::default();
    fill_defaults(&mut tree);
    ensure_secrets(&mut tree)?;
    Ok(tree)
}

/// Random bytes, hex encoded.
pub fn generate_secret(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn default_project() -> Value {
    mapping([
        ("id", Value::from(DEFAULT_PROJECT_ID)),
        ("name", Value::from(DEFAULT_PROJECT_NAME)),
        ("database", Value::from(DEFAULT_DATABASE)),
        ("plugins", Value::Mapping(Mapping::new())),
        ("created_at", Value::from(Utc::now().to_rfc3339())),
    ])
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ConfigTree {
        ConfigTree::from_value(serde_yml::from_str(yaml).unwrap())
    }

    const LEGACY: &str = r#"
server:
  port: 3012
database:
  file: game.db
plugins:
  economy:
    enabled: true
"#;

    #[test]
    fn detects_each_layout() {
        assert_eq!(detect_layout(&parse(LEGACY)), Ok(Layout::Legacy));
        assert_eq!(
            detect_layout(&parse("projects: []\n")),
            Ok(Layout::MultiProject)
        );
        assert_eq!(detect_layout(&parse("server: {}\n")), Ok(Layout::Bare));
        assert_eq!(
            detect_layout(&parse("plugins: {}\nprojects: []\n")),
            Err(MixedLayout)
        );
    }

    #[test]
    fn migration_moves_plugins_into_default_project() {
        let mut tree = parse(LEGACY);
        assert!(migrate_legacy(&mut tree));

        assert!(tree.get_str_path("plugins").is_none());
        assert_eq!(
            tree.get_str_path("projects[0].database").and_then(Value::as_str),
            Some("game.db")
        );
        assert_eq!(
            tree.get_str_path("projects[0].plugins.economy.enabled"),
            Some(&Value::Bool(true))
        );
        assert_eq!(
            tree.get_str_path("server.default_project").and_then(Value::as_str),
            Some("default")
        );
        // Legacy database section is kept.
        assert!(tree.get_str_path("database.file").is_some());
    }

    #[test]
    fn migration_is_idempotent() {
        let mut tree = parse(LEGACY);
        migrate_legacy(&mut tree);
        let once = tree.clone();
        assert!(!migrate_legacy(&mut tree));
        assert_eq!(tree, once);
    }

    #[test]
    fn secrets_are_generated_with_expected_length() {
        let mut tree = parse("auth:\n  jwt_secret: ''\n");
        let generated = ensure_secrets(&mut tree).unwrap();
        assert_eq!(generated, vec!["jwt_secret", "session_secret", "service_token"]);

        let jwt = tree.get_str_path("auth.jwt_secret").and_then(Value::as_str).unwrap();
        let session = tree
            .get_str_path("auth.session_secret")
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(jwt.len(), 64);
        assert_eq!(session.len(), 48);
    }

    #[test]
    fn existing_secrets_are_kept() {
        let mut tree = parse("auth:\n  jwt_secret: abc\n  session_secret: def\n  service_token: ghi\n");
        assert!(ensure_secrets(&mut tree).unwrap().is_empty());
        assert_eq!(
            tree.get_str_path("auth.jwt_secret").and_then(Value::as_str),
            Some("abc")
        );
    }

    #[test]
    fn non_string_secret_is_invalid() {
        let mut tree = parse("auth:\n  jwt_secret: [1, 2]\n");
        assert!(matches!(
            ensure_secrets(&mut tree),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn default_tree_has_skeleton() {
        let tree = default_tree().unwrap();
        assert_eq!(
            tree.get_str_path("server.port").and_then(Value::as_i64),
            Some(3012)
        );
        assert_eq!(
            tree.get_str_path("projects[0].id").and_then(Value::as_str),
            Some("default")
        );
        assert_eq!(
            tree.get_str_path("dev.enable_cors"),
            Some(&Value::Bool(true))
        );
    }
}
