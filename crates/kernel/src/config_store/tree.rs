//! Dot-addressable YAML tree.
//!
//! Paths use dot notation with optional `[n]` sequence indexes:
//! `projects[0].plugins.economy.enabled`. A bare numeric segment also
//! indexes a sequence (`projects.0.id`).

use serde_yml::{Mapping, Value};

use super::error::ConfigError;

/// One step in a config path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed config path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPath {
    segments: Vec<Segment>,
}

impl ConfigPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse dot notation. Keys may not be empty.
    pub fn parse(path: &str) -> Result<Self, ConfigError> {
        if path.trim().is_empty() {
            return Err(ConfigError::invalid_path(path, "path is empty"));
        }

        let mut segments = Vec::new();
        for part in path.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };

            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            } else if rest.is_empty() {
                return Err(ConfigError::invalid_path(path, "empty segment"));
            }

            while !rest.is_empty() {
                let Some(close) = rest.find(']') else {
                    return Err(ConfigError::invalid_path(path, "unterminated '['"));
                };
                let index = rest[1..close].parse::<usize>().map_err(|_| {
                    ConfigError::invalid_path(path, format!("bad index '{}'", &rest[1..close]))
                })?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(ConfigError::invalid_path(
                        path,
                        "unexpected characters after ']'",
                    ));
                }
            }
        }

        Ok(Self { segments })
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.segments.push(Segment::Key(key.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.segments.push(Segment::Index(index));
        self
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl std::fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            match segment {
                Segment::Key(k) => {
                    if !first {
                        f.write_str(".")?;
                    }
                    f.write_str(k)?;
                }
                Segment::Index(i) => write!(f, "[{i}]")?,
            }
            first = false;
        }
        Ok(())
    }
}

/// The parsed config file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigTree {
    root: Value,
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self {
            root: Value::Mapping(Mapping::new()),
        }
    }
}

impl ConfigTree {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    pub fn root_mapping(&self) -> Option<&Mapping> {
        self.root.as_mapping()
    }

    pub fn root_mapping_mut(&mut self) -> Option<&mut Mapping> {
        self.root.as_mapping_mut()
    }

    /// Look up a node. Missing intermediate nodes yield `None`.
    pub fn get(&self, path: &ConfigPath) -> Option<&Value> {
        let mut node = &self.root;
        for segment in path.segments() {
            node = step(node, segment)?;
        }
        Some(node)
    }

    /// Look up a node by dot notation. Unparsable paths yield `None`.
    pub fn get_str_path(&self, path: &str) -> Option<&Value> {
        let path = ConfigPath::parse(path).ok()?;
        self.get(&path)
    }

    pub fn get_mut(&mut self, path: &ConfigPath) -> Option<&mut Value> {
        let mut node = &mut self.root;
        for segment in path.segments() {
            node = step_mut(node, segment)?;
        }
        Some(node)
    }

    /// Set a node, creating intermediate mappings as needed.
    ///
    /// Sequence indexes must address an existing element or the position
    /// one past the end (append).
    pub fn set(&mut self, path: &ConfigPath, value: Value) -> Result<(), ConfigError> {
        let Some((last, parents)) = path.segments().split_last() else {
            self.root = value;
            return Ok(());
        };

        let mut node = &mut self.root;
        for (pos, segment) in parents.iter().enumerate() {
            let next_is_index = matches!(path.segments().get(pos + 1), Some(Segment::Index(_)));
            node = descend_or_create(node, segment, next_is_index)
                .map_err(|reason| ConfigError::invalid_path(path.to_string(), reason))?;
        }

        match (last, node) {
            (Segment::Key(key), Value::Mapping(map)) => {
                map.insert(Value::String(key.clone()), value);
                Ok(())
            }
            (Segment::Key(key), node @ Value::Null) => {
                let mut map = Mapping::new();
                map.insert(Value::String(key.clone()), value);
                *node = Value::Mapping(map);
                Ok(())
            }
            (Segment::Index(i), Value::Sequence(seq)) if *i < seq.len() => {
                seq[*i] = value;
                Ok(())
            }
            (Segment::Index(i), Value::Sequence(seq)) if *i == seq.len() => {
                seq.push(value);
                Ok(())
            }
            (Segment::Index(i), _) => Err(ConfigError::invalid_path(
                path.to_string(),
                format!("index {i} is out of range"),
            )),
            (Segment::Key(key), _) => Err(ConfigError::invalid_path(
                path.to_string(),
                format!("cannot set '{key}' on a scalar"),
            )),
        }
    }

    /// Remove a node and return it. Mapping order of the remaining keys is kept.
    pub fn remove(&mut self, path: &ConfigPath) -> Option<Value> {
        let (last, parents) = path.segments().split_last()?;
        let mut node = &mut self.root;
        for segment in parents {
            node = step_mut(node, segment)?;
        }

        match (last, node) {
            (Segment::Key(key), Value::Mapping(map)) => remove_key_ordered(map, key),
            (Segment::Index(i), Value::Sequence(seq)) if *i < seq.len() => Some(seq.remove(*i)),
            _ => None,
        }
    }

    /// Render as YAML text.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yml::to_string(&self.root).map_err(|e| ConfigError::Serialize(e.to_string()))
    }
}

/// Remove `key` from `map` while keeping the order of the other entries.
pub fn remove_key_ordered(map: &mut Mapping, key: &str) -> Option<Value> {
    let removed = map.get(key).cloned()?;
    let kept: Mapping = map
        .iter()
        .filter(|(k, _)| k.as_str() != Some(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    *map = kept;
    Some(removed)
}

/// Build a mapping from string keys, preserving the given order.
pub fn mapping<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (&'static str, Value)>,
{
    let mut map = Mapping::new();
    for (k, v) in entries {
        map.insert(Value::String(k.to_string()), v);
    }
    Value::Mapping(map)
}

fn step<'a>(node: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match (segment, node) {
        (Segment::Key(key), Value::Mapping(map)) => map.get(key.as_str()),
        (Segment::Key(key), Value::Sequence(seq)) => seq.get(key.parse::<usize>().ok()?),
        (Segment::Index(i), Value::Sequence(seq)) => seq.get(*i),
        _ => None,
    }
}

fn step_mut<'a>(node: &'a mut Value, segment: &Segment) -> Option<&'a mut Value> {
    match (segment, node) {
        (Segment::Key(key), Value::Mapping(map)) => map.get_mut(key.as_str()),
        (Segment::Key(key), Value::Sequence(seq)) => seq.get_mut(key.parse::<usize>().ok()?),
        (Segment::Index(i), Value::Sequence(seq)) => seq.get_mut(*i),
        _ => None,
    }
}

fn descend_or_create<'a>(
    node: &'a mut Value,
    segment: &Segment,
    next_is_index: bool,
) -> Result<&'a mut Value, String> {
    let empty_child = || {
        if next_is_index {
            Value::Sequence(Vec::new())
        } else {
            Value::Mapping(Mapping::new())
        }
    };

    if node.is_null() {
        *node = Value::Mapping(Mapping::new());
    }

    match (segment, node) {
        (Segment::Key(key), Value::Mapping(map)) => {
            let k = Value::String(key.clone());
            if !map.contains_key(key.as_str()) {
                map.insert(k.clone(), empty_child());
            }
            map.get_mut(key.as_str())
                .ok_or_else(|| format!("failed to create '{key}'"))
        }
        (Segment::Index(i), Value::Sequence(seq)) => {
            if *i == seq.len() {
                seq.push(empty_child());
            }
            seq.get_mut(*i)
                .ok_or_else(|| format!("index {i} is out of range"))
        }
        (Segment::Key(key), _) => Err(format!("'{key}' traverses a non-mapping node")),
        (Segment::Index(i), _) => Err(format!("[{i}] traverses a non-sequence node")),
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample() -> ConfigTree {
        let yaml = r#"
server:
  port: 3012
projects:
  - id: default
    plugins:
      economy:
        enabled: true
"#;
        ConfigTree::from_value(serde_yml::from_str(yaml).unwrap())
    }

    #[test]
    fn parse_mixed_notation() {
        let path = ConfigPath::parse("projects[0].plugins.economy.enabled").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("projects".into()),
                Segment::Index(0),
                Segment::Key("plugins".into()),
                Segment::Key("economy".into()),
                Segment::Key("enabled".into()),
            ]
        );
        assert_eq!(path.to_string(), "projects[0].plugins.economy.enabled");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ConfigPath::parse("").is_err());
        assert!(ConfigPath::parse("a..b").is_err());
        assert!(ConfigPath::parse("a[x]").is_err());
        assert!(ConfigPath::parse("a[0").is_err());
    }

    #[test]
    fn get_walks_sequences_both_ways() {
        let tree = sample();
        assert_eq!(
            tree.get_str_path("projects[0].plugins.economy.enabled"),
            Some(&Value::Bool(true))
        );
        assert_eq!(
            tree.get_str_path("projects.0.id").and_then(Value::as_str),
            Some("default")
        );
        assert!(tree.get_str_path("projects[3].id").is_none());
        assert!(tree.get_str_path("server.port.deeper").is_none());
    }

    #[test]
    fn set_creates_intermediate_mappings() {
        let mut tree = sample();
        let path = ConfigPath::parse("dev.enable_cors").unwrap();
        tree.set(&path, Value::Bool(false)).unwrap();
        assert_eq!(tree.get(&path), Some(&Value::Bool(false)));
    }

    #[test]
    fn set_refuses_to_overwrite_scalars_with_children() {
        let mut tree = sample();
        let path = ConfigPath::parse("server.port.inner").unwrap();
        assert!(tree.set(&path, Value::Bool(true)).is_err());
    }

    #[test]
    fn remove_keeps_sibling_order() {
        let yaml = "a: 1\nb: 2\nc: 3\n";
        let mut tree = ConfigTree::from_value(serde_yml::from_str(yaml).unwrap());
        tree.remove(&ConfigPath::parse("b").unwrap()).unwrap();
        let keys: Vec<_> = tree
            .root_mapping()
            .unwrap()
            .iter()
            .map(|(k, _)| k.as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["a", "c"]);
    }
}
