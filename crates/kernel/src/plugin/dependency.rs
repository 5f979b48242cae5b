//! Plugin dependency resolution using topological sort.
//!
//! Ensures plugins are activated in the correct order based on their
//! dependencies. Uses Kahn's algorithm for topological sorting with cycle
//! detection. Ties are broken by name so the order is deterministic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Plugin name to the names it depends on.
pub type DependencyGraph = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// Declared dependencies that no plugin provides, as `(plugin, dependency)`.
    Missing(Vec<(String, String)>),
    /// Plugins that take part in (or hang off) a cycle.
    Cycle(Vec<String>),
}

/// Topologically sort `names` and everything they transitively depend on.
///
/// Returns plugins so that dependencies come before dependents. Fails if a
/// dependency is unknown or the reachable graph contains a cycle.
pub fn resolve_order<'a>(
    names: impl IntoIterator<Item = &'a str>,
    graph: &DependencyGraph,
) -> Result<Vec<String>, DependencyError> {
    let closure = closure(names, graph)?;

    // in_degree[p] = number of plugins in the closure that p depends on
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for name in &closure {
        in_degree.entry(name.as_str()).or_insert(0);
        for dep in graph.get(name).into_iter().flatten() {
            *in_degree.entry(name.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(&name, _)| name)
        .collect();
    let mut result = Vec::with_capacity(closure.len());

    while let Some(plugin) = queue.pop_front() {
        result.push(plugin.to_string());

        let mut ready = Vec::new();
        for dependent in dependents.get(plugin).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(*dependent);
                }
            }
        }
        ready.sort_unstable();
        queue.extend(ready);
    }

    if result.len() != closure.len() {
        let placed: BTreeSet<&str> = result.iter().map(String::as_str).collect();
        let stuck = closure
            .iter()
            .filter(|name| !placed.contains(name.as_str()))
            .cloned()
            .collect();
        return Err(DependencyError::Cycle(stuck));
    }

    Ok(result)
}

/// `names` plus every plugin they transitively depend on.
pub fn closure<'a>(
    names: impl IntoIterator<Item = &'a str>,
    graph: &DependencyGraph,
) -> Result<BTreeSet<String>, DependencyError> {
    let mut seen = BTreeSet::new();
    let mut missing = Vec::new();
    let mut stack: Vec<String> = names.into_iter().map(str::to_string).collect();

    while let Some(name) = stack.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        for dep in graph.get(&name).into_iter().flatten() {
            if graph.contains_key(dep) {
                stack.push(dep.clone());
            } else {
                missing.push((name.clone(), dep.clone()));
            }
        }
    }

    if missing.is_empty() {
        Ok(seen)
    } else {
        Err(DependencyError::Missing(missing))
    }
}

/// Plugins that list `name` as a direct dependency.
pub fn direct_dependents(name: &str, graph: &DependencyGraph) -> Vec<String> {
    graph
        .iter()
        .filter(|(_, deps)| deps.iter().any(|d| d == name))
        .map(|(plugin, _)| plugin.clone())
        .collect()
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn no_dependencies() {
        let g = graph(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let order = resolve_order(["a", "b", "c"], &g).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn simple_chain() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let order = resolve_order(["c"], &g).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond() {
        // d depends on b and c, both depend on a
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let order = resolve_order(["d"], &g).unwrap();
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn closure_ignores_unrelated_plugins() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("x", &[])]);
        let order = resolve_order(["b"], &g).unwrap();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn missing_dependency() {
        let g = graph(&[("a", &["ghost"])]);
        let err = resolve_order(["a"], &g).unwrap_err();
        assert_eq!(
            err,
            DependencyError::Missing(vec![("a".to_string(), "ghost".to_string())])
        );
    }

    #[test]
    fn cycle_detected() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        let err = resolve_order(["b", "d"], &g).unwrap_err();
        assert_eq!(
            err,
            DependencyError::Cycle(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn dependents_are_direct_only() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        assert_eq!(direct_dependents("a", &g), vec!["b"]);
    }
}
