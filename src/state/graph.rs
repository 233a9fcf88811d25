//! Dependency graph yielding nodes in a valid topological order.

use std::collections::{BTreeMap, HashMap, HashSet};

/// Why a dependency was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    UnknownNode(usize),
    Cycle,
}

/// Nodes with "depends on" edges.
///
/// Nodes are drained with [`remove_available`](Self::remove_available),
/// which always picks the oldest node whose dependencies are gone. Edges
/// that would close a cycle are refused, so draining always empties the
/// graph.
#[derive(Debug)]
pub struct DependencyGraph<T> {
    next_id: usize,
    nodes: BTreeMap<usize, T>,
    depends_on: HashMap<usize, HashSet<usize>>,
}

impl<T> Default for DependencyGraph<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            nodes: BTreeMap::new(),
            depends_on: HashMap::new(),
        }
    }
}

impl<T> DependencyGraph<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: T) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, value);
        id
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records that `node` must come after `dependency`.
    pub fn add_dependency(&mut self, node: usize, dependency: usize) -> Result<(), GraphError> {
        for id in [node, dependency] {
            if !self.nodes.contains_key(&id) {
                return Err(GraphError::UnknownNode(id));
            }
        }
        if node == dependency || self.reaches(dependency, node) {
            return Err(GraphError::Cycle);
        }
        self.depends_on.entry(node).or_default().insert(dependency);
        Ok(())
    }

    /// Whether `from` depends on `to`, directly or transitively.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(deps) = self.depends_on.get(&id) {
                stack.extend(deps.iter().copied());
            }
        }
        false
    }

    /// Removes and returns the oldest node with no remaining dependencies.
    pub fn remove_available(&mut self) -> Option<(usize, T)> {
        let id = self.nodes.keys().copied().find(|id| {
            self.depends_on
                .get(id)
                .is_none_or(|deps| deps.is_empty())
        })?;
        let value = self.nodes.remove(&id)?;
        self.depends_on.remove(&id);
        for deps in self.depends_on.values_mut() {
            deps.remove(&id);
        }
        Some((id, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T: Copy>(graph: &mut DependencyGraph<T>) -> Vec<T> {
        std::iter::from_fn(|| graph.remove_available().map(|(_, v)| v)).collect()
    }

    #[test]
    fn independent_nodes_come_out_in_insertion_order() {
        let mut graph = DependencyGraph::new();
        graph.add("a");
        graph.add("b");
        graph.add("c");
        assert_eq!(drain(&mut graph), vec!["a", "b", "c"]);
    }

    #[test]
    fn dependencies_are_honoured() {
        let mut graph = DependencyGraph::new();
        let a = graph.add("a");
        let b = graph.add("b");
        let c = graph.add("c");
        graph.add_dependency(a, c).unwrap();
        graph.add_dependency(b, a).unwrap();
        assert_eq!(drain(&mut graph), vec!["c", "a", "b"]);
        assert!(graph.is_empty());
    }

    #[test]
    fn cycles_are_refused() {
        let mut graph = DependencyGraph::new();
        let a = graph.add("a");
        let b = graph.add("b");
        let c = graph.add("c");
        graph.add_dependency(a, b).unwrap();
        graph.add_dependency(b, c).unwrap();
        assert_eq!(graph.add_dependency(c, a), Err(GraphError::Cycle));
        assert_eq!(graph.add_dependency(a, a), Err(GraphError::Cycle));
        assert_eq!(graph.add_dependency(a, 42), Err(GraphError::UnknownNode(42)));
        assert_eq!(drain(&mut graph), vec!["c", "b", "a"]);
    }
}
