//! Load-order dependency graph over entity sets

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use crate::error::IntegrityError;
use crate::layout::BoundLayout;

/// Partial order over entity names: an edge `a -> b` means `a` loads before `b`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    /// `edges[i]` lists the nodes that depend on node `i`
    edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph with one node per layout entity and an edge per foreign key,
    /// plus `extra` edges given as `entity -> [dependencies]`.
    pub fn from_layout(
        layout: &BoundLayout,
        extra: &BTreeMap<String, Vec<String>>,
    ) -> Result<Self, IntegrityError> {
        let mut graph = Self::new();
        for entity in &layout.entities {
            graph.add_node(&entity.name);
        }
        for entity in &layout.entities {
            for r in &entity.references {
                graph.add_dependency(&entity.name, &r.entity)?;
            }
        }
        for (entity, deps) in extra {
            for dep in deps {
                graph.add_dependency(entity, dep)?;
            }
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, name: &str) -> usize {
        if let Some(i) = self.index(name) {
            return i;
        }
        self.nodes.push(name.to_string());
        self.edges.push(Vec::new());
        self.nodes.len() - 1
    }

    /// Declare that `entity` must load after `depends_on`. Both must exist.
    pub fn add_dependency(&mut self, entity: &str, depends_on: &str) -> Result<(), IntegrityError> {
        let unknown = |name: &str| IntegrityError::UnknownEntity {
            entity: name.to_string(),
        };
        let to = self.index(entity).ok_or_else(|| unknown(entity))?;
        let from = self.index(depends_on).ok_or_else(|| unknown(depends_on))?;
        if from == to {
            return Err(IntegrityError::Cycle {
                entities: vec![entity.to_string()],
            });
        }
        if !self.edges[from].contains(&to) {
            self.edges[from].push(to);
        }
        Ok(())
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n == name)
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Topological order (Kahn). Ties are broken by declaration order so the
    /// result is deterministic.
    pub fn load_order(&self) -> Result<Vec<String>, IntegrityError> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for targets in &self.edges {
            for &t in targets {
                in_degree[t] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(self.nodes[i].clone());
            for &t in &self.edges[i] {
                in_degree[t] -= 1;
                if in_degree[t] == 0 {
                    ready.push(Reverse(t));
                }
            }
        }

        if order.len() != self.nodes.len() {
            let entities = in_degree
                .iter()
                .enumerate()
                .filter(|(_, &d)| d > 0)
                .map(|(i, _)| self.nodes[i].clone())
                .collect();
            return Err(IntegrityError::Cycle { entities });
        }
        Ok(order)
    }

    /// Every entity that transitively depends on `name` (excluding itself).
    pub fn dependents(&self, name: &str) -> Vec<String> {
        let Some(start) = self.index(name) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            for &t in &self.edges[i] {
                if !seen[t] {
                    seen[t] = true;
                    stack.push(t);
                }
            }
        }
        seen[start] = false;
        seen.iter()
            .enumerate()
            .filter(|(_, &s)| s)
            .map(|(i, _)| self.nodes[i].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> Result<DependencyGraph, IntegrityError> {
        let mut g = DependencyGraph::new();
        for n in nodes {
            g.add_node(n);
        }
        for (entity, dep) in edges {
            g.add_dependency(entity, dep)?;
        }
        Ok(g)
    }

    #[test]
    fn dimensions_before_fact() {
        let g = graph(
            &["tracks", "artists", "albums"],
            &[("tracks", "artists"), ("tracks", "albums")],
        )
        .unwrap();
        assert_eq!(g.load_order().unwrap(), ["artists", "albums", "tracks"]);
    }

    #[test]
    fn ties_follow_declaration_order() {
        let g = graph(&["c", "b", "a"], &[]).unwrap();
        assert_eq!(g.load_order().unwrap(), ["c", "b", "a"]);
    }

    #[test]
    fn chain() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]).unwrap();
        assert_eq!(g.load_order().unwrap(), ["c", "b", "a"]);
    }

    #[test]
    fn cycle_detected() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "a"), ("c", "a")]).unwrap();
        match g.load_order() {
            Err(IntegrityError::Cycle { entities }) => {
                assert!(entities.contains(&"a".to_string()));
                assert!(entities.contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_edge_is_cycle() {
        assert!(matches!(
            graph(&["a"], &[("a", "a")]),
            Err(IntegrityError::Cycle { .. })
        ));
    }

    #[test]
    fn unknown_entity_rejected() {
        assert!(matches!(
            graph(&["a"], &[("a", "ghost")]),
            Err(IntegrityError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn transitive_dependents() {
        let g = graph(
            &["countries", "regions", "observations", "other"],
            &[("countries", "regions"), ("observations", "countries")],
        )
        .unwrap();
        let mut deps = g.dependents("regions");
        deps.sort();
        assert_eq!(deps, ["countries", "observations"]);
        assert!(g.dependents("other").is_empty());
    }
}
