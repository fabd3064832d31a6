//! Stage dependency graph and wave computation

use crate::error::{OrchestrationError, OrchestrationResult};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Validated, acyclic dependency graph over named nodes
///
/// Edges point from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    /// Declaration order, used to keep wave contents stable
    declared: Vec<String>,
    topological: Vec<String>,
}

impl DependencyGraph {
    /// Build and validate a graph from `(name, dependencies)` pairs.
    ///
    /// Fails with `InvalidDependencyGraph` on duplicate names, dependencies
    /// on undeclared nodes, self-dependencies and cycles.
    pub fn build<'a, I>(pipeline: &str, nodes: I) -> OrchestrationResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let invalid = |reason: String| OrchestrationError::InvalidDependencyGraph {
            pipeline: pipeline.to_string(),
            reason,
        };

        let nodes: Vec<(&str, &[String])> = nodes.into_iter().collect();
        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(nodes.len());
        let mut declared = Vec::with_capacity(nodes.len());

        for (name, _) in &nodes {
            if index.contains_key(*name) {
                return Err(invalid(format!("stage '{name}' is defined more than once")));
            }
            let idx = graph.add_node(name.to_string());
            index.insert(name.to_string(), idx);
            declared.push(name.to_string());
        }

        for (name, dependencies) in &nodes {
            let to = index[*name];
            for dependency in dependencies.iter() {
                if dependency == name {
                    return Err(invalid(format!("stage '{name}' depends on itself")));
                }
                let Some(&from) = index.get(dependency.as_str()) else {
                    return Err(invalid(format!(
                        "stage '{name}' depends on undefined stage '{dependency}'"
                    )));
                };
                graph.update_edge(from, to, ());
            }
        }

        let topological = toposort(&graph, None)
            .map_err(|cycle| {
                invalid(format!(
                    "dependency cycle involving stage '{}'",
                    graph[cycle.node_id()]
                ))
            })?
            .into_iter()
            .map(|idx| graph[idx].clone())
            .collect();

        Ok(Self {
            graph,
            index,
            declared,
            topological,
        })
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// A valid execution order: every node after all of its dependencies
    pub fn topological_order(&self) -> &[String] {
        &self.topological
    }

    /// Direct dependencies of a node
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.index
            .get(name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .map(|dep| self.graph[dep].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Group nodes into waves.
    ///
    /// Each wave holds every node whose dependencies all sit in earlier
    /// waves, so the wave count equals the longest dependency chain. Nodes
    /// keep declaration order inside a wave.
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut level: HashMap<NodeIndex, usize> = HashMap::with_capacity(self.len());
        for name in &self.topological {
            let idx = self.index[name];
            let depth = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|dep| level.get(&dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            level.insert(idx, depth);
        }

        let count = level.values().max().map_or(0, |max| max + 1);
        let mut waves = vec![Vec::new(); count];
        for name in &self.declared {
            let depth = level[&self.index[name]];
            waves[depth].push(name.clone());
        }
        waves
    }
}
