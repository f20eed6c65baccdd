//! Directed dependency graph with Kahn topological sort
//!
//! Nodes are keyed by name; edges are stored as name sets on both endpoints
//! so the graph never holds references into itself.

use crate::errors::{Result, Test161Error};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A graph node: a name, a payload, and its edge sets.
#[derive(Debug, Clone)]
pub struct GraphNode<T> {
    pub name: String,
    pub value: T,
    pub edges_out: BTreeSet<String>,
    pub edges_in: BTreeSet<String>,
}

/// Directed graph keyed by node name
#[derive(Debug, Clone)]
pub struct Graph<T> {
    nodes: BTreeMap<String, GraphNode<T>>,
}

impl<T> Default for Graph<T> {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }
}

impl<T: Clone> Graph<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Re-adding an existing name replaces its payload and keeps
    /// its edges.
    pub fn add_node(&mut self, name: &str, value: T) {
        match self.nodes.get_mut(name) {
            Some(node) => node.value = value,
            None => {
                self.nodes.insert(
                    name.to_string(),
                    GraphNode {
                        name: name.to_string(),
                        value,
                        edges_out: BTreeSet::new(),
                        edges_in: BTreeSet::new(),
                    },
                );
            }
        }
    }

    /// Add an edge `from -> to`. Self-edges and unknown endpoints are rejected.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Err(Test161Error::DependencyCycle(format!(
                "self edge on {}",
                from
            )));
        }
        if !self.nodes.contains_key(from) {
            return Err(Test161Error::DependencyUnresolved(from.to_string()));
        }
        if !self.nodes.contains_key(to) {
            return Err(Test161Error::DependencyUnresolved(to.to_string()));
        }

        if let Some(node) = self.nodes.get_mut(from) {
            node.edges_out.insert(to.to_string());
        }
        if let Some(node) = self.nodes.get_mut(to) {
            node.edges_in.insert(from.to_string());
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode<T>> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode<T>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topologically sort the graph (Kahn). An edge `a -> b` places `a`
    /// before `b`. The sort runs on a working copy; `self` is untouched.
    ///
    /// Returns `DependencyCycle` naming the nodes left with edges when the
    /// graph is not a DAG.
    pub fn topsort(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .values()
            .map(|n| (n.name.as_str(), n.edges_in.len()))
            .collect();

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            for next in &self.nodes[name].edges_out {
                if let Some(d) = in_degree.get_mut(next.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(next.as_str());
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(Test161Error::DependencyCycle(stuck.join(", ")));
        }

        Ok(order)
    }
}
