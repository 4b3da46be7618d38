//! Dependency graph (DAG) construction and traversal
//!
//! Builds forward and reverse reference graphs between schemas. An edge
//! `fact_sales -> dim_store` means `fact_sales` references `dim_store`, so
//! `dim_store` must be resolved first.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use stellate_core::SchemaDefinition;

/// Node identifier (schema name)
pub type NodeId = String;

/// Dependency graph with forward and reverse edges
///
/// Ordered maps keep every traversal deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Forward edges: node -> dimensions it references (parents)
    parents: BTreeMap<NodeId, BTreeSet<NodeId>>,

    /// Reverse edges: node -> schemas that reference it (children)
    children: BTreeMap<NodeId, BTreeSet<NodeId>>,

    /// All nodes in the graph
    nodes: BTreeSet<NodeId>,
}

impl DependencyGraph {
    /// Build a dependency graph from schema definitions
    pub fn from_definitions<'a, I>(definitions: I) -> Self
    where
        I: IntoIterator<Item = &'a SchemaDefinition>,
    {
        let mut graph = Self::default();
        for definition in definitions {
            graph.add_node(&definition.name);
            for reference in &definition.references {
                graph.add_edge(&definition.name, &reference.dimension);
            }
        }
        graph
    }

    /// Add a node without edges
    pub fn add_node(&mut self, node: &str) {
        self.nodes.insert(node.to_string());
    }

    /// Record that `node` depends on `parent`
    pub fn add_edge(&mut self, node: &str, parent: &str) {
        self.nodes.insert(node.to_string());
        self.nodes.insert(parent.to_string());
        self.parents
            .entry(node.to_string())
            .or_default()
            .insert(parent.to_string());
        self.children
            .entry(parent.to_string())
            .or_default()
            .insert(node.to_string());
    }

    /// Get all upstream nodes (transitive closure of parents)
    pub fn upstream(&self, node_id: &str) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut result = Vec::new();

        if let Some(next) = self.parents.get(node_id) {
            queue.extend(next.iter().cloned());
        }

        // BFS over parent edges
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            result.push(current.clone());

            if let Some(next) = self.parents.get(&current) {
                for node in next {
                    if !visited.contains(node) {
                        queue.push_back(node.clone());
                    }
                }
            }
        }

        result
    }

    /// Get topological sort of all nodes, dependencies first
    ///
    /// Ties are broken by name. Returns `None` when the graph has a cycle.
    pub fn topological_sort(&self) -> Option<Vec<NodeId>> {
        let mut in_degree: BTreeMap<&NodeId, usize> = self
            .nodes
            .iter()
            .map(|node| (node, self.parents.get(node).map_or(0, |p| p.len())))
            .collect();

        let mut ready: BTreeSet<&NodeId> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&node, _)| node)
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());

        // Kahn's algorithm
        while let Some(node) = ready.pop_first() {
            result.push(node.clone());

            if let Some(children) = self.children.get(node) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(child);
                        }
                    }
                }
            }
        }

        // Check if all nodes were visited (no cycles)
        if result.len() == self.nodes.len() {
            Some(result)
        } else {
            None
        }
    }

    /// Find one dependency cycle, if any
    ///
    /// Iterative depth-first search with an explicit stack. The returned
    /// path starts and ends with the same node.
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks: BTreeMap<&NodeId, Mark> =
            self.nodes.iter().map(|n| (n, Mark::Unvisited)).collect();
        let empty = BTreeSet::new();

        for root in &self.nodes {
            if marks.get(root) != Some(&Mark::Unvisited) {
                continue;
            }

            // Each frame: node plus the iterator over its remaining parents
            let mut stack: Vec<(&NodeId, std::collections::btree_set::Iter<'_, NodeId>)> =
                vec![(root, self.parents.get(root).unwrap_or(&empty).iter())];
            marks.insert(root, Mark::InProgress);

            while let Some((node, iter)) = stack.last_mut() {
                let node: &NodeId = *node;
                match iter.next() {
                    Some(parent) => match marks.get(parent).copied() {
                        Some(Mark::InProgress) => {
                            let start = stack.iter().position(|(n, _)| *n == parent)?;
                            let mut path: Vec<NodeId> =
                                stack[start..].iter().map(|(n, _)| (*n).clone()).collect();
                            path.push(parent.clone());
                            return Some(path);
                        }
                        Some(Mark::Unvisited) => {
                            marks.insert(parent, Mark::InProgress);
                            stack.push((parent, self.parents.get(parent).unwrap_or(&empty).iter()));
                        }
                        _ => {}
                    },
                    None => {
                        marks.insert(node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }

        None
    }
}
