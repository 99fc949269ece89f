//! Task graph builder with validation.

use super::{NodeSpec, TaskGraph};
use crate::errors::{ContractErrorInfo, CycleDetectedError, PipelineValidationError};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Builder for creating validated task graphs.
///
/// Nodes are added first, then ordering edges between them. Structural
/// problems local to one call (duplicates, unknown endpoints, self-edges)
/// are rejected immediately; cycles and emptiness are checked by
/// [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    name: String,
    nodes: HashMap<String, NodeSpec>,
    node_order: Vec<String>,
    upstream: HashMap<String, BTreeSet<String>>,
}

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashMap::new(),
            node_order: Vec::new(),
            upstream: HashMap::new(),
        }
    }

    /// Adds a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or already taken.
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<&mut Self, PipelineValidationError> {
        spec.validate()?;

        if self.nodes.contains_key(&spec.name) {
            return Err(PipelineValidationError::new(format!(
                "Node '{}' is defined more than once",
                spec.name
            ))
            .with_nodes(vec![spec.name.clone()])
            .with_error_info(
                ContractErrorInfo::new("GRAPH-002-DUPLICATE", "Duplicate node identifier")
                    .with_fix_hint("Give every node a unique identifier."),
            ));
        }

        self.node_order.push(spec.name.clone());
        self.upstream.insert(spec.name.clone(), BTreeSet::new());
        self.nodes.insert(spec.name.clone(), spec);
        Ok(self)
    }

    /// Adds an ordering edge: `to` runs only after `from` succeeded.
    ///
    /// Adding the same edge twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if either endpoint is unknown or the edge is a self-edge.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<&mut Self, PipelineValidationError> {
        for endpoint in [from, to] {
            if !self.nodes.contains_key(endpoint) {
                return Err(PipelineValidationError::new(format!(
                    "Edge {from} -> {to} references unknown node '{endpoint}'"
                ))
                .with_nodes(vec![from.to_string(), to.to_string()])
                .with_error_info(
                    ContractErrorInfo::new(
                        "GRAPH-003-MISSING_NODE",
                        format!("Node '{endpoint}' not found"),
                    )
                    .with_fix_hint("Add both nodes before connecting them.")
                    .with_context_entry("edge", format!("{from} -> {to}")),
                ));
            }
        }

        if from == to {
            return Err(PipelineValidationError::new(format!(
                "Node '{from}' cannot depend on itself"
            ))
            .with_nodes(vec![from.to_string()])
            .with_error_info(ContractErrorInfo::new(
                "GRAPH-004-SELF_EDGE",
                "Self-referencing edge",
            )));
        }

        if let Some(deps) = self.upstream.get_mut(to) {
            deps.insert(from.to_string());
        }
        Ok(self)
    }

    /// Adds edges from every node in `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns the first edge error encountered.
    pub fn add_edges_into(
        &mut self,
        from: &[&str],
        to: &str,
    ) -> Result<&mut Self, PipelineValidationError> {
        for upstream in from {
            self.add_edge(upstream, to)?;
        }
        Ok(self)
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is empty or contains a cycle.
    pub fn build(self) -> Result<TaskGraph, PipelineValidationError> {
        if self.nodes.is_empty() {
            return Err(PipelineValidationError::new("Graph has no nodes").with_error_info(
                ContractErrorInfo::new("GRAPH-005-EMPTY", "Cannot build an empty graph")
                    .with_fix_hint("Add at least one node before building."),
            ));
        }

        self.detect_cycles()?;

        Ok(TaskGraph::new(
            self.name,
            self.nodes,
            self.node_order,
            self.upstream,
        ))
    }

    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        // insertion order keeps the reported cycle stable
        for name in &self.node_order {
            if !visited.contains(name.as_str()) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut rec_stack, &mut path)
                {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(deps) = self.upstream.get(node) {
            for dep in deps {
                if !visited.contains(dep) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep) {
                    let start = path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(dep.clone());
                    // path follows dependencies; report it in execution direction
                    cycle.reverse();
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }
}
