/// Graph validation
///
/// Runs the structural checks a definition must pass before it can be frozen
/// into a [`Graph`](crate::workflow::Graph), in a fixed order:
///
/// 1. node ids and per-node port names are unique
/// 2. every edge references existing nodes and ports
/// 3. every required input is bound exactly once, optional inputs at most once
/// 4. the required-input dependency graph is acyclic
///
/// Validation is pure: the same definition always yields the same result.

use crate::workflow::types::{Edge, GraphDefinition, Node};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Which side of a node a port sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Input,
    Output,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Input => f.write_str("input"),
            PortKind::Output => f.write_str("output"),
        }
    }
}

/// A malformed or inconsistent graph definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("node '{node}': input '{port}' has malformed binding '{binding}' (expected \"<node>/<port>\")")]
    MalformedBinding {
        node: String,
        port: String,
        binding: String,
    },

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("node '{node}' declares {kind} port '{port}' more than once")]
    DuplicatePort {
        node: String,
        port: String,
        kind: PortKind,
    },

    #[error("edge {edge} references unknown node '{node}'")]
    UnknownNode { edge: String, node: String },

    #[error("edge {edge} references unknown {kind} port '{port}' on node '{node}'")]
    UnknownPort {
        edge: String,
        node: String,
        port: String,
        kind: PortKind,
    },

    #[error("required input '{port}' of node '{node}' is not bound to any output")]
    UnboundInput { node: String, port: String },

    #[error("input '{port}' of node '{node}' is bound by {count} edges, expected at most one")]
    MultipleBindings {
        node: String,
        port: String,
        count: usize,
    },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Validate a definition, returning the first failure found
pub fn validate(definition: &GraphDefinition) -> Result<(), ValidationError> {
    match validate_all(definition).into_iter().next() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Validate a definition, returning every failure found, in check order
///
/// Edges that fail the reference check are left out of the later binding and
/// cycle checks so one dangling edge is not reported three times.
pub fn validate_all(definition: &GraphDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    tracing::debug!(
        "🔍 Validating graph with {} nodes and {} edges",
        definition.nodes.len(),
        definition.edges.len()
    );

    check_unique_ids(&definition.nodes, &mut errors);

    let nodes: HashMap<&str, &Node> = definition
        .nodes
        .iter()
        .map(|node| (node.id.as_str(), node))
        .collect();

    let resolved = check_edge_references(&nodes, &definition.edges, &mut errors);
    check_bindings(&definition.nodes, &resolved, &mut errors);

    if let Some(cycle) = find_required_cycle(&definition.nodes, &nodes, &resolved) {
        errors.push(ValidationError::Cycle(cycle));
    }

    if errors.is_empty() {
        tracing::debug!("✅ Graph validation successful");
    } else {
        tracing::debug!("❌ Graph validation found {} problem(s)", errors.len());
    }

    errors
}

fn check_unique_ids(nodes: &[Node], errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNode(node.id.clone()));
        }

        let mut inputs = HashSet::new();
        for port in &node.inputs {
            if !inputs.insert(port.name.as_str()) {
                errors.push(ValidationError::DuplicatePort {
                    node: node.id.clone(),
                    port: port.name.clone(),
                    kind: PortKind::Input,
                });
            }
        }

        let mut outputs = HashSet::new();
        for port in &node.outputs {
            if !outputs.insert(port.as_str()) {
                errors.push(ValidationError::DuplicatePort {
                    node: node.id.clone(),
                    port: port.clone(),
                    kind: PortKind::Output,
                });
            }
        }
    }
}

/// Returns the edges whose endpoints both resolve
fn check_edge_references<'a>(
    nodes: &HashMap<&str, &Node>,
    edges: &'a [Edge],
    errors: &mut Vec<ValidationError>,
) -> Vec<&'a Edge> {
    let mut resolved = Vec::with_capacity(edges.len());

    for edge in edges {
        let mut ok = true;

        match nodes.get(edge.from.node.as_str()) {
            None => {
                errors.push(ValidationError::UnknownNode {
                    edge: edge.to_string(),
                    node: edge.from.node.clone(),
                });
                ok = false;
            }
            Some(producer) if !producer.has_output(&edge.from.port) => {
                errors.push(ValidationError::UnknownPort {
                    edge: edge.to_string(),
                    node: edge.from.node.clone(),
                    port: edge.from.port.clone(),
                    kind: PortKind::Output,
                });
                ok = false;
            }
            Some(_) => {}
        }

        match nodes.get(edge.to.node.as_str()) {
            None => {
                errors.push(ValidationError::UnknownNode {
                    edge: edge.to_string(),
                    node: edge.to.node.clone(),
                });
                ok = false;
            }
            Some(consumer) if consumer.input(&edge.to.port).is_none() => {
                errors.push(ValidationError::UnknownPort {
                    edge: edge.to_string(),
                    node: edge.to.node.clone(),
                    port: edge.to.port.clone(),
                    kind: PortKind::Input,
                });
                ok = false;
            }
            Some(_) => {}
        }

        if ok {
            resolved.push(edge);
        }
    }

    resolved
}

fn check_bindings(nodes: &[Node], edges: &[&Edge], errors: &mut Vec<ValidationError>) {
    let mut counts: HashMap<(&str, &str), usize> = HashMap::new();
    for edge in edges {
        *counts
            .entry((edge.to.node.as_str(), edge.to.port.as_str()))
            .or_default() += 1;
    }

    for node in nodes {
        for port in &node.inputs {
            let count = counts
                .get(&(node.id.as_str(), port.name.as_str()))
                .copied()
                .unwrap_or(0);
            if count == 0 && !port.optional {
                errors.push(ValidationError::UnboundInput {
                    node: node.id.clone(),
                    port: port.name.clone(),
                });
            } else if count > 1 {
                errors.push(ValidationError::MultipleBindings {
                    node: node.id.clone(),
                    port: port.name.clone(),
                    count,
                });
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search over required-input edges
///
/// Returns the first cycle found as a closed node sequence (`a, b, a`).
/// Traversal follows node declaration order so the reported cycle is stable.
/// The path is kept on an explicit stack, so graph depth is bounded by memory
/// rather than by the thread's call stack.
fn find_required_cycle(
    order: &[Node],
    nodes: &HashMap<&str, &Node>,
    edges: &[&Edge],
) -> Option<Vec<String>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        let required = nodes
            .get(edge.to.node.as_str())
            .and_then(|node| node.input(&edge.to.port))
            .map(|port| !port.optional)
            .unwrap_or(false);
        if required {
            let targets = adjacency.entry(edge.from.node.as_str()).or_default();
            if !targets.contains(&edge.to.node.as_str()) {
                targets.push(edge.to.node.as_str());
            }
        }
    }

    let mut marks: HashMap<&str, Mark> = order
        .iter()
        .map(|node| (node.id.as_str(), Mark::Unvisited))
        .collect();
    // Current path: each entry is a node and the index of its next successor
    let mut stack: Vec<(&str, usize)> = Vec::new();

    for root in order {
        if marks.get(root.id.as_str()) != Some(&Mark::Unvisited) {
            continue;
        }
        marks.insert(root.id.as_str(), Mark::OnStack);
        stack.push((root.id.as_str(), 0));

        while let Some((current, cursor)) = stack.last_mut() {
            let successors = adjacency.get(*current).map(Vec::as_slice).unwrap_or_default();
            let Some(&next) = successors.get(*cursor) else {
                marks.insert(*current, Mark::Done);
                stack.pop();
                continue;
            };
            *cursor += 1;

            match marks.get(next).copied().unwrap_or(Mark::Done) {
                Mark::OnStack => {
                    let start = stack.iter().position(|&(id, _)| id == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|(id, _)| id.to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks.insert(next, Mark::OnStack);
                    stack.push((next, 0));
                }
                Mark::Done => {}
            }
        }
    }
    None
}
