/// Core dataflow graph type definitions
///
/// Defines the in-memory Graph Model: nodes with named input/output ports,
/// edges binding an output port to an input port, and the immutable validated
/// [`Graph`] the runtime executes. A petgraph mirror of the topology is kept
/// alongside for reachability queries.

use crate::workflow::validate::{self, ValidationError};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Env key requesting a structured log record around each invocation
pub const WRITE_LOG_KEY: &str = "WRITE_LOG";

/// Env key marking a node as a terminal point of the pipeline
pub const TERMINAL_KEY: &str = "IS_DATAFLOW_END";

/// Env key marking a node as pipeline-critical (failure cancels exclusive dependents)
pub const CRITICAL_KEY: &str = "CRITICAL";

/// Address of a single port: `(node id, port name)`
///
/// Rendered as `node/port`, the same form used by input bindings in the
/// declarative descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    /// Owning node id
    pub node: String,
    /// Port name, unique within the node's inputs or outputs
    pub port: String,
}

impl PortRef {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }

    /// Parse a `"<node>/<port>"` binding string
    ///
    /// Returns `None` unless the string holds exactly one `/` with a non-empty
    /// node id on the left and a non-empty port name on the right.
    pub fn parse(binding: &str) -> Option<Self> {
        let (node, port) = binding.trim().split_once('/')?;
        if node.is_empty() || port.is_empty() || port.contains('/') {
            return None;
        }
        Some(Self::new(node, port))
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.port)
    }
}

/// A declared input port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPort {
    /// Port name
    pub name: String,
    /// Whether the node may run without this input having arrived
    pub optional: bool,
}

impl InputPort {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: true,
        }
    }
}

/// Immutable per-node configuration record
///
/// The engine-recognized flags are resolved once when the node is constructed
/// and never change during a Run. Every env entry (flags included) stays in
/// `env` so it can be handed to the node implementation untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Raw key/value settings passed through to the node implementation
    pub env: BTreeMap<String, Value>,
    /// Emit a structured log record around each invocation
    pub write_log: bool,
    /// Node ends the pipeline's logical flow
    pub terminal: bool,
    /// Failure cancels not-yet-started nodes depending exclusively on it
    pub critical: bool,
}

impl NodeConfig {
    /// Build a config record from a raw env map, resolving engine flags
    pub fn from_env(env: BTreeMap<String, Value>) -> Self {
        let flag = |key: &str| env.get(key).map(is_truthy).unwrap_or(false);
        Self {
            write_log: flag(WRITE_LOG_KEY),
            terminal: flag(TERMINAL_KEY),
            critical: flag(CRITICAL_KEY),
            env,
        }
    }

    /// Look up an env value rendered as a string (scalars only)
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.env.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        }
    }
}

/// Interpret a JSON scalar as a boolean flag
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|n| n != 0).unwrap_or(false),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
        _ => false,
    }
}

/// A single processing node in the dataflow graph
///
/// The `build` and `path` references are opaque to the graph model: the
/// bootstrap stage consumes `build`, handler resolution consumes `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the graph (e.g., "image-generator")
    pub id: String,
    /// Build/bootstrap reference run once before the first invocation
    pub build: Option<String>,
    /// Location of the node's implementation
    pub path: Option<String>,
    /// Declared input ports
    pub inputs: Vec<InputPort>,
    /// Declared output port names, in declaration order
    pub outputs: Vec<String>,
    /// Immutable configuration record
    pub config: NodeConfig,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            build: None,
            path: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            config: NodeConfig::default(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputPort::required(name));
        self
    }

    pub fn with_optional_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputPort::optional(name));
        self
    }

    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Set one env entry, re-resolving engine flags
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut env = std::mem::take(&mut self.config.env);
        env.insert(key.into(), value.into());
        self.config = NodeConfig::from_env(env);
        self
    }

    pub fn input(&self, name: &str) -> Option<&InputPort> {
        self.inputs.iter().find(|port| port.name == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|port| port == name)
    }

    pub fn required_inputs(&self) -> impl Iterator<Item = &InputPort> {
        self.inputs.iter().filter(|port| !port.optional)
    }
}

/// Directed binding from a producer's output port to a consumer's input port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Producer `(node, output port)`
    pub from: PortRef,
    /// Consumer `(node, input port)`
    pub to: PortRef,
}

impl Edge {
    pub fn new(from: PortRef, to: PortRef) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Unvalidated set of nodes and edges
///
/// Produced by the descriptor loader or assembled by hand, then turned into a
/// [`Graph`] through validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDefinition {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Bind `from` (`"node/port"`) to `to` (`"node/port"`)
    ///
    /// Malformed references are kept verbatim as a port named after the whole
    /// string so validation reports them as dangling.
    pub fn edge(mut self, from: &str, to: &str) -> Self {
        let parse = |s: &str| PortRef::parse(s).unwrap_or_else(|| PortRef::new(s, s));
        self.edges.push(Edge::new(parse(from), parse(to)));
        self
    }

    /// Validate into an immutable [`Graph`], failing on the first problem found
    pub fn build(self) -> Result<Graph, ValidationError> {
        Graph::from_definition(self)
    }
}

/// A validated, immutable dataflow graph
///
/// Holds the node and edge lists in declaration order plus a petgraph mirror
/// of the node-level topology (edge weight: whether the binding is required).
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    node_id_to_index: HashMap<String, NodeIndex>,
    topology: DiGraph<String, bool>,
}

impl Graph {
    /// Validate a definition and freeze it
    pub fn from_definition(definition: GraphDefinition) -> Result<Self, ValidationError> {
        validate::validate(&definition)?;

        let mut topology = DiGraph::new();
        let mut node_id_to_index = HashMap::new();
        for node in &definition.nodes {
            let index = topology.add_node(node.id.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }

        let nodes_by_id: HashMap<&str, &Node> = definition
            .nodes
            .iter()
            .map(|node| (node.id.as_str(), node))
            .collect();
        for edge in &definition.edges {
            let required = nodes_by_id
                .get(edge.to.node.as_str())
                .and_then(|node| node.input(&edge.to.port))
                .map(|port| !port.optional)
                .unwrap_or(false);
            // Validation guarantees both endpoints exist
            if let (Some(&from), Some(&to)) = (
                node_id_to_index.get(&edge.from.node),
                node_id_to_index.get(&edge.to.node),
            ) {
                topology.add_edge(from, to, required);
            }
        }

        Ok(Self {
            nodes: definition.nodes,
            edges: definition.edges,
            node_id_to_index,
            topology,
        })
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Look up a node by id through the petgraph index map
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_id_to_index
            .get(id)
            .map(|index| &self.nodes[index.index()])
    }

    /// Edges leaving any output port of `node_id`
    pub fn edges_from<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.from.node == node_id)
    }

    /// Edges arriving at any input port of `node_id`
    pub fn edges_into<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.to.node == node_id)
    }

    /// Whether the edge's destination input is required by its consumer
    pub fn is_required(&self, edge: &Edge) -> bool {
        self.node(&edge.to.node)
            .and_then(|node| node.input(&edge.to.port))
            .map(|port| !port.optional)
            .unwrap_or(false)
    }

    /// Nodes with no required inputs: they are ready as soon as a Run starts
    pub fn entry_points(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|node| node.required_inputs().next().is_none())
            .collect()
    }

    /// Nodes flagged as terminal sinks
    pub fn terminal_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|node| node.config.terminal).collect()
    }

    /// Find all nodes reachable from `start` (inclusive) using BFS
    pub fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut reachable = HashSet::new();
        let Some(&start_index) = self.node_id_to_index.get(start) else {
            return reachable;
        };

        let mut bfs = Bfs::new(&self.topology, start_index);
        while let Some(index) = bfs.next(&self.topology) {
            reachable.insert(self.topology[index].clone());
        }
        reachable
    }
}
