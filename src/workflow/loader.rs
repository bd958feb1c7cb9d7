/// Declarative dataflow descriptor loader
///
/// Parses the JSON pipeline definition (a list of node records) into a
/// [`GraphDefinition`] and validates it into a [`Graph`]. The loader never runs
/// a node's build step; it only records the reference for the bootstrap stage.

use crate::workflow::types::{
    Edge, Graph, GraphDefinition, InputPort, Node, NodeConfig, PortRef,
};
use crate::workflow::validate::ValidationError;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while turning a descriptor into a graph
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read dataflow descriptor {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse dataflow descriptor: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Top-level pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataflowDescriptor {
    /// Node records in declaration order
    pub nodes: Vec<NodeDescriptor>,
}

/// One node record of the pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique node identifier
    pub id: String,
    /// Opaque build/bootstrap command, run once before the first invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    /// Location of the node implementation (handler name or executable path)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Input port name → binding, in document order
    ///
    /// Repeated keys are kept so validation can report them as duplicate ports.
    #[serde(
        default,
        deserialize_with = "bindings_in_order",
        serialize_with = "serialize_bindings"
    )]
    pub inputs: Vec<(String, InputBinding)>,
    /// Output port names, in order
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Environment/configuration map
    #[serde(default)]
    pub env: BTreeMap<String, Value>,
}

/// Input binding: `"node/port"` shorthand or a detailed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputBinding {
    Source(String),
    Detailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default)]
        optional: bool,
    },
}

impl InputBinding {
    fn source(&self) -> Option<&str> {
        match self {
            InputBinding::Source(source) => Some(source),
            InputBinding::Detailed { source, .. } => source.as_deref(),
        }
    }

    fn is_optional(&self) -> bool {
        matches!(self, InputBinding::Detailed { optional: true, .. })
    }
}

fn bindings_in_order<'de, D>(deserializer: D) -> Result<Vec<(String, InputBinding)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct BindingsVisitor;

    impl<'de> Visitor<'de> for BindingsVisitor {
        type Value = Vec<(String, InputBinding)>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map of input port names to bindings")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut bindings = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<String, InputBinding>()? {
                bindings.push(entry);
            }
            Ok(bindings)
        }
    }

    deserializer.deserialize_map(BindingsVisitor)
}

fn serialize_bindings<S>(bindings: &[(String, InputBinding)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_map(bindings.iter().map(|(port, binding)| (port, binding)))
}

impl DataflowDescriptor {
    /// Parse a descriptor from JSON text
    pub fn from_json(json: &str) -> Result<Self, LoadError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Convert node records into nodes and edges
    ///
    /// Each input binding becomes one edge. Fails on the first binding string
    /// that is not of the form `"<node>/<port>"`.
    pub fn into_definition(self) -> Result<GraphDefinition, ValidationError> {
        let mut definition = GraphDefinition::new();

        for record in self.nodes {
            let mut inputs = Vec::with_capacity(record.inputs.len());

            for (port, binding) in &record.inputs {
                inputs.push(InputPort {
                    name: port.clone(),
                    optional: binding.is_optional(),
                });

                if let Some(source) = binding.source() {
                    let from = PortRef::parse(source).ok_or_else(|| {
                        ValidationError::MalformedBinding {
                            node: record.id.clone(),
                            port: port.clone(),
                            binding: source.to_string(),
                        }
                    })?;
                    definition
                        .edges
                        .push(Edge::new(from, PortRef::new(record.id.clone(), port.clone())));
                }
            }

            definition.nodes.push(Node {
                id: record.id,
                build: record.build,
                path: record.path,
                inputs,
                outputs: record.outputs,
                config: NodeConfig::from_env(record.env),
            });
        }

        Ok(definition)
    }
}

/// Parse and validate a descriptor held in memory
pub fn load_str(json: &str) -> Result<Graph, LoadError> {
    let descriptor = DataflowDescriptor::from_json(json)?;
    let definition = descriptor.into_definition()?;
    let graph = definition.build()?;

    tracing::debug!(
        "📊 Loaded dataflow graph with {} nodes and {} edges",
        graph.nodes().len(),
        graph.edges().len()
    );
    Ok(graph)
}

/// Read, parse, and validate a descriptor file
pub fn load_file(path: impl AsRef<Path>) -> Result<Graph, LoadError> {
    let path = path.as_ref();
    tracing::info!("📥 Loading dataflow descriptor from {}", path.display());

    let json = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_str(&json)
}
