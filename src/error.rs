/// Engine error taxonomy
///
/// - [`ValidationError`](crate::workflow::ValidationError): malformed graph,
///   surfaced at load time, the pipeline never starts
/// - [`InvocationError`]: one node's invocation failed, isolated to the node
///   and its required dependents
/// - [`RoutingError`]: delivery to or from an undeclared port, fatal to the Run
/// - [`EngineError`]: anything that stops a Run from starting or finishing

use crate::workflow::{LoadError, ValidationError};
use thiserror::Error;

/// A message was published on, or delivered to, a port the graph never declared
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("node '{node}' published on undeclared output port '{port}'")]
    UndeclaredOutput { node: String, port: String },

    #[error("delivery to undeclared input port '{port}' of node '{node}'")]
    UndeclaredInput { node: String, port: String },
}

/// A node implementation failed to start or invoke
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("node '{node}' failed: {message}")]
pub struct InvocationError {
    pub node: String,
    pub message: String,
}

impl InvocationError {
    /// Capture an `anyhow` error chain as a single message
    pub fn from_anyhow(node: &str, error: &anyhow::Error) -> Self {
        Self {
            node: node.to_string(),
            message: format!("{error:#}"),
        }
    }
}

/// Errors that prevent a Run from starting or completing
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("routing invariant violated: {0}")]
    Routing(#[from] RoutingError),

    #[error("no handler could be resolved for node '{node}': {reason}")]
    UnresolvedHandler { node: String, reason: String },

    #[error("bootstrap of node '{node}' failed: {message}")]
    Bootstrap { node: String, message: String },

    #[error("node task for '{node}' panicked or was aborted: {message}")]
    Task { node: String, message: String },
}
