/// Dataflow Graph Layer
///
/// This module handles pipeline definitions and their validation:
/// - Type definitions (Graph, Node, Edge, PortRef)
/// - JSON descriptor loading
/// - Structural validation (ids, references, bindings, cycles)

// Core graph model type definitions
pub mod types;

// Declarative descriptor parsing
pub mod loader;

// Structural validation run before a graph is frozen
pub mod validate;

// Re-export commonly used types
pub use loader::{load_file, load_str, DataflowDescriptor, LoadError};
pub use types::{Edge, Graph, GraphDefinition, InputPort, Node, NodeConfig, PortRef};
pub use validate::{validate, validate_all, PortKind, ValidationError};
