/// framewire: declarative dataflow graph execution engine
///
/// Loads a pipeline of named nodes wired through typed ports, validates the
/// topology, and runs every node as soon as its required inputs are ready,
/// with fan-out, fan-in, and optional inputs handled by the scheduler.

// Engine configuration from environment variables
pub mod config;

// Error taxonomy shared across layers
pub mod error;

// Graph model, descriptor loading, and validation
pub mod workflow;

// Routing, node runtimes, and scheduling
pub mod runtime;

// Re-export commonly used types for external consumers
pub use config::{EngineConfig, OptionalInputPolicy};
pub use error::{EngineError, InvocationError, RoutingError};
pub use runtime::{
    ExecutionEngine, ExecutionState, HandlerRegistry, NodeHandler, NodeInputs, NodeOutputs,
    Output, RunEvent, RunReport,
};
pub use workflow::{load_file, load_str, Graph, GraphDefinition, Node, ValidationError};
