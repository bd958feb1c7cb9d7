/// Runtime Execution Engine
///
/// This module runs validated dataflow graphs. It handles:
/// - Routing messages from output ports to subscribed input ports
/// - Wrapping node implementations in lifecycle-managed runtimes
/// - Preparing nodes through the bootstrap stage
/// - Data-readiness scheduling of concurrent node tasks
/// - Reporting every node's terminal state

// Message envelopes and the per-Run routing table
pub mod router;

// Node handler contract and the lifecycle wrapper around it
pub mod executor;

// Handler resolution, builtin handlers, and out-of-process workers
pub mod handlers;

// Build step run once per node before the scheduler starts
pub mod bootstrap;

// Data-readiness scheduler and per-Run state
pub mod scheduler;

// Run completion report
pub mod report;

// Engine facade wiring handlers, bootstrap, and scheduler together
pub mod engine;

// Re-export main types
pub use engine::ExecutionEngine;
pub use executor::{NodeHandler, NodeInputs, NodeOutputs, NodeRuntime, Output};
pub use handlers::HandlerRegistry;
pub use report::{NodeReport, RunReport};
pub use router::{Message, MessageRouter};
pub use scheduler::{ExecutionState, FailureReason, Run, RunEvent, Scheduler};
