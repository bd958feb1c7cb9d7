//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use framewire::runtime::{ExecutionEngine, HandlerRegistry, NodeHandler, NodeInputs, NodeOutputs};
use framewire::{EngineConfig, Graph, Node};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

/// What a scripted node does when invoked
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Emit `{ "from": <node>, "inputs": [<port>...] }` on every output
    Echo,
    /// Fail with the given message
    Fail(String),
    /// Sleep, then echo
    Delay(Duration),
    /// Complete without producing anything
    Silent,
    /// Produce on a port the node never declared
    Rogue,
    Panic,
    /// Wait until every party sharing the barrier has arrived, then echo
    Rendezvous(Arc<Barrier>),
}

/// Records every invocation made through it
#[derive(Debug, Default)]
pub struct Recorder {
    pub calls: Mutex<Vec<(String, Vec<String>)>>,
    pub running: AtomicUsize,
    pub peak: AtomicUsize,
}

impl Recorder {
    /// Invocation count for one node
    pub fn calls_for(&self, node: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == node)
            .count()
    }

    /// Input ports seen by the first invocation of `node`
    pub fn inputs_of(&self, node: &str) -> Option<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == node)
            .map(|(_, ports)| ports.clone())
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct ScriptedHandler {
    behavior: Behavior,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl NodeHandler for ScriptedHandler {
    async fn invoke(&self, node: &Node, inputs: NodeInputs) -> anyhow::Result<NodeOutputs> {
        let mut ports: Vec<String> = inputs.keys().cloned().collect();
        ports.sort();
        self.recorder
            .calls
            .lock()
            .unwrap()
            .push((node.id.clone(), ports));

        let now = self.recorder.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.peak.fetch_max(now, Ordering::SeqCst);

        let result = match &self.behavior {
            Behavior::Fail(message) => Err(anyhow::anyhow!(message.clone())),
            Behavior::Silent => Ok(NodeOutputs::new()),
            Behavior::Rogue => Ok(NodeOutputs::new().with("not-declared", json!(1))),
            Behavior::Panic => panic!("node {} exploded", node.id),
            Behavior::Delay(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(echo(node, &inputs))
            }
            Behavior::Rendezvous(barrier) => {
                barrier.wait().await;
                Ok(echo(node, &inputs))
            }
            Behavior::Echo => Ok(echo(node, &inputs)),
        };

        self.recorder.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// Payload size stays constant however deep the graph is
fn echo(node: &Node, inputs: &NodeInputs) -> NodeOutputs {
    let mut received: Vec<&str> = inputs.keys().map(String::as_str).collect();
    received.sort_unstable();
    let value = json!({ "from": node.id, "inputs": received });
    node.outputs
        .iter()
        .fold(NodeOutputs::new(), |outputs, port| outputs.with(port.clone(), value.clone()))
}

/// Registry where every node id is backed by a scripted handler
///
/// Nodes not listed in `behaviors` echo.
pub fn scripted_registry(
    graph: &Graph,
    behaviors: HashMap<&str, Behavior>,
    recorder: &Arc<Recorder>,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::with_builtins();
    for node in graph.nodes() {
        let behavior = behaviors
            .get(node.id.as_str())
            .cloned()
            .unwrap_or(Behavior::Echo);
        let handler = Arc::new(ScriptedHandler {
            behavior,
            recorder: Arc::clone(recorder),
        });
        registry.register_handler(node.id.clone(), handler);
    }
    registry
}

pub fn engine(registry: HandlerRegistry, config: EngineConfig) -> ExecutionEngine {
    ExecutionEngine::new(config.with_skip_build(true), registry)
}

/// The reference fan-out/fan-in graph:
/// `A` feeds `B` and `C`; `D` requires `B` and optionally takes `C`.
pub fn diamond() -> Graph {
    framewire::GraphDefinition::new()
        .node(Node::new("A").with_output("o"))
        .node(Node::new("B").with_input("i").with_output("o"))
        .node(Node::new("C").with_input("i").with_output("o"))
        .node(
            Node::new("D")
                .with_input("b")
                .with_optional_input("c")
                .with_output("summary")
                .with_env("IS_DATAFLOW_END", true),
        )
        .edge("A/o", "B/i")
        .edge("A/o", "C/i")
        .edge("B/o", "D/b")
        .edge("C/o", "D/c")
        .build()
        .expect("diamond graph is valid")
}
