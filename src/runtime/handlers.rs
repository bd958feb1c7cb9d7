/// Node handler resolution and the stock handlers
///
/// A node's `path` decides which implementation backs it:
/// - a name registered in the [`HandlerRegistry`] (in-process factory)
/// - `builtin:passthrough`, `builtin:constant`, `builtin:collect`, `builtin:fail`
/// - anything else is an executable run as an out-of-process worker
///   ([`ProcessHandler`]) speaking JSON over stdin/stdout

use crate::error::EngineError;
use crate::runtime::executor::{NodeHandler, NodeInputs, NodeOutputs, Output};
use crate::workflow::types::Node;
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Prefix reserved for handlers shipped with the engine
pub const BUILTIN_PREFIX: &str = "builtin:";

/// Builds a handler for one node
pub type HandlerFactory =
    Arc<dyn Fn(&Node) -> anyhow::Result<Arc<dyn NodeHandler>> + Send + Sync>;

/// Name → factory table used to resolve node implementations
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

impl HandlerRegistry {
    /// Empty registry: only out-of-process workers resolve
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `builtin:*` handlers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_handler("builtin:passthrough", Arc::new(PassthroughHandler));
        registry.register_handler("builtin:constant", Arc::new(ConstantHandler));
        registry.register_handler("builtin:collect", Arc::new(CollectHandler));
        registry.register_handler("builtin:fail", Arc::new(FailHandler));
        registry
    }

    /// Register a factory under `name`; replaces any previous registration
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Node) -> anyhow::Result<Arc<dyn NodeHandler>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Register one shared handler instance under `name`
    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn NodeHandler>,
    ) -> &mut Self {
        self.register(name, move |_| Ok(Arc::clone(&handler)))
    }

    /// Resolve the handler backing `node`
    ///
    /// Registered names are matched against the node's `path`, falling back to
    /// its id when no path is set. Unregistered paths become worker processes,
    /// relative ones resolved against `workdir`.
    pub fn resolve(
        &self,
        node: &Node,
        workdir: Option<&Path>,
    ) -> Result<Arc<dyn NodeHandler>, EngineError> {
        let key = node.path.as_deref().unwrap_or(&node.id);

        if let Some(factory) = self.factories.get(key) {
            return factory(node).map_err(|e| EngineError::UnresolvedHandler {
                node: node.id.clone(),
                reason: format!("{e:#}"),
            });
        }

        let Some(path) = node.path.as_deref() else {
            return Err(EngineError::UnresolvedHandler {
                node: node.id.clone(),
                reason: "node has no path and no handler is registered under its id".to_string(),
            });
        };

        if path.starts_with(BUILTIN_PREFIX) {
            return Err(EngineError::UnresolvedHandler {
                node: node.id.clone(),
                reason: format!("unknown builtin handler '{path}'"),
            });
        }

        let program = match workdir {
            Some(dir) if Path::new(path).is_relative() => dir.join(path),
            _ => PathBuf::from(path),
        };
        tracing::debug!("⚙️ Node '{}' runs as worker process {}", node.id, program.display());
        Ok(Arc::new(ProcessHandler::new(program, workdir.map(Path::to_path_buf))))
    }
}

/// Merge inputs into one record: a lone input is passed as-is, several are
/// keyed by port name
fn merged_inputs(inputs: &NodeInputs) -> Option<Value> {
    match inputs.len() {
        0 => None,
        1 => inputs.values().next().map(|message| message.payload().clone()),
        _ => {
            let record: Map<String, Value> = inputs
                .iter()
                .map(|(port, message)| (port.clone(), message.payload().clone()))
                .collect();
            Some(Value::Object(record))
        }
    }
}

fn on_every_output(node: &Node, value: Value) -> NodeOutputs {
    node.outputs
        .iter()
        .fold(NodeOutputs::new(), |outputs, port| outputs.with(port.clone(), value.clone()))
}

/// Forwards its (merged) inputs on every output; skips when nothing arrived
#[derive(Debug, Clone, Copy)]
pub struct PassthroughHandler;

#[async_trait]
impl NodeHandler for PassthroughHandler {
    async fn invoke(&self, node: &Node, inputs: NodeInputs) -> anyhow::Result<NodeOutputs> {
        Ok(match merged_inputs(&inputs) {
            Some(value) => on_every_output(node, value),
            None => NodeOutputs::new(),
        })
    }
}

/// Emits the `VALUE` config entry (or the whole config map) on every output
#[derive(Debug, Clone, Copy)]
pub struct ConstantHandler;

#[async_trait]
impl NodeHandler for ConstantHandler {
    async fn invoke(&self, node: &Node, _inputs: NodeInputs) -> anyhow::Result<NodeOutputs> {
        let value = match node.config.env.get("VALUE") {
            Some(value) => value.clone(),
            None => Value::Object(
                node.config
                    .env
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ),
        };
        Ok(on_every_output(node, value))
    }
}

/// Merges every arrived input into one record keyed by port and lists the
/// optional ports that never arrived
#[derive(Debug, Clone, Copy)]
pub struct CollectHandler;

#[async_trait]
impl NodeHandler for CollectHandler {
    async fn invoke(&self, node: &Node, inputs: NodeInputs) -> anyhow::Result<NodeOutputs> {
        let mut received = Map::new();
        for (port, message) in &inputs {
            received.insert(port.clone(), message.payload().clone());
        }
        let missing: Vec<&str> = node
            .inputs
            .iter()
            .filter(|port| !inputs.contains_key(&port.name))
            .map(|port| port.name.as_str())
            .collect();

        Ok(on_every_output(
            node,
            json!({ "inputs": received, "missing": missing }),
        ))
    }
}

/// Always fails with the `MESSAGE` config entry
#[derive(Debug, Clone, Copy)]
pub struct FailHandler;

#[async_trait]
impl NodeHandler for FailHandler {
    async fn invoke(&self, node: &Node, _inputs: NodeInputs) -> anyhow::Result<NodeOutputs> {
        let message = node
            .config
            .get_str("MESSAGE")
            .unwrap_or_else(|| format!("node '{}' is configured to fail", node.id));
        bail!(message)
    }
}

/// Out-of-process worker: one child process per invocation
///
/// Protocol: stdin receives a JSON object keyed by input port name; stdout
/// must hold a JSON object keyed by output port name (`null` = skipped). A
/// single-output node may print its payload object directly. The node's env
/// map is exported to the child as environment variables.
#[derive(Debug, Clone)]
pub struct ProcessHandler {
    program: PathBuf,
    workdir: Option<PathBuf>,
}

impl ProcessHandler {
    pub fn new(program: impl Into<PathBuf>, workdir: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            workdir,
        }
    }
}

#[async_trait]
impl NodeHandler for ProcessHandler {
    async fn invoke(&self, node: &Node, inputs: NodeInputs) -> anyhow::Result<NodeOutputs> {
        let request: Map<String, Value> = inputs
            .iter()
            .map(|(port, message)| (port.clone(), message.payload().clone()))
            .collect();
        let request = serde_json::to_vec(&Value::Object(request))?;

        let mut command = Command::new(&self.program);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("FRAMEWIRE_NODE_ID", &node.id);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        for key in node.config.env.keys() {
            if let Some(value) = node.config.get_str(key) {
                command.env(key, value);
            }
        }

        tracing::debug!("🚀 Spawning worker {} for node '{}'", self.program.display(), node.id);
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn worker {}", self.program.display()))?;

        let mut stdin = child.stdin.take().context("worker stdin unavailable")?;
        let write = async move {
            stdin.write_all(&request).await?;
            stdin.shutdown().await
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output.context("failed to wait for worker")?;

        if !output.status.success() {
            bail!(
                "worker exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            );
        }
        // A worker may exit successfully without reading its stdin
        if let Err(e) = written {
            tracing::debug!("Worker for '{}' closed stdin early: {}", node.id, e);
        }

        parse_worker_output(node, &output.stdout)
    }
}

/// Last few lines of a worker's stderr, for error messages
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(5);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        "<no stderr>".to_string()
    } else {
        tail
    }
}

/// Interpret a worker's stdout
pub fn parse_worker_output(node: &Node, stdout: &[u8]) -> anyhow::Result<NodeOutputs> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Ok(NodeOutputs::new());
    }

    let value: Value = serde_json::from_str(text).context("worker stdout is not valid JSON")?;
    let Value::Object(mut record) = value else {
        bail!("worker stdout must be a JSON object keyed by output port");
    };

    let mut outputs = NodeOutputs::new();

    if let [only] = node.outputs.as_slice() {
        if !record.contains_key(only) {
            outputs.insert(only.clone(), Output::Produced(Value::Object(record)));
            return Ok(outputs);
        }
    }

    for port in &node.outputs {
        match record.remove(port) {
            Some(Value::Null) | None => outputs.insert(port.clone(), Output::Skipped),
            Some(value) => outputs.insert(port.clone(), Output::Produced(value)),
        }
    }
    // Keys outside the declared outputs are passed through so the scheduler
    // rejects them as a routing violation
    for (port, value) in record {
        outputs.insert(port, Output::Produced(value));
    }

    Ok(outputs)
}
