/// Node runtime: the lifecycle wrapper around one node implementation
///
/// A [`NodeHandler`] is the uniform contract every node implementation
/// exposes (in-process or out-of-process). [`NodeRuntime`] wraps exactly one
/// handler and adds what the engine needs on top:
/// - idempotent `start` before the first invocation
/// - single-flight `invoke`
/// - translation of handler failures into [`InvocationError`]
/// - the structured invocation record emitted around every `invoke`

use crate::error::InvocationError;
use crate::runtime::router::Message;
use crate::workflow::types::Node;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

/// Inputs handed to one invocation, keyed by input port name
///
/// Optional ports whose message never arrived are simply absent.
pub type NodeInputs = HashMap<String, Message>;

/// What an invocation did on one output port
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// A value was produced and will be routed downstream
    Produced(Value),
    /// The node ran but emitted nothing on this port
    Skipped,
}

/// Outputs of one invocation, keyed by output port name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutputs {
    ports: BTreeMap<String, Output>,
}

impl NodeOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce `value` on `port`
    pub fn with(mut self, port: impl Into<String>, value: Value) -> Self {
        self.ports.insert(port.into(), Output::Produced(value));
        self
    }

    /// Explicitly skip `port`
    pub fn skip(mut self, port: impl Into<String>) -> Self {
        self.ports.insert(port.into(), Output::Skipped);
        self
    }

    pub fn insert(&mut self, port: impl Into<String>, output: Output) {
        self.ports.insert(port.into(), output);
    }

    pub fn get(&self, port: &str) -> Option<&Output> {
        self.ports.get(port)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Output)> {
        self.ports.iter()
    }

    /// Produced values only
    pub fn produced(&self) -> BTreeMap<String, Value> {
        self.ports
            .iter()
            .filter_map(|(port, output)| match output {
                Output::Produced(value) => Some((port.clone(), value.clone())),
                Output::Skipped => None,
            })
            .collect()
    }

    /// Mark every declared port the handler did not mention as skipped
    fn fill_skipped(&mut self, declared: &[String]) {
        for port in declared {
            self.ports.entry(port.clone()).or_insert(Output::Skipped);
        }
    }
}

impl IntoIterator for NodeOutputs {
    type Item = (String, Output);
    type IntoIter = std::collections::btree_map::IntoIter<String, Output>;

    fn into_iter(self) -> Self::IntoIter {
        self.ports.into_iter()
    }
}

/// Contract implemented by every node implementation
///
/// `start` and `stop` default to no-ops for implementations that are stateless
/// per invocation. `invoke` receives only the inputs that arrived; handling
/// absent optional inputs is the implementation's job.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn start(&self, _node: &Node) -> anyhow::Result<()> {
        Ok(())
    }

    async fn invoke(&self, node: &Node, inputs: NodeInputs) -> anyhow::Result<NodeOutputs>;

    async fn stop(&self, _node: &Node) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Structured record of one invocation phase
#[derive(Debug, Clone, Serialize)]
pub struct NodeLogRecord {
    pub run_id: Uuid,
    pub node: String,
    pub invocation: u64,
    pub phase: &'static str,
    pub timestamp: String,
    pub inputs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub produced: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lifecycle wrapper around one node handler
pub struct NodeRuntime {
    node: Arc<Node>,
    handler: Arc<dyn NodeHandler>,
    started: OnceCell<()>,
    in_flight: Mutex<()>,
    invocations: AtomicU64,
    log_dir: Option<PathBuf>,
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("node", &self.node.id)
            .field("started", &self.is_started())
            .field("invocations", &self.invocation_count())
            .finish()
    }
}

impl NodeRuntime {
    /// Wrap `handler` as the runtime for `node`
    ///
    /// The handler is not started here; the first [`NodeRuntime::start`] or
    /// [`NodeRuntime::invoke`] does that.
    pub fn new(node: Arc<Node>, handler: Arc<dyn NodeHandler>) -> Self {
        Self {
            node,
            handler,
            started: OnceCell::new(),
            in_flight: Mutex::new(()),
            invocations: AtomicU64::new(0),
            log_dir: None,
        }
    }

    /// Write JSON-lines invocation records under `dir` (only for `WRITE_LOG` nodes)
    pub fn with_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.log_dir = dir;
        self
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn is_started(&self) -> bool {
        self.started.initialized()
    }

    /// Invocations attempted so far, failed ones included
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Bootstrap the underlying implementation; later calls are no-ops
    pub async fn start(&self) -> Result<(), InvocationError> {
        self.started
            .get_or_try_init(|| async {
                tracing::debug!("🔌 Starting node runtime '{}'", self.node.id);
                self.handler.start(&self.node).await
            })
            .await
            .map(|_| ())
            .map_err(|e| InvocationError::from_anyhow(&self.node.id, &e))
    }

    /// Invoke the node once
    ///
    /// Rejects a second call while one is outstanding. Declared outputs the
    /// handler left out come back as [`Output::Skipped`].
    pub async fn invoke(
        &self,
        run_id: Uuid,
        inputs: NodeInputs,
    ) -> Result<NodeOutputs, InvocationError> {
        let _guard = self.in_flight.try_lock().map_err(|_| InvocationError {
            node: self.node.id.clone(),
            message: "invoke called while a previous invocation is still in flight".to_string(),
        })?;

        self.start().await?;

        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        let mut input_ports: Vec<String> = inputs.keys().cloned().collect();
        input_ports.sort();

        let mut record = NodeLogRecord {
            run_id,
            node: self.node.id.clone(),
            invocation,
            phase: "start",
            timestamp: chrono::Utc::now().to_rfc3339(),
            inputs: input_ports,
            duration_ms: None,
            produced: None,
            skipped: None,
            error: None,
        };
        self.emit(&record).await;

        let start_time = std::time::Instant::now();
        let result = self.handler.invoke(&self.node, inputs).await;

        record.phase = "finish";
        record.timestamp = chrono::Utc::now().to_rfc3339();
        record.duration_ms = Some(start_time.elapsed().as_millis());

        match result {
            Ok(mut outputs) => {
                outputs.fill_skipped(&self.node.outputs);
                let (produced, skipped): (Vec<_>, Vec<_>) = outputs
                    .iter()
                    .partition(|(_, output)| matches!(output, Output::Produced(_)));
                record.produced = Some(produced.into_iter().map(|(p, _)| p.clone()).collect());
                record.skipped = Some(skipped.into_iter().map(|(p, _)| p.clone()).collect());
                self.emit(&record).await;
                Ok(outputs)
            }
            Err(e) => {
                let error = InvocationError::from_anyhow(&self.node.id, &e);
                record.error = Some(error.message.clone());
                self.emit(&record).await;
                Err(error)
            }
        }
    }

    /// Release resources held by a started implementation
    pub async fn stop(&self) -> Result<(), InvocationError> {
        if !self.is_started() {
            return Ok(());
        }
        tracing::debug!("⏹️ Stopping node runtime '{}'", self.node.id);
        self.handler
            .stop(&self.node)
            .await
            .map_err(|e| InvocationError::from_anyhow(&self.node.id, &e))
    }

    /// Emit the structured record: a tracing event always, a file line on request
    async fn emit(&self, record: &NodeLogRecord) {
        let outcome = match (&record.error, record.phase) {
            (Some(_), _) => "failed",
            (None, "finish") => "completed",
            _ => "invoking",
        };

        if self.node.config.write_log {
            tracing::info!(
                run_id = %record.run_id,
                node = %record.node,
                invocation = record.invocation,
                phase = record.phase,
                duration_ms = record.duration_ms.unwrap_or_default() as u64,
                outcome,
                error = record.error.as_deref().unwrap_or(""),
                "📝 node invocation"
            );
        } else {
            tracing::debug!(
                run_id = %record.run_id,
                node = %record.node,
                invocation = record.invocation,
                phase = record.phase,
                duration_ms = record.duration_ms.unwrap_or_default() as u64,
                outcome,
                "node invocation"
            );
        }

        if !self.node.config.write_log {
            return;
        }
        let Some(dir) = &self.log_dir else {
            return;
        };
        if let Err(e) = append_record(dir, record).await {
            tracing::warn!("⚠️ Failed to write invocation log for '{}': {}", record.node, e);
        }
    }
}

async fn append_record(dir: &std::path::Path, record: &NodeLogRecord) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{}.jsonl", record.node)))
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}
