/// Data-readiness scheduler
///
/// Drives one Run of a validated graph to completion. Nodes become `Ready`
/// when their required inputs are satisfied and run as independent tokio
/// tasks; completions flow back to the scheduler task, which is the only place
/// state transitions happen. Two branches finishing at the same instant are
/// therefore applied one after the other, never interleaved.

use crate::config::{EngineConfig, OptionalInputPolicy};
use crate::error::{EngineError, InvocationError, RoutingError};
use crate::runtime::executor::{NodeOutputs, NodeRuntime, Output};
use crate::runtime::report::{NodeReport, RunReport};
use crate::runtime::router::MessageRouter;
use crate::workflow::types::{Graph, PortRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Per-node state within one Run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Idle,
    Ready,
    Running,
    Completed,
    Failed,
}

impl ExecutionState {
    /// `Completed` or `Failed`
    pub fn is_settled(self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Failed)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a node ended up `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The node's own invocation failed
    Invocation { message: String },
    /// A node feeding a required input failed
    UpstreamFailed { upstream: String },
    /// The producer of a required input completed without emitting on it
    InputNotProduced { port: String, upstream: PortRef },
    /// Not started because a pipeline-critical node it depends on failed
    Cancelled { critical: String },
    /// Inputs could never become available
    Unreachable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Invocation { message } => f.write_str(message),
            FailureReason::UpstreamFailed { upstream } => {
                write!(f, "required upstream '{upstream}' failed")
            }
            FailureReason::InputNotProduced { port, upstream } => {
                write!(f, "required input '{port}' was not produced by {upstream}")
            }
            FailureReason::Cancelled { critical } => {
                write!(f, "cancelled after critical node '{critical}' failed")
            }
            FailureReason::Unreachable => f.write_str("inputs never became available"),
        }
    }
}

/// Progress notifications streamed while a Run executes
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    NodeStarted {
        node: String,
    },
    NodeCompleted {
        node: String,
        outputs: BTreeMap<String, Value>,
        terminal: bool,
    },
    NodeFailed {
        node: String,
        reason: FailureReason,
    },
    /// A node flagged as terminal sink settled
    TerminalSettled {
        node: String,
        state: ExecutionState,
    },
    /// Every terminal sink has settled (or, without any, every node has)
    PipelineEnded,
}

#[derive(Debug)]
struct NodeRun {
    state: ExecutionState,
    /// Required input ports still waiting for a message
    required_pending: BTreeSet<String>,
    /// Bound optional input ports whose producer has not delivered or settled
    optional_pending: BTreeSet<String>,
    reason: Option<FailureReason>,
    outputs: BTreeMap<String, Value>,
}

/// Mutable state of one live execution of a graph
///
/// Created per invocation of [`Scheduler::run`] and discarded afterwards.
#[derive(Debug)]
pub struct Run<'g> {
    id: Uuid,
    graph: &'g Graph,
    policy: OptionalInputPolicy,
    nodes: HashMap<String, NodeRun>,
    router: MessageRouter,
    queue: VecDeque<String>,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
    pipeline_ended: bool,
}

impl<'g> Run<'g> {
    /// Initialise every node as `Ready` (no pending required inputs) or `Idle`
    pub fn new(graph: &'g Graph, policy: OptionalInputPolicy) -> Self {
        let mut nodes = HashMap::new();
        for node in graph.nodes() {
            let mut required_pending = BTreeSet::new();
            let mut optional_pending = BTreeSet::new();
            for edge in graph.edges_into(&node.id) {
                match node.input(&edge.to.port) {
                    Some(port) if port.optional => {
                        optional_pending.insert(port.name.clone());
                    }
                    Some(port) => {
                        required_pending.insert(port.name.clone());
                    }
                    None => {}
                }
            }
            nodes.insert(
                node.id.clone(),
                NodeRun {
                    state: ExecutionState::Idle,
                    required_pending,
                    optional_pending,
                    reason: None,
                    outputs: BTreeMap::new(),
                },
            );
        }

        let mut run = Self {
            id: Uuid::new_v4(),
            graph,
            policy,
            nodes,
            router: MessageRouter::from_graph(graph),
            queue: VecDeque::new(),
            events: None,
            pipeline_ended: false,
        };
        for node in graph.nodes() {
            run.refresh(&node.id);
        }
        run
    }

    /// Unique id of this Run, stamped on reports and log records
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn with_events(mut self, events: Option<mpsc::UnboundedSender<RunEvent>>) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self, node: &str) -> Option<ExecutionState> {
        self.nodes.get(node).map(|run| run.state)
    }

    /// Why `node` failed, if it did
    pub fn failure(&self, node: &str) -> Option<&FailureReason> {
        self.nodes.get(node).and_then(|run| run.reason.as_ref())
    }

    /// Nodes currently `Running`
    pub fn running(&self) -> usize {
        self.nodes
            .values()
            .filter(|run| run.state == ExecutionState::Running)
            .count()
    }

    /// Whether every node has reached `Completed` or `Failed`
    pub fn is_settled(&self) -> bool {
        self.nodes.values().all(|run| run.state.is_settled())
    }

    /// A terminal sink has arrived once it settled; any other node once every
    /// node reachable from it (itself included) has settled
    pub fn arrived_at_termination(&self, node: &str) -> bool {
        let Some(definition) = self.graph.node(node) else {
            return false;
        };
        let settled = |id: &str| self.state(id).is_some_and(ExecutionState::is_settled);
        if definition.config.terminal {
            return settled(node);
        }
        self.graph
            .reachable_from(node)
            .iter()
            .all(|id| settled(id.as_str()))
    }

    /// Pop the next node still `Ready`, marking it `Running`
    fn next_ready(&mut self) -> Option<String> {
        while let Some(id) = self.queue.pop_front() {
            let Some(run) = self.nodes.get_mut(&id) else {
                continue;
            };
            if run.state == ExecutionState::Ready {
                run.state = ExecutionState::Running;
                self.emit(RunEvent::NodeStarted { node: id.clone() });
                return Some(id);
            }
        }
        None
    }

    /// Move an `Idle` node to `Ready` once its inputs allow it
    fn refresh(&mut self, id: &str) {
        let policy = self.policy;
        let Some(run) = self.nodes.get_mut(id) else {
            return;
        };
        if run.state != ExecutionState::Idle || !run.required_pending.is_empty() {
            return;
        }
        if policy == OptionalInputPolicy::Settle && !run.optional_pending.is_empty() {
            return;
        }
        run.state = ExecutionState::Ready;
        self.queue.push_back(id.to_string());
        tracing::debug!("🟢 Node '{}' is ready", id);
    }

    /// Apply a successful invocation: publish produced outputs, account for
    /// skipped ones
    fn complete(&mut self, id: &str, outputs: NodeOutputs) -> Result<(), RoutingError> {
        let graph = self.graph;
        let Some(node) = graph.node(id) else {
            return Ok(());
        };

        for (port, _) in outputs.iter() {
            if !node.has_output(port) {
                return Err(RoutingError::UndeclaredOutput {
                    node: id.to_string(),
                    port: port.clone(),
                });
            }
        }

        let produced = outputs.produced();
        if let Some(run) = self.nodes.get_mut(id) {
            run.state = ExecutionState::Completed;
            run.outputs = produced.clone();
        }
        tracing::info!("✅ Node '{}' completed ({} output(s) produced)", id, produced.len());
        self.emit(RunEvent::NodeCompleted {
            node: id.to_string(),
            outputs: produced,
            terminal: node.config.terminal,
        });

        let mut results: BTreeMap<String, Output> = outputs.into_iter().collect();
        for port in &node.outputs {
            let output = results.remove(port).unwrap_or(Output::Skipped);
            let origin = PortRef::new(id, port.clone());
            match output {
                Output::Produced(value) => {
                    for destination in self.router.publish(id, port, value)? {
                        self.input_arrived(&destination);
                    }
                }
                Output::Skipped => {
                    let subscribers = self.router.subscribers(&origin).to_vec();
                    for destination in subscribers {
                        self.input_missing(&destination, &origin);
                    }
                }
            }
        }

        self.settled(id);
        Ok(())
    }

    fn input_arrived(&mut self, destination: &PortRef) {
        let Some(run) = self.nodes.get_mut(&destination.node) else {
            return;
        };
        if run.state != ExecutionState::Idle {
            // Already running or settled: the message stays in its slot unread
            return;
        }
        run.required_pending.remove(&destination.port);
        run.optional_pending.remove(&destination.port);
        self.refresh(&destination.node);
    }

    fn input_missing(&mut self, destination: &PortRef, origin: &PortRef) {
        let required = self
            .graph
            .node(&destination.node)
            .and_then(|node| node.input(&destination.port))
            .is_some_and(|port| !port.optional);
        let Some(run) = self.nodes.get_mut(&destination.node) else {
            return;
        };
        if run.state != ExecutionState::Idle {
            return;
        }
        if required {
            self.fail(
                &destination.node.clone(),
                FailureReason::InputNotProduced {
                    port: destination.port.clone(),
                    upstream: origin.clone(),
                },
            );
        } else {
            run.optional_pending.remove(&destination.port);
            self.refresh(&destination.node);
        }
    }

    /// Mark a node `Failed` and propagate through its bindings
    ///
    /// Required dependents fail by propagation (transitively); optional ones
    /// stop waiting for this producer.
    fn fail(&mut self, id: &str, reason: FailureReason) {
        let mut pending = VecDeque::from([(id.to_string(), reason)]);

        while let Some((current, reason)) = pending.pop_front() {
            let Some(run) = self.nodes.get_mut(&current) else {
                continue;
            };
            if run.state.is_settled() {
                continue;
            }
            match &reason {
                FailureReason::Invocation { message } => {
                    tracing::error!("❌ Node '{}' failed: {}", current, message);
                }
                other => tracing::warn!("⛔ Node '{}' will not run: {}", current, other),
            }
            run.state = ExecutionState::Failed;
            run.reason = Some(reason.clone());
            self.emit(RunEvent::NodeFailed {
                node: current.clone(),
                reason,
            });

            let graph = self.graph;
            for edge in graph.edges_from(&current) {
                let required = graph.is_required(edge);
                let Some(downstream) = self.nodes.get_mut(&edge.to.node) else {
                    continue;
                };
                if downstream.state != ExecutionState::Idle {
                    continue;
                }
                if required {
                    pending.push_back((
                        edge.to.node.clone(),
                        FailureReason::UpstreamFailed {
                            upstream: current.clone(),
                        },
                    ));
                } else {
                    downstream.optional_pending.remove(&edge.to.port);
                    self.refresh(&edge.to.node);
                }
            }

            self.settled(&current);
        }
    }

    /// Cancel not-yet-started nodes whose every input originates, directly or
    /// transitively, from the failed critical node
    fn cancel_exclusive_dependents(&mut self, critical: &str) {
        let graph = self.graph;
        let mut exclusive: HashSet<String> = HashSet::from([critical.to_string()]);
        loop {
            let mut grew = false;
            for node in graph.nodes() {
                if exclusive.contains(&node.id) {
                    continue;
                }
                let sources: Vec<&str> = graph
                    .edges_into(&node.id)
                    .map(|edge| edge.from.node.as_str())
                    .collect();
                if !sources.is_empty() && sources.iter().all(|source| exclusive.contains(*source)) {
                    exclusive.insert(node.id.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        let cancelled: Vec<String> = graph
            .nodes()
            .iter()
            .filter(|node| node.id != critical && exclusive.contains(&node.id))
            .filter(|node| {
                matches!(
                    self.state(&node.id),
                    Some(ExecutionState::Idle | ExecutionState::Ready)
                )
            })
            .map(|node| node.id.clone())
            .collect();

        for id in cancelled {
            self.fail(
                &id,
                FailureReason::Cancelled {
                    critical: critical.to_string(),
                },
            );
        }
    }

    /// Bookkeeping after any node settles: terminal notifications
    fn settled(&mut self, id: &str) {
        let graph = self.graph;
        let Some(node) = graph.node(id) else {
            return;
        };
        if node.config.terminal {
            if let Some(state) = self.state(id) {
                tracing::info!("🏁 Terminal node '{}' settled as {}", id, state);
                self.emit(RunEvent::TerminalSettled {
                    node: id.to_string(),
                    state,
                });
            }
        }
        self.check_pipeline_end();
    }

    fn check_pipeline_end(&mut self) {
        if self.pipeline_ended {
            return;
        }
        let graph = self.graph;
        let terminals = graph.terminal_nodes();
        let ended = if terminals.is_empty() {
            self.is_settled()
        } else {
            terminals.iter().all(|node| self.arrived_at_termination(&node.id))
        };
        if ended {
            self.pipeline_ended = true;
            tracing::info!("🎯 Pipeline reached its end");
            self.emit(RunEvent::PipelineEnded);
        }
    }

    /// Fail every node that can no longer make progress
    fn sweep_unreachable(&mut self) {
        let graph = self.graph;
        let stuck: Vec<String> = graph
            .nodes()
            .iter()
            .filter(|node| !self.state(&node.id).is_some_and(ExecutionState::is_settled))
            .map(|node| node.id.clone())
            .collect();
        for id in stuck {
            self.fail(&id, FailureReason::Unreachable);
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn into_report(self, started_at: chrono::DateTime<chrono::Utc>) -> RunReport {
        let nodes = self
            .graph
            .nodes()
            .iter()
            .map(|node| {
                let run = self.nodes.get(&node.id);
                let reason = run.and_then(|run| run.reason.clone());
                NodeReport {
                    id: node.id.clone(),
                    state: run.map(|run| run.state).unwrap_or(ExecutionState::Failed),
                    terminal: node.config.terminal,
                    error: reason.as_ref().map(ToString::to_string),
                    reason,
                    outputs: run.map(|run| run.outputs.clone()).unwrap_or_default(),
                }
            })
            .collect();

        RunReport {
            run_id: self.id,
            started_at,
            finished_at: chrono::Utc::now(),
            nodes,
        }
    }
}

/// Node id, invocation outcome, and the concurrency slot it occupied
type TaskResult = (
    String,
    Result<NodeOutputs, InvocationError>,
    Option<OwnedSemaphorePermit>,
);

/// Orchestrates concurrent execution of all node runtimes for a graph
#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<Graph>,
    runtimes: HashMap<String, Arc<NodeRuntime>>,
    policy: OptionalInputPolicy,
    max_concurrency: Option<usize>,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl Scheduler {
    /// Create a scheduler with one runtime per graph node
    pub fn new(graph: Arc<Graph>, runtimes: HashMap<String, Arc<NodeRuntime>>) -> Self {
        Self {
            graph,
            runtimes,
            policy: OptionalInputPolicy::Eager,
            max_concurrency: None,
            events: None,
        }
    }

    /// Take the optional-input policy and concurrency limit from `config`
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.policy = config.optional_inputs;
        self.max_concurrency = config.max_concurrency;
        self
    }

    /// Stream [`RunEvent`]s to `events` while running
    pub fn with_events(mut self, events: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Drive one Run until every node has settled
    ///
    /// Node failures are recorded in the report, never returned as errors.
    /// Only a routing invariant violation aborts the Run.
    pub async fn run(&self) -> Result<RunReport, EngineError> {
        let started_at = chrono::Utc::now();
        let workflow_start_time = std::time::Instant::now();
        let mut run = Run::new(&self.graph, self.policy).with_events(self.events.clone());
        let run_id = run.id();

        tracing::info!(
            "🚀 Starting run {} ({} nodes, {} edges)",
            run_id,
            self.graph.nodes().len(),
            self.graph.edges().len()
        );

        for node in self.graph.nodes() {
            if !self.runtimes.contains_key(&node.id) {
                return Err(EngineError::UnresolvedHandler {
                    node: node.id.clone(),
                    reason: "no runtime was built for this node".to_string(),
                });
            }
        }

        let semaphore = self
            .max_concurrency
            .filter(|&limit| limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut started: Vec<Arc<NodeRuntime>> = Vec::new();

        let outcome = loop {
            loop {
                // A node only turns Running once it holds a slot
                let permit = match &semaphore {
                    Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    None => None,
                };
                let Some(id) = run.next_ready() else {
                    break;
                };
                let Some(runtime) = self.runtimes.get(&id).cloned() else {
                    continue;
                };
                let inputs = run.router.take_inputs(&id);
                tracing::info!("📍 Dispatching node '{}' with {} input(s)", id, inputs.len());
                started.push(Arc::clone(&runtime));

                tasks.spawn(async move {
                    let invocation =
                        tokio::spawn(async move { runtime.invoke(run_id, inputs).await });
                    let result = match invocation.await {
                        Ok(result) => result,
                        Err(e) => Err(InvocationError {
                            node: id.clone(),
                            message: format!("node task aborted: {e}"),
                        }),
                    };
                    (id, result, permit)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break Ok(());
            };
            // The slot is released once this result has been applied
            let (id, result, _permit) = match joined {
                Ok(result) => result,
                Err(e) => {
                    break Err(EngineError::Task {
                        node: "<unknown>".to_string(),
                        message: e.to_string(),
                    })
                }
            };

            match result {
                Ok(outputs) => {
                    if let Err(e) = run.complete(&id, outputs) {
                        tracing::error!("❌ Routing invariant violated by '{}': {}", id, e);
                        break Err(EngineError::Routing(e));
                    }
                }
                Err(error) => {
                    run.fail(
                        &id,
                        FailureReason::Invocation {
                            message: error.message,
                        },
                    );
                    let critical = self
                        .graph
                        .node(&id)
                        .is_some_and(|node| node.config.critical);
                    if critical {
                        tracing::warn!("🛑 Critical node '{}' failed, cancelling its exclusive dependents", id);
                        run.cancel_exclusive_dependents(&id);
                    }
                }
            }
        };

        if outcome.is_err() {
            tasks.shutdown().await;
        }
        for runtime in &started {
            if let Err(e) = runtime.stop().await {
                tracing::warn!("⚠️ Failed to stop node '{}': {}", runtime.node().id, e.message);
            }
        }
        outcome?;

        run.sweep_unreachable();
        run.check_pipeline_end();

        let report = run.into_report(started_at);
        tracing::info!(
            "🎉 Run {} finished in {:?}: {} completed, {} failed",
            run_id,
            workflow_start_time.elapsed(),
            report.completed().len(),
            report.failures().len()
        );
        Ok(report)
    }
}
