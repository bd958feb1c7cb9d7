/// Dataflow execution engine
///
/// Ties the pieces together for one pipeline invocation: resolve a handler
/// for every node, run the bootstrap stage, build one [`NodeRuntime`] per node,
/// and hand them to the [`Scheduler`] until the Run settles.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::runtime::bootstrap::{bootstrap_graph, Bootstrap, NoopBootstrap, ShellBootstrap};
use crate::runtime::executor::NodeRuntime;
use crate::runtime::handlers::HandlerRegistry;
use crate::runtime::report::RunReport;
use crate::runtime::scheduler::{RunEvent, Scheduler};
use crate::workflow::types::Graph;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Entry point for executing validated graphs
///
/// Holds the handler registry and bootstrap stage shared by every Run; the
/// Runs themselves keep no state here.
pub struct ExecutionEngine {
    config: EngineConfig,
    registry: HandlerRegistry,
    bootstrap: Arc<dyn Bootstrap>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Create an engine; build commands run through `sh` unless disabled
    pub fn new(config: EngineConfig, registry: HandlerRegistry) -> Self {
        let bootstrap: Arc<dyn Bootstrap> = if config.skip_build {
            Arc::new(NoopBootstrap)
        } else {
            Arc::new(ShellBootstrap::new(config.workdir.clone()))
        };
        Self {
            config,
            registry,
            bootstrap,
        }
    }

    /// Replace the bootstrap stage
    pub fn with_bootstrap(mut self, bootstrap: Arc<dyn Bootstrap>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Resolve handlers and wrap each node in its runtime
    ///
    /// Fails before anything runs if a single node has no implementation.
    pub fn build_runtimes(
        &self,
        graph: &Graph,
    ) -> Result<HashMap<String, Arc<NodeRuntime>>, EngineError> {
        let mut runtimes = HashMap::new();
        for node in graph.nodes() {
            let handler = self.registry.resolve(node, self.config.workdir.as_deref())?;
            let runtime = NodeRuntime::new(Arc::new(node.clone()), handler)
                .with_log_dir(self.config.log_dir.clone());
            runtimes.insert(node.id.clone(), Arc::new(runtime));
        }
        Ok(runtimes)
    }

    /// Run the bootstrap stage for every node that declares a build step
    pub async fn prepare(&self, graph: &Graph) -> Result<(), EngineError> {
        bootstrap_graph(graph, self.bootstrap.as_ref()).await
    }

    /// Execute one Run of `graph` to completion
    pub async fn execute(&self, graph: Arc<Graph>) -> Result<RunReport, EngineError> {
        self.execute_inner(graph, None).await
    }

    /// Execute one Run, streaming progress events to `events`
    ///
    /// The sender is dropped when the Run returns, closing the channel.
    pub async fn execute_with_events(
        &self,
        graph: Arc<Graph>,
        events: mpsc::UnboundedSender<RunEvent>,
    ) -> Result<RunReport, EngineError> {
        self.execute_inner(graph, Some(events)).await
    }

    async fn execute_inner(
        &self,
        graph: Arc<Graph>,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> Result<RunReport, EngineError> {
        tracing::debug!("⚙️ Resolving handlers for {} nodes", graph.nodes().len());
        let runtimes = self.build_runtimes(&graph)?;

        self.prepare(&graph).await?;

        let mut scheduler = Scheduler::new(Arc::clone(&graph), runtimes).with_config(&self.config);
        if let Some(events) = events {
            scheduler = scheduler.with_events(events);
        }
        scheduler.run().await
    }
}
