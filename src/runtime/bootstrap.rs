/// Bootstrap stage: prepares each node's runnable form before a Run
///
/// The graph model treats a node's `build` reference as an opaque string. The
/// stage here is the only consumer: it is invoked once per node that declares
/// one, before the scheduler starts, and any failure stops the pipeline from
/// starting.

use crate::error::EngineError;
use crate::workflow::types::{Graph, Node};
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

/// Pluggable preparation step for node implementations
#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Prepare `node`; only called for nodes that declare a build reference
    async fn prepare(&self, node: &Node, build: &str) -> anyhow::Result<()>;
}

/// Skips every build step
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBootstrap;

#[async_trait]
impl Bootstrap for NoopBootstrap {
    async fn prepare(&self, node: &Node, _build: &str) -> anyhow::Result<()> {
        tracing::debug!("⏭️ Skipping build for node '{}'", node.id);
        Ok(())
    }
}

/// Runs build references as shell commands (`sh -c <build>`)
#[derive(Debug, Clone, Default)]
pub struct ShellBootstrap {
    workdir: Option<PathBuf>,
}

impl ShellBootstrap {
    pub fn new(workdir: Option<PathBuf>) -> Self {
        Self { workdir }
    }
}

#[async_trait]
impl Bootstrap for ShellBootstrap {
    async fn prepare(&self, node: &Node, build: &str) -> anyhow::Result<()> {
        tracing::info!("🔨 Building node '{}': {}", node.id, build);

        let mut command = Command::new("sh");
        command.arg("-c").arg(build).kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("failed to launch build command `{build}`"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "build command `{}` exited with {}: {}",
                build,
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

/// Run the bootstrap stage for every node with a build reference, in
/// declaration order
pub async fn bootstrap_graph(graph: &Graph, bootstrap: &dyn Bootstrap) -> Result<(), EngineError> {
    for node in graph.nodes() {
        let Some(build) = node.build.as_deref() else {
            continue;
        };
        bootstrap
            .prepare(node, build)
            .await
            .map_err(|e| EngineError::Bootstrap {
                node: node.id.clone(),
                message: format!("{e:#}"),
            })?;
    }
    Ok(())
}
