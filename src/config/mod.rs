/// Configuration management for the framewire engine
///
/// Handles runtime parameters for scheduling, invocation logging, and the
/// bootstrap stage. Every field can be overridden through environment
/// variables so the same binary runs unchanged in containers and CI.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a node with optional inputs decides it is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionalInputPolicy {
    /// Ready as soon as every required input is satisfied
    #[default]
    Eager,
    /// Also wait until each optional input arrived or its producer settled
    Settle,
}

impl OptionalInputPolicy {
    /// Parse a policy name (`eager` / `settle`), case-insensitive
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "eager" => Some(Self::Eager),
            "settle" => Some(Self::Settle),
            _ => None,
        }
    }
}

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of concurrently running node invocations (None = unbounded)
    pub max_concurrency: Option<usize>,
    /// Directory receiving per-node JSON-lines invocation records
    /// Only nodes with `WRITE_LOG` set write here
    pub log_dir: Option<PathBuf>,
    /// Readiness rule for nodes with optional inputs
    pub optional_inputs: OptionalInputPolicy,
    /// Skip running node build commands before the Run
    pub skip_build: bool,
    /// Working directory for build commands and out-of-process workers
    pub workdir: Option<PathBuf>,
}

impl Default for EngineConfig {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            max_concurrency: std::env::var("FRAMEWIRE_MAX_CONCURRENCY")
                .ok()
                .and_then(|value| value.trim().parse::<usize>().ok())
                .filter(|&limit| limit > 0),
            log_dir: std::env::var("FRAMEWIRE_LOG_DIR")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            optional_inputs: std::env::var("FRAMEWIRE_OPTIONAL_INPUTS")
                .ok()
                .and_then(|value| OptionalInputPolicy::parse(&value))
                .unwrap_or_default(),
            skip_build: std::env::var("FRAMEWIRE_SKIP_BUILD")
                .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            workdir: std::env::var("FRAMEWIRE_WORKDIR").ok().map(PathBuf::from),
        }
    }
}

impl EngineConfig {
    /// Configuration with no environment overrides applied
    pub fn builtin() -> Self {
        Self {
            max_concurrency: None,
            log_dir: None,
            optional_inputs: OptionalInputPolicy::Eager,
            skip_build: false,
            workdir: None,
        }
    }

    /// Cap the number of simultaneously running node invocations
    ///
    /// A limit of `0` removes the cap. Nodes beyond the limit stay `Ready`
    /// until a running node settles.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = (limit > 0).then_some(limit);
        self
    }

    /// Choose when a node with optional inputs becomes ready
    pub fn with_optional_inputs(mut self, policy: OptionalInputPolicy) -> Self {
        self.optional_inputs = policy;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Skip every node's build step (the bootstrap stage becomes a no-op)
    pub fn with_skip_build(mut self, skip: bool) -> Self {
        self.skip_build = skip;
        self
    }
}
