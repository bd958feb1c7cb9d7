/// framewire command line
///
/// ```text
/// framewire validate <dataflow.json>
/// framewire run <dataflow.json> [--skip-build] [--report <report.json>]
/// ```
///
/// `validate` exits 0 on a valid graph and 1 with the first validation error.
/// `run` prints one line per terminal-sink completion, then the run report, and
/// exits 1 if any node reachable from an entry point failed.

use anyhow::{bail, Context, Result};
use framewire::runtime::{ExecutionEngine, HandlerRegistry, RunEvent};
use framewire::{load_file, EngineConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage:
  framewire validate <dataflow.json>
  framewire run <dataflow.json> [--skip-build] [--report <report.json>]";

enum Command {
    Validate {
        descriptor: PathBuf,
    },
    Run {
        descriptor: PathBuf,
        skip_build: bool,
        report: Option<PathBuf>,
    },
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(subcommand) = args.first() else {
        bail!("missing command");
    };

    match subcommand.as_str() {
        "validate" => match &args[1..] {
            [descriptor] => Ok(Command::Validate {
                descriptor: PathBuf::from(descriptor),
            }),
            _ => bail!("validate expects exactly one descriptor path"),
        },
        "run" => {
            let mut descriptor = None;
            let mut skip_build = false;
            let mut report = None;
            let mut rest = args[1..].iter();
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "--skip-build" => skip_build = true,
                    "--report" => {
                        let path = rest.next().context("--report expects a path")?;
                        report = Some(PathBuf::from(path));
                    }
                    flag if flag.starts_with("--") => bail!("unknown flag '{flag}'"),
                    path if descriptor.is_none() => descriptor = Some(PathBuf::from(path)),
                    extra => bail!("unexpected argument '{extra}'"),
                }
            }
            Ok(Command::Run {
                descriptor: descriptor.context("run expects a descriptor path")?,
                skip_build,
                report,
            })
        }
        other => bail!("unknown command '{other}'"),
    }
}

/// Initialize tracing subscriber for logging; stdout is reserved for results
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {e}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    let result = match command {
        Command::Validate { descriptor } => validate(&descriptor),
        Command::Run {
            descriptor,
            skip_build,
            report,
        } => run(&descriptor, skip_build, report.as_deref()).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn validate(descriptor: &Path) -> Result<ExitCode> {
    match load_file(descriptor) {
        Ok(graph) => {
            println!(
                "valid: {} nodes, {} edges",
                graph.nodes().len(),
                graph.edges().len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("invalid: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(descriptor: &Path, skip_build: bool, report_path: Option<&Path>) -> Result<ExitCode> {
    let graph = match load_file(descriptor) {
        Ok(graph) => Arc::new(graph),
        Err(e) => {
            println!("invalid: {e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut config = EngineConfig::default();
    if skip_build {
        config.skip_build = true;
    }
    if config.workdir.is_none() {
        config.workdir = descriptor
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf);
    }

    let engine = ExecutionEngine::new(config, HandlerRegistry::with_builtins());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let RunEvent::NodeCompleted {
                node,
                outputs,
                terminal: true,
            } = event
            {
                let outputs = serde_json::to_string(&outputs).unwrap_or_else(|_| "{}".to_string());
                println!("{node} completed: {outputs}");
            }
        }
    });

    let report = engine.execute_with_events(Arc::clone(&graph), tx).await;
    printer.await.context("terminal printer task failed")?;
    let report = report?;

    println!("{report}");

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        tracing::info!("📄 Run report written to {}", path.display());
    }

    let failed = report.failed_reachable_from_entry(&graph);
    if failed.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        for node in &failed {
            eprintln!(
                "failed: {} ({})",
                node.id,
                node.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(ExitCode::FAILURE)
    }
}
