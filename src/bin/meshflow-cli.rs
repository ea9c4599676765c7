//! meshflow CLI: composition-root entry point.
//!
//! Loads config, builds the shared registry and engine config, then hands
//! off to whichever subcommand does the actual work. Running and inspecting
//! workflows is a local operation here, not a server.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshflow::{register_builtin_connectors, EngineConfig, ExecutionEngine, RunContext, RunOutcome, WorkflowGraph};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "meshflow-cli", about = "Run and inspect meshflow workflow graphs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate and run a workflow definition file.
    Run {
        /// Path to a JSON workflow definition (`{"nodes": [...], "edges": [...]}`).
        workflow: PathBuf,
        /// Authenticated user id to place on the run context.
        #[arg(long)]
        user_id: Option<String>,
        /// Run deadline in seconds.
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Validate a workflow definition without executing any connector.
    Validate { workflow: PathBuf },
    /// List every registered connector type id, name, and kind.
    ListConnectors,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let registry = register_builtin_connectors();
    let engine_config = Arc::new(EngineConfig::default());

    match cli.command {
        Command::ListConnectors => {
            for (id, name, kind) in registry.list() {
                println!("{id:<28} {kind:?} — {name}");
            }
        }
        Command::Validate { workflow } => {
            let graph = load_graph(&workflow)?;
            let engine = ExecutionEngine::new(&registry);
            engine.validate(&graph).map_err(|e| anyhow::anyhow!("validation failed: {e}"))?;
            println!("workflow is valid");
        }
        Command::Run { workflow, user_id, timeout_secs } => {
            let graph = load_graph(&workflow)?;
            let engine = ExecutionEngine::new(&registry);
            let ctx = RunContext::new(user_id, Duration::from_secs(timeout_secs), engine_config);
            let result = engine.run(&graph, &ctx).await;

            for node_id in graph.nodes.iter().map(|n| &n.id) {
                if let Some(envelope) = result.results.get(node_id) {
                    println!("{node_id}: {} record(s) in {}ms", envelope.data.len(), envelope.metadata.execution_time_ms);
                }
            }

            match result.outcome {
                RunOutcome::Completed => println!("run completed"),
                RunOutcome::Cancelled => println!("run cancelled: {}", result.error.map(|e| e.to_string()).unwrap_or_default()),
                RunOutcome::Failed => {
                    anyhow::bail!("run failed: {}", result.error.map(|e| e.to_string()).unwrap_or_default());
                }
            }
        }
    }

    Ok(())
}

fn load_graph(path: &PathBuf) -> Result<WorkflowGraph> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading '{}'", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing workflow definition '{}'", path.display()))
}
