use anyhow::Context;
use benchflow::batch::{BatchProcessor, Task};
use benchflow::decision::DecisionEngine;
use benchflow::metrics::TracingMetricsSink;
use benchflow::resource::ResourcePool;
use benchflow::runner::{SimulatedRunner, TaskRunner};
use benchflow::workflow::WorkflowExecutor;
use benchflow::OrchestratorConfig;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Orchestrate simulated agent workloads
#[derive(Parser)]
#[command(name = "benchflow")]
#[command(about = "Autonomous task orchestration for agent benchmarking", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a TOML configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Probability that a simulated task attempt fails
    #[arg(long, default_value = "0.1", global = true)]
    failure_rate: f64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute a free-text objective
    Run {
        /// The objective to accomplish
        objective: String,
    },
    /// Execute a JSON array of tasks as one batch
    Batch {
        /// File holding the task list
        tasks: PathBuf,

        /// Batch id, used to resume from a checkpoint
        #[arg(long)]
        batch_id: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .with_writer(std::io::stderr)
        .init();

    debug!("benchflow started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    if let Err(e) = run(cli).await {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref()).await?;
    let runner: Arc<dyn TaskRunner> = Arc::new(SimulatedRunner::new(
        Duration::from_millis(50),
        Duration::from_millis(250),
        cli.failure_rate.clamp(0.0, 1.0),
    ));
    let pool = Arc::new(ResourcePool::new(config.pool.clone())?);
    pool.start_background();

    let output = match cli.command {
        Commands::Run { objective } => {
            let engine = Arc::new(DecisionEngine::new(config.decision.clone()));
            let executor =
                WorkflowExecutor::new(config.workflow.clone(), Arc::clone(&pool), engine, runner)?
                    .with_metrics_sink(Arc::new(TracingMetricsSink));
            let result = executor.execute_objective(&objective).await?;
            serde_json::to_string_pretty(&result)?
        }
        Commands::Batch {
            tasks: path,
            batch_id,
        } => {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read tasks from {}", path.display()))?;
            let tasks: Vec<Task> = serde_json::from_str(&content)
                .with_context(|| format!("Invalid task list in {}", path.display()))?;
            let processor = BatchProcessor::new(config.batch.clone(), Arc::clone(&pool), runner)?
                .with_pipeline_config(config.pipeline.clone())?
                .with_metrics_sink(Arc::new(TracingMetricsSink));
            let result = processor.process_batch(tasks, batch_id).await?;
            serde_json::to_string_pretty(&result)?
        }
    };

    pool.shutdown().await;
    println!("{output}");
    Ok(())
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::load(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(OrchestratorConfig::default()),
    }
}
