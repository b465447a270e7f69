//! Temporal-reasoning bench
//!
//! Runs fixed prompt sets that test how well a model resolves relative dates
//! ("last year", "last academic year") given today's date, fanned out over
//! one worker process per GPU.
//!
//! Configuration comes from the environment (see [`config`]); the subcommand
//! only picks which bench to run.

mod config;
mod drivers;
mod prompts;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gpu_bridge::{run_worker, HarnessConfig, WorkerCommand};
use tracing::warn;

use config::{BenchConfig, LogFormat};
use drivers::BenchContext;

const SERVICE_NAME: &str = "temporal-bench";

/// Temporal-reasoning prompt benchmarks across GPUs
#[derive(Parser)]
#[command(name = "temporal-bench")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One worker per GPU, each with its own temporal prompts
    MultiGpu,

    /// Single tuned engine with warmup and throughput report
    Optimized,

    /// Basic prompts vs prompts enriched with date and academic-year context
    TemporalComparison,

    /// Large model split across all GPUs, falling back to a single-GPU model
    TensorParallel,

    /// Small model smoke test
    Smoke,

    /// Serve one harness request on stdin/stdout (started by the harness)
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match LogFormat::from_env() {
        LogFormat::Json => fanout_core::init_tracing_json(SERVICE_NAME),
        LogFormat::Text => fanout_core::init_tracing(SERVICE_NAME),
    }

    if matches!(cli.command, Commands::Worker) {
        let mut stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        run_worker(&mut stdin, &mut stdout).await?;
        return Ok(());
    }

    let bench = BenchConfig::from_env()?;
    let harness = HarnessConfig::from_env()?;
    let worker = WorkerCommand::current_exe()?.arg("worker");
    let ctx = BenchContext::new(bench, worker, harness);

    // Workers run in their own process groups and do not see the terminal's
    // Ctrl-C; dropping the driver kills them.
    tokio::select! {
        result = run_driver(&cli.command, &ctx) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping workers");
            Ok(())
        }
    }
}

async fn run_driver(command: &Commands, ctx: &BenchContext) -> Result<()> {
    match command {
        Commands::MultiGpu => drivers::multi_gpu::run(ctx).await,
        Commands::Optimized => drivers::optimized::run(ctx).await,
        Commands::TemporalComparison => drivers::comparison::run(ctx).await,
        Commands::TensorParallel => drivers::tensor_parallel::run(ctx).await,
        Commands::Smoke => drivers::smoke::run(ctx).await,
        Commands::Worker => Ok(()),
    }
}
