//! Bandscale - progressive concurrency scaling for database load tests
//!
//! A CLI that plans band sequences, runs them against an executor,
//! checkpoints progress and renders the scaling analysis.
//!
//! Exit codes:
//!   0 - Success (run completed)
//!   1 - Runtime error (configuration, checkpoint storage, etc.)
//!   2 - Run stopped early (failed band or cancellation); resumable from a checkpoint

mod cli;
mod config;
mod progress;

use anyhow::{bail, Context, Result};
use bandscale::analysis::AnalysisEngine;
use bandscale::checkpoint::{Checkpoint, CheckpointManager, RecoveryAction, RunStatus};
use bandscale::controller::{ControllerOptions, ExecutionController, RunOutcome};
use bandscale::executor::{SyntheticExecutor, SyntheticModel};
use bandscale::models::TestConfiguration;
use bandscale::planner;
use bandscale::report::{self, ExportFormat, ResultDocument};
use cli::{Args, Command, RunOptions};
use config::{Config, DEFAULT_CONFIG_FILE};
use progress::BandProgress;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

const SYNTHETIC_EXECUTOR: &str = "synthetic";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if let Command::InitConfig = args.command {
        return handle_init_config();
    }

    // The config file can turn on verbose logging, so it is read first
    let (mut config, source) = load_config(&args)?;
    config.merge_with_args(&args);

    // Initialize logging
    init_logging(config.log_level(args.quiet))?;

    info!("Bandscale v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);
    source.log();

    match run_command(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .bandscale.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml()?;
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to customize bands, thresholds, checkpoints, and recovery.");
    Ok(())
}

/// Initialize logging at `level`.
fn init_logging(level: tracing::Level) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Dispatch the subcommand. Returns the process exit code.
async fn run_command(args: Args, config: Config) -> Result<i32> {
    let quiet = args.quiet;

    match args.command {
        Command::Plan { .. } => handle_plan(&config.test.to_configuration()),
        Command::Simulate { run, .. } => handle_simulate(&config, &run, quiet).await,
        Command::Resume {
            checkpoint,
            action,
            run,
        } => handle_resume(&config, &checkpoint, action, &run, quiet).await,
        Command::Checkpoints { delete, dir } => {
            let dir = dir.unwrap_or_else(|| config.checkpoint.directory.clone());
            handle_checkpoints(&dir, config.checkpoint.retention, delete.as_deref()).await
        }
        Command::Inspect { checkpoint, dir } => {
            let dir = dir.unwrap_or_else(|| config.checkpoint.directory.clone());
            handle_inspect(&dir, config.checkpoint.retention, &checkpoint).await
        }
        Command::Export {
            checkpoint,
            format,
            output,
            dir,
        } => {
            let dir = dir.unwrap_or_else(|| config.checkpoint.directory.clone());
            let manager = CheckpointManager::open(&dir, config.checkpoint.retention).await?;
            let checkpoint = load_checkpoint(&manager, &checkpoint).await?;
            let engine = AnalysisEngine::new(config.analysis.clone());
            let document = ResultDocument::from_state(&checkpoint.state, &engine);
            write_report(&document, format, output.as_deref())?;
            Ok(0)
        }
        Command::InitConfig => handle_init_config().map(|_| 0),
    }
}

/// Print the band sequence for a configuration.
fn handle_plan(test: &TestConfiguration) -> Result<i32> {
    let plan = planner::plan_bands(test)?;

    println!(
        "📋 {} strategy, {} bands ({:?} per band):\n",
        test.strategy,
        plan.len(),
        test.band_wall_time()
    );
    println!("   {:>4}  {:>8}  {:>11}", "band", "workers", "connections");
    for band in &plan {
        println!(
            "   {:>4}  {:>8}  {:>11}",
            band.index + 1,
            band.workers,
            band.connections
        );
    }
    println!(
        "\n   Estimated wall time: {:?}",
        test.band_wall_time() * plan.len() as u32
    );
    Ok(0)
}

/// Run a fresh test against the synthetic executor.
async fn handle_simulate(config: &Config, run: &RunOptions, quiet: bool) -> Result<i32> {
    let controller = build_controller(config, run, quiet).await?;
    let test = config.test.to_configuration();

    println!(
        "🚀 Running {} bands against the synthetic executor...",
        test.band_count
    );
    let outcome = controller.run(test).await?;
    finish_run(config, &outcome)
}

/// Continue a run from a stored checkpoint.
async fn handle_resume(
    config: &Config,
    id: &str,
    action: Option<RecoveryAction>,
    run: &RunOptions,
    quiet: bool,
) -> Result<i32> {
    let directory = &config.checkpoint.directory;
    let manager = CheckpointManager::open(directory, config.checkpoint.retention).await?;
    let checkpoint = load_checkpoint(&manager, id).await?;

    if checkpoint.state.metadata.executor != SYNTHETIC_EXECUTOR {
        warn!(
            "Checkpoint was written by executor '{}'; resuming with '{}'",
            checkpoint.state.metadata.executor, SYNTHETIC_EXECUTOR
        );
    }

    println!(
        "🔁 Resuming run {} from checkpoint {} ({} of {} bands done)",
        checkpoint.state.metadata.run_id,
        checkpoint.id,
        checkpoint.state.results.len(),
        checkpoint.state.execution.total_bands
    );

    let controller = build_controller(config, run, quiet).await?;
    let outcome = controller.resume(checkpoint, action).await?;
    finish_run(config, &outcome)
}

/// Controller over the synthetic executor, wired to checkpoints, progress and ctrl-c.
async fn build_controller(
    config: &Config,
    run: &RunOptions,
    quiet: bool,
) -> Result<ExecutionController<SyntheticExecutor>> {
    let model = SyntheticModel {
        seed: run.seed.unwrap_or(SyntheticModel::default().seed),
        ..SyntheticModel::default()
    };
    let options = ControllerOptions {
        executor_name: SYNTHETIC_EXECUTOR.to_string(),
        checkpoint_interval: config.checkpoint_interval(),
        recovery: config.recovery,
        ..ControllerOptions::default()
    };
    let engine = AnalysisEngine::new(config.analysis.clone());

    let mut controller = ExecutionController::new(SyntheticExecutor::new(model), engine, options);

    if config.checkpoint.enabled {
        let manager =
            CheckpointManager::open(&config.checkpoint.directory, config.checkpoint.retention)
                .await?;
        info!("Checkpoints in: {}", manager.dir().display());
        controller = controller.with_checkpoints(Arc::new(manager));
    } else {
        warn!("Checkpoints disabled; an interrupted run cannot be resumed");
    }

    if !quiet {
        controller
            .observers_mut()
            .register(Arc::new(BandProgress::new()));
    }

    let cancel = controller.cancel_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⏹  Cancelling after the current band sample...");
            cancel.cancel();
        }
    });

    Ok(controller)
}

/// Print the run summary, write the report, and pick the exit code.
fn finish_run(config: &Config, outcome: &RunOutcome) -> Result<i32> {
    let engine = AnalysisEngine::new(config.analysis.clone());
    let document = ResultDocument::from_state(&outcome.state, &engine);

    println!("\n📊 Run Summary:");
    println!("   Status: {}", outcome.status);
    println!(
        "   Bands committed: {} of {}",
        outcome.state.results.len(),
        outcome.state.execution.total_bands
    );
    if !outcome.state.partial_results.is_empty() {
        println!("   Interrupted bands: {}", outcome.state.partial_results.len());
    }
    if let Some(optimal) = &document.optimal_configuration {
        println!(
            "   Optimal: {} workers / {} connections ({:.1} TPS, confidence {:.0}%)",
            optimal.workers,
            optimal.connections,
            optimal.tps,
            optimal.confidence * 100.0
        );
    }
    if let Some(analysis) = &document.analysis {
        for rec in &analysis.recommendations {
            println!("   - {}", rec);
        }
    }

    if let Some(ref output) = config.general.output {
        write_report(&document, config.general.format, Some(output))?;
    }

    if let Some(id) = outcome.last_checkpoint {
        println!("   Last checkpoint: {}", id);
    }

    match outcome.status {
        RunStatus::Completed => {
            println!("\n✅ Run complete!");
            Ok(0)
        }
        RunStatus::Failed => {
            if let Some(recovery) = &outcome.state.recovery {
                eprintln!(
                    "\n⛔ {} failed: {}\n   Proposed recovery: bandscale resume --action {}",
                    recovery.failed_band, recovery.error.message, recovery.proposed
                );
            }
            Ok(2)
        }
        status => {
            eprintln!(
                "\n⏹  Run {}; {} bands remain. Continue with: bandscale resume",
                status,
                outcome.remaining_bands().len()
            );
            Ok(2)
        }
    }
}

/// Render `document` and write it to `output`, or stdout when `None`.
fn write_report(
    document: &ResultDocument,
    format: ExportFormat,
    output: Option<&Path>,
) -> Result<()> {
    let rendered = report::render(document, format)?;

    match output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            println!("   Report ({}) saved to: {}", format, path.display());
        }
        None => print!("{}", rendered),
    }
    Ok(())
}

/// List checkpoints, or delete one.
async fn handle_checkpoints(dir: &Path, retention: usize, delete: Option<&str>) -> Result<i32> {
    let manager = CheckpointManager::open(dir, retention).await?;

    if let Some(id) = delete {
        manager.delete(id).await?;
        println!("🗑  Deleted checkpoint {}", id);
        return Ok(0);
    }

    let checkpoints = manager.list().await?;
    if checkpoints.is_empty() {
        println!("No checkpoints in {}", dir.display());
        return Ok(0);
    }

    println!(
        "{:<36}  {:>5}  {:<20}  {:<9}  {:>5}  {:<9}",
        "id", "seq", "created", "status", "bands", "resumable"
    );
    for summary in &checkpoints {
        println!(
            "{:<36}  {:>5}  {:<20}  {:<9}  {:>2}/{:<2}  {:<9}",
            summary.id,
            summary.sequence,
            summary.created_at.format("%Y-%m-%d %H:%M:%S"),
            summary.status,
            summary.completed_bands,
            summary.total_bands,
            if summary.resumable { "yes" } else { "no" }
        );
    }
    Ok(0)
}

/// Print what a checkpoint holds.
async fn handle_inspect(dir: &Path, retention: usize, id: &str) -> Result<i32> {
    let manager = CheckpointManager::open(dir, retention).await?;
    let checkpoint = load_checkpoint(&manager, id).await?;
    let state = &checkpoint.state;

    println!("Checkpoint {} (#{})", checkpoint.id, checkpoint.sequence);
    println!("   Created: {}", checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!(
        "   Run: {} ({}, engine v{})",
        state.metadata.run_id, state.metadata.executor, state.metadata.engine_version
    );
    println!(
        "   Status: {} ({:.0}% of {} bands)",
        state.execution.status,
        state.execution.progress() * 100.0,
        state.execution.total_bands
    );
    println!("   Resumable: {}", state.execution.resumable);

    if let Some(current) = &state.execution.current_band {
        println!(
            "   In flight: {} ({}, {} operations)",
            current.plan, current.phase, current.operations_seen
        );
    }

    for band in &state.results {
        println!(
            "   ✔ band {} ({}w/{}c): {:.1} TPS, avg {:.2} ms, {}",
            band.band_index + 1,
            band.workers,
            band.connections,
            band.total_tps,
            band.avg_latency_ms,
            band.status
        );
    }
    for band in &state.partial_results {
        println!(
            "   ✘ band {} ({}w/{}c): interrupted after {} operations",
            band.band_index + 1,
            band.workers,
            band.connections,
            band.total_operations
        );
    }
    for record in &state.execution.errors {
        println!("   ! {}", record.message);
    }
    if let Some(recovery) = &state.recovery {
        println!(
            "   Recovery: {} (failure #{}, reduced band {})",
            recovery.proposed, recovery.failures, recovery.reduced_band
        );
        let candidates: Vec<String> = recovery.candidates.iter().map(|a| a.to_string()).collect();
        println!("   Candidate actions: {}", candidates.join(", "));
    }

    if !checkpoint.remaining_bands.is_empty() {
        println!("   Remaining: {} bands", checkpoint.remaining_bands.len());
    }
    Ok(0)
}

/// Resolve "latest" or an id prefix to a checkpoint.
async fn load_checkpoint(manager: &CheckpointManager, id: &str) -> Result<Checkpoint> {
    if id == "latest" {
        match manager.restore_latest().await? {
            Some(checkpoint) => Ok(checkpoint),
            None => bail!("No checkpoints in {}", manager.dir().display()),
        }
    } else {
        Ok(manager.restore(id).await?)
    }
}

/// Where the configuration came from, logged once logging is up.
enum ConfigSource {
    Explicit(PathBuf),
    DefaultFile,
    Builtin,
    Unreadable(anyhow::Error),
}

impl ConfigSource {
    fn log(&self) {
        match self {
            Self::Explicit(path) => info!("Loaded config from: {}", path.display()),
            Self::DefaultFile => info!("Loaded default config from {}", DEFAULT_CONFIG_FILE),
            Self::Builtin => debug!("No config file found, using defaults"),
            Self::Unreadable(e) => warn!("Failed to load config: {:#}", e),
        }
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<(Config, ConfigSource)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, ConfigSource::Explicit(config_path.clone())));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok((config, ConfigSource::DefaultFile)),
        Ok(None) => Ok((Config::default(), ConfigSource::Builtin)),
        Err(e) => Ok((Config::default(), ConfigSource::Unreadable(e))),
    }
}
