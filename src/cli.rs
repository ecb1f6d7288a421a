//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use bandscale::checkpoint::RecoveryAction;
use bandscale::models::Strategy;
use bandscale::report::ExportFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Bandscale - progressive concurrency scaling for database load tests
///
/// Runs a load test as a sequence of bands with growing worker and
/// connection counts, checkpoints every band, and analyses where the
/// system stops scaling.
///
/// Examples:
///   bandscale plan --strategy exponential --max-connections 128
///   bandscale simulate --bands 8 --band-duration 30
///   bandscale checkpoints
///   bandscale export latest --format csv -o bands.csv
///   bandscale resume latest --action reduce-load
///   bandscale init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .bandscale.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true, env = "BANDSCALE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the band sequence a configuration produces
    Plan {
        #[command(flatten)]
        test: TestOverrides,
    },

    /// Run a scaling test against the synthetic executor
    Simulate {
        #[command(flatten)]
        test: TestOverrides,

        #[command(flatten)]
        run: RunOptions,
    },

    /// Continue an interrupted or failed run from a checkpoint
    Resume {
        /// Checkpoint id (or unique prefix), or "latest"
        #[arg(default_value = "latest")]
        checkpoint: String,

        /// Recovery action for a failed band (continue, retry-band, reduce-load)
        ///
        /// Defaults to the action proposed in the checkpoint
        #[arg(long, value_name = "ACTION")]
        action: Option<RecoveryAction>,

        #[command(flatten)]
        run: RunOptions,
    },

    /// List stored checkpoints, newest last
    Checkpoints {
        /// Delete the checkpoint with this id (or unique prefix) instead
        #[arg(long, value_name = "ID")]
        delete: Option<String>,

        /// Checkpoint directory
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Show the state stored in a checkpoint
    Inspect {
        /// Checkpoint id (or unique prefix), or "latest"
        #[arg(default_value = "latest")]
        checkpoint: String,

        /// Checkpoint directory
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Render the results stored in a checkpoint
    Export {
        /// Checkpoint id (or unique prefix), or "latest"
        #[arg(default_value = "latest")]
        checkpoint: String,

        /// Output format
        #[arg(short, long, default_value = "json", value_name = "FORMAT")]
        format: ExportFormat,

        /// Output file; printed to stdout when omitted
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Checkpoint directory
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Generate a default .bandscale.toml configuration file
    InitConfig,
}

/// Overrides for the `[test]` section of the configuration file.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct TestOverrides {
    /// Band growth strategy
    #[arg(long, value_name = "STRATEGY")]
    pub strategy: Option<Strategy>,

    /// Workers in the first band
    #[arg(long, value_name = "NUM")]
    pub min_workers: Option<u32>,

    /// Workers in the last band
    #[arg(long, value_name = "NUM")]
    pub max_workers: Option<u32>,

    /// Connections in the first band
    #[arg(long, value_name = "NUM")]
    pub min_connections: Option<u32>,

    /// Connections in the last band
    #[arg(long, value_name = "NUM")]
    pub max_connections: Option<u32>,

    /// Number of bands
    #[arg(long = "bands", value_name = "COUNT")]
    pub band_count: Option<usize>,

    /// Measured run phase of each band, in seconds
    #[arg(long, value_name = "SECS")]
    pub band_duration: Option<u64>,

    /// Warmup before each run phase, in seconds
    #[arg(long, value_name = "SECS")]
    pub warmup: Option<u64>,

    /// Cooldown after each run phase, in seconds
    #[arg(long, value_name = "SECS")]
    pub cooldown: Option<u64>,
}

/// Options shared by commands that execute bands.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunOptions {
    /// Write the final report to this file
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Report format
    #[arg(short, long, value_name = "FORMAT")]
    pub format: Option<ExportFormat>,

    /// Checkpoint directory
    #[arg(long, value_name = "DIR")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Run without writing checkpoints
    #[arg(long)]
    pub no_checkpoints: bool,

    /// Apply proposed recovery actions without asking
    #[arg(long)]
    pub auto_recover: bool,

    /// Seed for the synthetic executor
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u64>,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Command::Plan { test } | Command::Simulate { test, .. } = &self.command {
            if test.band_count == Some(0) {
                return Err("Band count must be at least 1".to_string());
            }
            if test.band_duration == Some(0) {
                return Err("Band duration must be at least 1 second".to_string());
            }
            if test.min_workers == Some(0) || test.min_connections == Some(0) {
                return Err("Worker and connection counts must be at least 1".to_string());
            }
        }

        if let Command::Simulate { run, .. } | Command::Resume { run, .. } = &self.command {
            if run.no_checkpoints && run.checkpoint_dir.is_some() {
                return Err("Cannot use both --no-checkpoints and --checkpoint-dir".to_string());
            }
        }

        Ok(())
    }

    /// Test overrides carried by the active subcommand, if any.
    pub fn test_overrides(&self) -> Option<&TestOverrides> {
        match &self.command {
            Command::Plan { test } | Command::Simulate { test, .. } => Some(test),
            _ => None,
        }
    }

    /// Run options carried by the active subcommand, if any.
    pub fn run_options(&self) -> Option<&RunOptions> {
        match &self.command {
            Command::Simulate { run, .. } | Command::Resume { run, .. } => Some(run),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_simulate_overrides() {
        let args = parse(&[
            "bandscale",
            "simulate",
            "--strategy",
            "fibonacci",
            "--bands",
            "5",
            "--max-connections",
            "80",
            "--format",
            "csv",
        ]);
        let test = args.test_overrides().unwrap();
        assert_eq!(test.strategy, Some(Strategy::Fibonacci));
        assert_eq!(test.band_count, Some(5));
        assert_eq!(test.max_connections, Some(80));
        assert_eq!(args.run_options().unwrap().format, Some(ExportFormat::Csv));
    }

    #[test]
    fn test_parse_resume_action() {
        let args = parse(&["bandscale", "resume", "3f2a", "--action", "reduce-load"]);
        match args.command {
            Command::Resume {
                checkpoint, action, ..
            } => {
                assert_eq!(checkpoint, "3f2a");
                assert_eq!(action, Some(RecoveryAction::ReduceLoad));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_export_defaults_to_latest_json() {
        let args = parse(&["bandscale", "export"]);
        match args.command {
            Command::Export {
                checkpoint, format, ..
            } => {
                assert_eq!(checkpoint, "latest");
                assert_eq!(format, ExportFormat::Json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_validation_conflicting_options() {
        let args = parse(&["bandscale", "--verbose", "--quiet", "checkpoints"]);
        assert!(args.validate().is_err());

        let args = parse(&["bandscale", "simulate", "--bands", "0"]);
        assert!(args.validate().is_err());

        let args = parse(&[
            "bandscale",
            "simulate",
            "--no-checkpoints",
            "--checkpoint-dir",
            "ckpt",
        ]);
        assert!(args.validate().is_err());
    }
}
