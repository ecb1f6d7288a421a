//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.bandscale.toml` files.

use anyhow::{Context, Result};
use bandscale::analysis::AnalysisThresholds;
use bandscale::controller::RecoveryPolicy;
use bandscale::models::{Strategy, TestConfiguration};
use bandscale::report::ExportFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::{Args, RunOptions, TestOverrides};

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".bandscale.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Band plan and per-band timing.
    #[serde(default)]
    pub test: TestSection,

    /// Analysis thresholds.
    #[serde(default)]
    pub analysis: AnalysisThresholds,

    /// Checkpoint storage.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Failure recovery.
    #[serde(default)]
    pub recovery: RecoveryPolicy,
}

/// General application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default report path; the report is only printed when unset.
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Default report format.
    #[serde(default)]
    pub format: ExportFormat,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: None,
            format: ExportFormat::Json,
            verbose: false,
        }
    }
}

/// `[test]` section. Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSection {
    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default = "default_min")]
    pub min_workers: u32,

    #[serde(default = "default_max_workers")]
    pub max_workers: u32,

    #[serde(default = "default_min")]
    pub min_connections: u32,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_band_count")]
    pub band_count: usize,

    #[serde(default = "default_band_duration")]
    pub band_duration_secs: u64,

    #[serde(default = "default_warmup")]
    pub warmup_secs: u64,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Latency samples kept per band.
    #[serde(default = "default_max_latency_samples")]
    pub max_latency_samples: usize,

    /// Memory budget for latency samples, in MiB.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: usize,
}

impl Default for TestSection {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            min_workers: default_min(),
            max_workers: default_max_workers(),
            min_connections: default_min(),
            max_connections: default_max_connections(),
            band_count: default_band_count(),
            band_duration_secs: default_band_duration(),
            warmup_secs: default_warmup(),
            cooldown_secs: default_cooldown(),
            max_latency_samples: default_max_latency_samples(),
            memory_limit_mb: default_memory_limit(),
        }
    }
}

fn default_min() -> u32 {
    1
}

fn default_max_workers() -> u32 {
    32
}

fn default_max_connections() -> u32 {
    64
}

fn default_band_count() -> usize {
    6
}

fn default_band_duration() -> u64 {
    60
}

fn default_warmup() -> u64 {
    10
}

fn default_cooldown() -> u64 {
    5
}

fn default_max_latency_samples() -> usize {
    50_000
}

fn default_memory_limit() -> usize {
    256
}

impl TestSection {
    /// The engine-side test configuration.
    pub fn to_configuration(&self) -> TestConfiguration {
        TestConfiguration {
            strategy: self.strategy,
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            band_count: self.band_count,
            band_duration: Duration::from_secs(self.band_duration_secs),
            warmup: Duration::from_secs(self.warmup_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            max_latency_samples: self.max_latency_samples,
            memory_limit_mb: self.memory_limit_mb,
        }
    }

    fn apply(&mut self, overrides: &TestOverrides) {
        if let Some(strategy) = overrides.strategy {
            self.strategy = strategy;
        }
        if let Some(n) = overrides.min_workers {
            self.min_workers = n;
        }
        if let Some(n) = overrides.max_workers {
            self.max_workers = n;
        }
        if let Some(n) = overrides.min_connections {
            self.min_connections = n;
        }
        if let Some(n) = overrides.max_connections {
            self.max_connections = n;
        }
        if let Some(n) = overrides.band_count {
            self.band_count = n;
        }
        if let Some(secs) = overrides.band_duration {
            self.band_duration_secs = secs;
        }
        if let Some(secs) = overrides.warmup {
            self.warmup_secs = secs;
        }
        if let Some(secs) = overrides.cooldown {
            self.cooldown_secs = secs;
        }
    }
}

/// Checkpoint storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Write checkpoints at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding checkpoint files.
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,

    /// Checkpoint files kept; older ones are pruned.
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// Background refresh period in seconds; 0 disables it.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_checkpoint_dir(),
            retention: default_retention(),
            interval_secs: default_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".bandscale/checkpoints")
}

fn default_retention() -> usize {
    10
}

fn default_interval() -> u64 {
    30
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// where the CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &Args) {
        if args.verbose {
            self.general.verbose = true;
        }
        if let Some(test) = args.test_overrides() {
            self.test.apply(test);
        }
        if let Some(run) = args.run_options() {
            self.apply_run_options(run);
        }
    }

    /// Log level after merging: `--quiet` wins, then `verbose` from either
    /// the file or `--verbose`.
    pub fn log_level(&self, quiet: bool) -> tracing::Level {
        if quiet {
            tracing::Level::ERROR
        } else if self.general.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    fn apply_run_options(&mut self, run: &RunOptions) {
        if let Some(ref output) = run.output {
            self.general.output = Some(output.clone());
        }
        if let Some(format) = run.format {
            self.general.format = format;
        }
        if let Some(ref dir) = run.checkpoint_dir {
            self.checkpoint.directory = dir.clone();
        }
        if run.no_checkpoints {
            self.checkpoint.enabled = false;
        }
        if run.auto_recover {
            self.recovery.auto_recover = true;
        }
    }

    /// Background checkpoint period.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint.interval_secs)
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Config::default()).context("Failed to serialize default config")
    }
}
