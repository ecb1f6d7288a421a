//! Data models for the scaling engine.
//!
//! This module contains the core value types shared by the planner,
//! aggregator, analysis engine and checkpoint manager.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How the band sequence grows from the minimums to the maximums.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Evenly spaced steps between min and max
    #[default]
    Linear,
    /// Doubling from min, clamped at max
    Exponential,
    /// Fibonacci multiples of min, clamped at max
    Fibonacci,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Linear => write!(f, "linear"),
            Strategy::Exponential => write!(f, "exponential"),
            Strategy::Fibonacci => write!(f, "fibonacci"),
        }
    }
}

/// Immutable description of one progressive scaling test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfiguration {
    /// Band growth strategy.
    pub strategy: Strategy,
    /// Worker count of the first band.
    pub min_workers: u32,
    /// Worker count of the last band.
    pub max_workers: u32,
    /// Connection count of the first band.
    pub min_connections: u32,
    /// Connection count of the last band.
    pub max_connections: u32,
    /// Number of bands to run.
    pub band_count: usize,
    /// Length of the measured run phase of each band.
    pub band_duration: Duration,
    /// Discarded ramp-up before the run phase.
    pub warmup: Duration,
    /// Discarded wind-down after the run phase.
    pub cooldown: Duration,
    /// Maximum latency samples kept per band.
    pub max_latency_samples: usize,
    /// Memory budget for latency samples, in MiB.
    pub memory_limit_mb: usize,
}

impl Default for TestConfiguration {
    fn default() -> Self {
        Self {
            strategy: Strategy::Linear,
            min_workers: 1,
            max_workers: 32,
            min_connections: 1,
            max_connections: 64,
            band_count: 6,
            band_duration: Duration::from_secs(60),
            warmup: Duration::from_secs(10),
            cooldown: Duration::from_secs(5),
            max_latency_samples: 50_000,
            memory_limit_mb: 256,
        }
    }
}

impl TestConfiguration {
    /// Latency samples actually retained per band, honouring both the
    /// explicit cap and the memory budget.
    pub fn effective_latency_cap(&self) -> usize {
        let by_memory =
            self.memory_limit_mb.saturating_mul(1024 * 1024) / std::mem::size_of::<f64>();
        self.max_latency_samples.min(by_memory).max(1)
    }

    /// Wall-clock length of one band including warmup and cooldown.
    pub fn band_wall_time(&self) -> Duration {
        self.warmup + self.band_duration + self.cooldown
    }
}

/// One entry of the precomputed band sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BandPlan {
    /// Position in the sequence (0-based).
    pub index: usize,
    /// Concurrent worker tasks.
    pub workers: u32,
    /// Concurrent connections.
    pub connections: u32,
}

impl fmt::Display for BandPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "band {} ({}w/{}c)",
            self.index + 1,
            self.workers,
            self.connections
        )
    }
}

/// How much of a band's data made it into its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandStatus {
    /// The run phase finished normally
    Complete,
    /// Interrupted; kept for diagnostics only
    Partial,
    /// The executor produced no run-phase operations
    NoDataCollected,
}

impl fmt::Display for BandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandStatus::Complete => write!(f, "complete"),
            BandStatus::Partial => write!(f, "partial"),
            BandStatus::NoDataCollected => write!(f, "no data"),
        }
    }
}

/// Where a band is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandPhase {
    Warmup,
    Execution,
    Cooldown,
    AnalysisUpdate,
}

impl fmt::Display for BandPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandPhase::Warmup => write!(f, "warmup"),
            BandPhase::Execution => write!(f, "execution"),
            BandPhase::Cooldown => write!(f, "cooldown"),
            BandPhase::AnalysisUpdate => write!(f, "analysis update"),
        }
    }
}

/// Two-sided confidence interval around a mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    /// Degenerate interval for a single observation.
    pub fn point(value: f64) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Immutable measurement record for one band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandResult {
    /// Band position in the plan (0-based).
    pub band_index: usize,
    /// Worker count used.
    pub workers: u32,
    /// Connection count used.
    pub connections: u32,
    /// Whether the band ran to completion.
    pub status: BandStatus,
    /// Run-phase length the rates were computed over.
    pub duration: Duration,
    /// Run-phase operations observed.
    pub total_operations: u64,
    /// Run-phase operations that succeeded.
    pub successful_operations: u64,
    /// Run-phase operations that failed.
    pub failed_operations: u64,
    /// Successful operations per second.
    pub total_tps: f64,
    /// Mean latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Median latency in milliseconds.
    pub p50_latency_ms: f64,
    /// 95th percentile latency in milliseconds.
    pub p95_latency_ms: f64,
    /// 99th percentile latency in milliseconds.
    pub p99_latency_ms: f64,
    /// Standard deviation of the throughput snapshots.
    pub tps_stddev: f64,
    /// Coefficient of variation of the throughput snapshots.
    pub coefficient_of_variation: f64,
    /// 95% confidence interval for the mean throughput.
    pub confidence_interval: ConfidenceInterval,
    /// Failed operations per second.
    pub error_rate: f64,
    /// Raw throughput snapshots (ops/sec) used for the variance figures.
    pub tps_samples: Vec<f64>,
    /// Latency samples retained after decimation.
    pub latency_samples_kept: usize,
}

impl BandResult {
    /// Placeholder result for a band whose executor produced nothing.
    pub fn no_data(plan: &BandPlan) -> Self {
        Self {
            band_index: plan.index,
            workers: plan.workers,
            connections: plan.connections,
            status: BandStatus::NoDataCollected,
            duration: Duration::ZERO,
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            total_tps: 0.0,
            avg_latency_ms: 0.0,
            p50_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            p99_latency_ms: 0.0,
            tps_stddev: 0.0,
            coefficient_of_variation: 0.0,
            confidence_interval: ConfidenceInterval::point(0.0),
            error_rate: 0.0,
            tps_samples: Vec::new(),
            latency_samples_kept: 0,
        }
    }

    /// Whether this result may be compared against other bands.
    pub fn is_fair(&self) -> bool {
        self.status == BandStatus::Complete
    }

    pub fn plan(&self) -> BandPlan {
        BandPlan {
            index: self.band_index,
            workers: self.workers,
            connections: self.connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_latency_cap_uses_smaller_bound() {
        let mut config = TestConfiguration {
            max_latency_samples: 10_000,
            memory_limit_mb: 1,
            ..TestConfiguration::default()
        };
        // 1 MiB of f64 holds 131072 samples
        assert_eq!(config.effective_latency_cap(), 10_000);

        config.max_latency_samples = 1_000_000;
        assert_eq!(config.effective_latency_cap(), 131_072);
    }

    #[test]
    fn test_band_wall_time() {
        let config = TestConfiguration {
            band_duration: Duration::from_secs(30),
            warmup: Duration::from_secs(5),
            cooldown: Duration::from_secs(2),
            ..TestConfiguration::default()
        };
        assert_eq!(config.band_wall_time(), Duration::from_secs(37));
    }

    #[test]
    fn test_no_data_result_is_not_fair() {
        let plan = BandPlan {
            index: 3,
            workers: 4,
            connections: 8,
        };
        let result = BandResult::no_data(&plan);
        assert_eq!(result.status, BandStatus::NoDataCollected);
        assert!(!result.is_fair());
        assert_eq!(result.plan(), plan);
    }

    #[test]
    fn test_strategy_serializes_lowercase() {
        let json = serde_json::to_string(&Strategy::Fibonacci).unwrap();
        assert_eq!(json, "\"fibonacci\"");
    }
}
