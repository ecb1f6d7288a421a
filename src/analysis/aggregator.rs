//! Band metrics aggregation.
//!
//! This module reduces the raw sample stream of one band into a single
//! immutable [`BandResult`]. Samples are folded in as they arrive so a
//! long band never holds more than the configured number of latencies.

use crate::error::{EngineError, ErrorContext, Result};
use crate::executor::SampleEvent;
use crate::models::{
    BandPhase, BandPlan, BandResult, BandStatus, ConfidenceInterval, TestConfiguration,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::debug;

/// z-score for a two-sided 95% interval.
const Z_95: f64 = 1.96;

/// How the band ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The stream ended on its own. Rates cover the full run phase unless
    /// the samples stop short of its end.
    Full,
    /// Interrupted; rates use the observed run-phase span.
    Partial,
}

/// Incremental aggregator for one band.
#[derive(Debug)]
pub struct BandAggregator {
    plan: BandPlan,
    warmup: Duration,
    duration: Duration,
    latency_cap: usize,
    /// Reservoir of successful-operation latencies, in ms.
    latencies_ms: Vec<f64>,
    latencies_seen: u64,
    latency_sum_ms: f64,
    successful: u64,
    failed: u64,
    discarded: u64,
    snapshots: Vec<f64>,
    last_run_at: Option<Duration>,
    /// Latest offset of any event, whatever its phase.
    last_event_at: Option<Duration>,
    rng: StdRng,
}

impl BandAggregator {
    pub fn new(plan: BandPlan, config: &TestConfiguration) -> Self {
        Self {
            plan,
            warmup: config.warmup,
            duration: config.band_duration,
            latency_cap: config.effective_latency_cap(),
            latencies_ms: Vec::new(),
            latencies_seen: 0,
            latency_sum_ms: 0.0,
            successful: 0,
            failed: 0,
            discarded: 0,
            snapshots: Vec::new(),
            last_run_at: None,
            last_event_at: None,
            rng: StdRng::seed_from_u64(plan.index as u64),
        }
    }

    /// Phase a band-relative offset falls into.
    pub fn phase_at(&self, at: Duration) -> BandPhase {
        if at < self.warmup {
            BandPhase::Warmup
        } else if at < self.warmup + self.duration {
            BandPhase::Execution
        } else {
            BandPhase::Cooldown
        }
    }

    /// Fold one event in. Returns the phase it belonged to.
    pub fn record(&mut self, event: &SampleEvent) -> BandPhase {
        self.last_event_at = Some(self.last_event_at.map_or(event.at(), |t| t.max(event.at())));
        let phase = self.phase_at(event.at());
        if phase != BandPhase::Execution {
            self.discarded += 1;
            return phase;
        }

        self.last_run_at = Some(self.last_run_at.map_or(event.at(), |t| t.max(event.at())));

        match event {
            SampleEvent::Operation(op) if op.success => {
                self.successful += 1;
                self.push_latency(op.latency.as_secs_f64() * 1000.0);
            }
            SampleEvent::Operation(_) => self.failed += 1,
            SampleEvent::Throughput(snapshot) => {
                if snapshot.ops_per_sec.is_finite() {
                    self.snapshots.push(snapshot.ops_per_sec);
                }
            }
        }
        phase
    }

    /// Run-phase operations seen so far.
    pub fn operations(&self) -> u64 {
        self.successful + self.failed
    }

    /// Warmup and cooldown events dropped so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Whether the samples stop short of the end of the run phase.
    ///
    /// Events in the last twentieth of the run phase, or within two average
    /// operation gaps of its end, count as reaching it.
    pub fn ended_early(&self) -> bool {
        let run_end = self.warmup + self.duration;
        let Some(last) = self.last_event_at else {
            return true;
        };
        if last >= run_end {
            return false;
        }
        let observed = self.observed_run().as_secs_f64();
        let spacing = observed / self.operations().max(1) as f64;
        let slack = (self.duration.as_secs_f64() / 20.0).max(2.0 * spacing);
        (run_end - last).as_secs_f64() > slack
    }

    fn observed_run(&self) -> Duration {
        self.last_run_at
            .map(|t| t.saturating_sub(self.warmup))
            .unwrap_or_default()
    }

    fn push_latency(&mut self, value_ms: f64) {
        self.latencies_seen += 1;
        self.latency_sum_ms += value_ms;

        if self.latencies_ms.len() < self.latency_cap {
            self.latencies_ms.push(value_ms);
        } else {
            // Algorithm R: keep each of the n seen values with probability cap/n.
            let slot = self.rng.gen_range(0..self.latencies_seen);
            if (slot as usize) < self.latency_cap {
                self.latencies_ms[slot as usize] = value_ms;
            }
        }
    }

    /// Produce the band's result.
    pub fn finish(mut self, completion: Completion) -> Result<BandResult> {
        let total = self.operations();
        if total == 0 {
            return Err(EngineError::NoDataCollected {
                context: ErrorContext::for_band(&self.plan),
            });
        }

        let completion = match completion {
            Completion::Full if self.ended_early() => {
                debug!(
                    "{} samples stop {:?} into a {:?} run phase",
                    self.plan,
                    self.observed_run(),
                    self.duration
                );
                Completion::Partial
            }
            other => other,
        };

        let run_duration = match completion {
            Completion::Full => self.duration,
            Completion::Partial => self
                .observed_run()
                .clamp(Duration::from_millis(1), self.duration),
        };
        let secs = run_duration.as_secs_f64();

        let total_tps = self.successful as f64 / secs;
        let error_rate = self.failed as f64 / secs;

        self.latencies_ms.sort_by(|a, b| a.total_cmp(b));
        let avg_latency_ms = if self.latencies_seen > 0 {
            self.latency_sum_ms / self.latencies_seen as f64
        } else {
            0.0
        };

        let spread = ThroughputSpread::from_snapshots(&self.snapshots, total_tps);

        Ok(BandResult {
            band_index: self.plan.index,
            workers: self.plan.workers,
            connections: self.plan.connections,
            status: match completion {
                Completion::Full => BandStatus::Complete,
                Completion::Partial => BandStatus::Partial,
            },
            duration: run_duration,
            total_operations: total,
            successful_operations: self.successful,
            failed_operations: self.failed,
            total_tps,
            avg_latency_ms,
            p50_latency_ms: percentile(&self.latencies_ms, 50.0),
            p95_latency_ms: percentile(&self.latencies_ms, 95.0),
            p99_latency_ms: percentile(&self.latencies_ms, 99.0),
            tps_stddev: spread.stddev,
            coefficient_of_variation: spread.cv,
            confidence_interval: spread.interval,
            error_rate,
            tps_samples: self.snapshots,
            latency_samples_kept: self.latencies_ms.len(),
        })
    }
}

/// Aggregate a complete, already collected set of events.
pub fn aggregate_band<'a>(
    plan: BandPlan,
    config: &TestConfiguration,
    events: impl IntoIterator<Item = &'a SampleEvent>,
    completion: Completion,
) -> Result<BandResult> {
    let mut aggregator = BandAggregator::new(plan, config);
    for event in events {
        aggregator.record(event);
    }
    aggregator.finish(completion)
}

/// Variability of the periodic throughput snapshots.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ThroughputSpread {
    stddev: f64,
    cv: f64,
    interval: ConfidenceInterval,
}

impl ThroughputSpread {
    /// With no snapshots the overall throughput stands in as a single point.
    fn from_snapshots(samples: &[f64], fallback: f64) -> Self {
        let n = samples.len();
        if n <= 1 {
            let value = samples.first().copied().unwrap_or(fallback);
            return Self {
                stddev: 0.0,
                cv: 0.0,
                interval: ConfidenceInterval::point(value),
            };
        }

        let mean = mean(samples);
        let variance =
            samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        let stddev = variance.sqrt();
        let margin = Z_95 * stddev / (n as f64).sqrt();

        Self {
            stddev,
            cv: if mean > 0.0 { stddev / mean } else { 0.0 },
            interval: ConfidenceInterval {
                lower: mean - margin,
                upper: mean + margin,
            },
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{OperationSample, ThroughputSnapshot};

    fn config() -> TestConfiguration {
        TestConfiguration {
            band_duration: Duration::from_secs(10),
            warmup: Duration::from_secs(2),
            cooldown: Duration::from_secs(1),
            max_latency_samples: 1_000,
            ..TestConfiguration::default()
        }
    }

    fn plan() -> BandPlan {
        BandPlan {
            index: 0,
            workers: 4,
            connections: 8,
        }
    }

    fn op(at_ms: u64, latency_ms: u64, success: bool) -> SampleEvent {
        SampleEvent::Operation(OperationSample {
            latency: Duration::from_millis(latency_ms),
            success,
            at: Duration::from_millis(at_ms),
        })
    }

    fn snapshot(at_ms: u64, ops_per_sec: f64) -> SampleEvent {
        SampleEvent::Throughput(ThroughputSnapshot {
            at: Duration::from_millis(at_ms),
            ops_per_sec,
        })
    }

    #[test]
    fn test_warmup_and_cooldown_samples_are_discarded() {
        let events = vec![
            op(500, 100, true),    // warmup
            op(2_000, 10, true),   // first run-phase instant
            op(5_000, 20, true),
            op(6_000, 30, false),
            op(11_999, 40, true),
            op(12_000, 500, true), // cooldown
        ];

        let mut aggregator = BandAggregator::new(plan(), &config());
        for event in &events {
            aggregator.record(event);
        }
        assert_eq!(aggregator.discarded(), 2);
        assert_eq!(aggregator.operations(), 4);

        let result = aggregator.finish(Completion::Full).unwrap();
        assert_eq!(result.status, BandStatus::Complete);
        assert_eq!(result.successful_operations, 3);
        assert_eq!(result.failed_operations, 1);
        assert!((result.total_tps - 0.3).abs() < 1e-9);
        assert!((result.error_rate - 0.1).abs() < 1e-9);
        assert!((result.avg_latency_ms - 70.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.p50_latency_ms, 20.0);
        assert_eq!(result.p99_latency_ms, 40.0);
    }

    #[test]
    fn test_variance_comes_from_snapshots() {
        let events = vec![
            op(3_000, 5, true),
            snapshot(4_000, 90.0),
            snapshot(6_000, 100.0),
            snapshot(8_000, 110.0),
            snapshot(10_000, 100.0),
        ];
        let result = aggregate_band(plan(), &config(), &events, Completion::Full).unwrap();

        assert_eq!(result.tps_samples, vec![90.0, 100.0, 110.0, 100.0]);
        let expected_sd = (200.0f64 / 3.0).sqrt();
        assert!((result.tps_stddev - expected_sd).abs() < 1e-9);
        assert!((result.coefficient_of_variation - expected_sd / 100.0).abs() < 1e-9);

        let margin = 1.96 * expected_sd / 2.0;
        assert!((result.confidence_interval.lower - (100.0 - margin)).abs() < 1e-9);
        assert!((result.confidence_interval.upper - (100.0 + margin)).abs() < 1e-9);
    }

    #[test]
    fn test_single_snapshot_collapses_interval() {
        let events = vec![op(3_000, 5, true), snapshot(4_000, 42.0), op(12_100, 5, true)];
        let result = aggregate_band(plan(), &config(), &events, Completion::Full).unwrap();
        assert_eq!(result.confidence_interval, ConfidenceInterval::point(42.0));
        assert_eq!(result.tps_stddev, 0.0);
    }

    #[test]
    fn test_zero_samples_is_no_data() {
        let events = vec![op(100, 5, true), snapshot(3_000, 10.0)];
        let err = aggregate_band(plan(), &config(), &events, Completion::Full).unwrap_err();
        assert!(matches!(err, EngineError::NoDataCollected { .. }));
        assert_eq!(err.context().unwrap().connections, 8);
    }

    #[test]
    fn test_partial_band_uses_observed_span() {
        let events = vec![op(2_500, 5, true), op(4_000, 5, true), op(7_000, 5, true)];
        let result = aggregate_band(plan(), &config(), &events, Completion::Partial).unwrap();
        assert_eq!(result.status, BandStatus::Partial);
        assert_eq!(result.duration, Duration::from_secs(5));
        assert!((result.total_tps - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_stream_ending_early_is_partial() {
        let events: Vec<SampleEvent> = (0..=40).map(|i| op(2_000 + i * 100, 5, true)).collect();
        let result = aggregate_band(plan(), &config(), &events, Completion::Full).unwrap();

        assert_eq!(result.status, BandStatus::Partial);
        assert_eq!(result.duration, Duration::from_secs(4));
        assert!((result.total_tps - 41.0 / 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_stream_reaching_run_end_is_complete() {
        // no cooldown samples, last operation just short of the 12s run end
        let events: Vec<SampleEvent> = (0..=98).map(|i| op(2_000 + i * 100, 5, true)).collect();
        let mut aggregator = BandAggregator::new(plan(), &config());
        for event in &events {
            aggregator.record(event);
        }
        assert!(!aggregator.ended_early());

        let result = aggregator.finish(Completion::Full).unwrap();
        assert_eq!(result.status, BandStatus::Complete);
        assert_eq!(result.duration, Duration::from_secs(10));
    }

    #[test]
    fn test_latency_reservoir_is_capped() {
        let config = TestConfiguration {
            max_latency_samples: 100,
            ..config()
        };
        let events: Vec<SampleEvent> = (0..5_000)
            .map(|i| op(2_000 + i, 1 + i % 50, true))
            .chain(std::iter::once(op(12_000, 1, true)))
            .collect();
        let result = aggregate_band(plan(), &config, &events, Completion::Full).unwrap();

        assert_eq!(result.latency_samples_kept, 100);
        assert_eq!(result.successful_operations, 5_000);
        // The mean is exact even though percentiles come from the reservoir.
        assert!((result.avg_latency_ms - 25.5).abs() < 1e-9);
        assert!(result.p50_latency_ms >= 1.0 && result.p50_latency_ms <= 50.0);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&sorted, 50.0), 5.0);
        assert_eq!(percentile(&sorted, 95.0), 10.0);
        assert_eq!(percentile(&sorted, 10.0), 1.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
