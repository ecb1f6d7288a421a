//! Deterministic synthetic executor.
//!
//! Models a system whose throughput follows the Universal Scalability Law,
//! `X(n) = λn / (1 + σ(n-1) + κn(n-1))`, with latency from Little's law.
//! Samples are generated on a virtual clock, so a band completes as fast as
//! the consumer can read it. Used by the test-suite and by `simulate`.

use super::{
    BandExecutor, BandRequest, OperationSample, SampleEvent, SampleStream, ThroughputSnapshot,
};
use crate::cancel::CancelSignal;
use crate::error::ExecutorError;
use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Parameters of the simulated system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticModel {
    /// Throughput of a single connection (λ), ops/sec.
    pub per_connection_tps: f64,
    /// Contention coefficient (σ).
    pub contention: f64,
    /// Coherency coefficient (κ).
    pub coherency: f64,
    /// Failure probability at any load.
    pub base_error_ratio: f64,
    /// Extra failure probability per multiple of the peak concurrency exceeded.
    pub overload_error_ratio: f64,
    /// Cadence of throughput snapshots.
    pub snapshot_interval: Duration,
    /// Relative jitter applied to snapshots.
    pub noise: f64,
    /// RNG seed; band index is mixed in.
    pub seed: u64,
}

impl Default for SyntheticModel {
    fn default() -> Self {
        Self {
            per_connection_tps: 800.0,
            contention: 0.03,
            coherency: 0.0005,
            base_error_ratio: 0.001,
            overload_error_ratio: 0.02,
            snapshot_interval: Duration::from_secs(5),
            noise: 0.05,
            seed: 42,
        }
    }
}

impl SyntheticModel {
    /// Throughput at `n` concurrent operations.
    pub fn throughput(&self, n: f64) -> f64 {
        let n = n.max(1.0);
        self.per_connection_tps * n
            / (1.0 + self.contention * (n - 1.0) + self.coherency * n * (n - 1.0))
    }

    /// Mean latency at `n` concurrent operations, in seconds.
    pub fn mean_latency(&self, n: f64) -> f64 {
        let n = n.max(1.0);
        n / self.throughput(n)
    }

    /// Concurrency at which throughput peaks.
    pub fn peak_concurrency(&self) -> f64 {
        if self.coherency > 0.0 {
            ((1.0 - self.contention) / self.coherency).sqrt()
        } else {
            f64::INFINITY
        }
    }

    fn error_probability(&self, n: f64) -> f64 {
        let peak = self.peak_concurrency();
        let overload = if peak.is_finite() && n > peak {
            (n - peak) / peak
        } else {
            0.0
        };
        (self.base_error_ratio + self.overload_error_ratio * overload).clamp(0.0, 0.95)
    }
}

/// Fault to inject on a specific `run_band` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// `run_band` itself returns an error.
    RefuseToStart,
    /// The stream yields an error halfway through the run phase.
    FailMidBand,
    /// The stream ends without yielding anything.
    NoSamples,
    /// The stream stops yielding halfway through the run phase and never ends.
    StallMidBand,
    /// The stream ends cleanly halfway through the run phase.
    EndMidBand,
}

/// Executor backed by a [`SyntheticModel`].
#[derive(Debug, Default)]
pub struct SyntheticExecutor {
    model: SyntheticModel,
    faults: Vec<(usize, FaultMode)>,
    calls: AtomicUsize,
}

impl SyntheticExecutor {
    pub fn new(model: SyntheticModel) -> Self {
        Self {
            model,
            faults: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Inject `mode` on the `call`-th invocation (0-based).
    pub fn with_fault(mut self, call: usize, mode: FaultMode) -> Self {
        self.faults.push((call, mode));
        self
    }

    /// Number of `run_band` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn model(&self) -> &SyntheticModel {
        &self.model
    }

    fn fault_for(&self, call: usize) -> Option<FaultMode> {
        self.faults
            .iter()
            .find(|(at, _)| *at == call)
            .map(|(_, mode)| *mode)
    }
}

impl BandExecutor for SyntheticExecutor {
    fn run_band(
        &self,
        request: &BandRequest,
        cancel: CancelSignal,
    ) -> Result<SampleStream, ExecutorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.fault_for(call);
        let plan = request.plan;

        debug!("Synthetic run of {} (call {}, fault {:?})", plan, call, fault);

        match fault {
            Some(FaultMode::RefuseToStart) => {
                return Err(ExecutorError::new(format!(
                    "synthetic executor refused to start {}",
                    plan
                )));
            }
            Some(FaultMode::NoSamples) => return Ok(stream::empty().boxed()),
            _ => {}
        }

        let concurrency = plan.workers.min(plan.connections) as f64;
        let throughput = self.model.throughput(concurrency);
        let midpoint = request.warmup.as_secs_f64() + request.duration.as_secs_f64() / 2.0;

        let seed = self.model.seed ^ (plan.index as u64).wrapping_mul(0x9E37_79B9);

        let band = SyntheticBand {
            rng: StdRng::seed_from_u64(seed),
            cancel,
            throughput,
            mean_latency: self.model.mean_latency(concurrency),
            error_probability: self.model.error_probability(concurrency),
            noise: self.model.noise,
            op_interval: 1.0 / throughput.max(f64::MIN_POSITIVE),
            next_op_at: 0.0,
            snapshot_interval: self.model.snapshot_interval.as_secs_f64().max(1e-3),
            next_snapshot_at: self.model.snapshot_interval.as_secs_f64().max(1e-3),
            end: request.wall_time().as_secs_f64(),
            cutoff: match fault {
                Some(FaultMode::FailMidBand) => Some((midpoint, true)),
                Some(FaultMode::StallMidBand | FaultMode::EndMidBand) => Some((midpoint, false)),
                _ => None,
            },
            done: false,
        };

        if fault == Some(FaultMode::StallMidBand) {
            Ok(stream::iter(band).chain(stream::pending()).boxed())
        } else {
            Ok(stream::iter(band).boxed())
        }
    }
}

/// Lazily generated, time-ordered sample sequence for one band.
struct SyntheticBand {
    rng: StdRng,
    cancel: CancelSignal,
    throughput: f64,
    mean_latency: f64,
    error_probability: f64,
    noise: f64,
    op_interval: f64,
    next_op_at: f64,
    snapshot_interval: f64,
    next_snapshot_at: f64,
    end: f64,
    /// Offset at which to stop, and whether stopping is a failure.
    cutoff: Option<(f64, bool)>,
    done: bool,
}

impl Iterator for SyntheticBand {
    type Item = Result<SampleEvent, ExecutorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cancel.is_cancelled() {
            return None;
        }

        let next_at = self.next_op_at.min(self.next_snapshot_at);

        if let Some((cutoff, fail)) = self.cutoff {
            if next_at >= cutoff {
                self.done = true;
                return fail.then(|| {
                    Err(ExecutorError::new(format!(
                        "synthetic executor failed at {:.3}s",
                        cutoff
                    )))
                });
            }
        }

        if next_at >= self.end {
            self.done = true;
            return None;
        }

        if self.next_snapshot_at <= self.next_op_at {
            let at = self.next_snapshot_at;
            self.next_snapshot_at += self.snapshot_interval;
            let jitter = 1.0 + self.noise * (self.rng.gen::<f64>() * 2.0 - 1.0);
            return Some(Ok(SampleEvent::Throughput(ThroughputSnapshot {
                at: Duration::from_secs_f64(at),
                ops_per_sec: (self.throughput * jitter).max(0.0),
            })));
        }

        let at = self.next_op_at;
        self.next_op_at += self.op_interval;

        // Exponentially distributed service time around the mean.
        let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let latency = self.mean_latency * -u.ln();
        let success = self.rng.gen::<f64>() >= self.error_probability;

        Some(Ok(SampleEvent::Operation(OperationSample {
            latency: Duration::from_secs_f64(latency),
            success,
            at: Duration::from_secs_f64(at),
        })))
    }
}
