//! Band executor interface.
//!
//! The engine never issues requests itself. A [`BandExecutor`] runs one band
//! at a fixed concurrency and reports what happened as a stream of
//! [`SampleEvent`]s; the engine only consumes that stream.

pub mod synthetic;

pub use synthetic::{FaultMode, SyntheticExecutor, SyntheticModel};

use crate::cancel::CancelSignal;
use crate::error::ExecutorError;
use crate::models::{BandPlan, TestConfiguration};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationSample {
    /// Time the operation took.
    pub latency: Duration,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Completion offset from the start of the band.
    pub at: Duration,
}

/// Periodic aggregate throughput reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSnapshot {
    /// Offset from the start of the band.
    pub at: Duration,
    /// Instantaneous operations per second.
    pub ops_per_sec: f64,
}

/// One item of an executor's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SampleEvent {
    Operation(OperationSample),
    Throughput(ThroughputSnapshot),
}

impl SampleEvent {
    /// Offset from the start of the band.
    pub fn at(&self) -> Duration {
        match self {
            SampleEvent::Operation(op) => op.at,
            SampleEvent::Throughput(snapshot) => snapshot.at,
        }
    }
}

/// Everything an executor needs to run one band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandRequest {
    pub plan: BandPlan,
    pub duration: Duration,
    pub warmup: Duration,
    pub cooldown: Duration,
}

impl BandRequest {
    pub fn new(plan: BandPlan, config: &TestConfiguration) -> Self {
        Self {
            plan,
            duration: config.band_duration,
            warmup: config.warmup,
            cooldown: config.cooldown,
        }
    }

    /// Total time the band occupies, warmup and cooldown included.
    pub fn wall_time(&self) -> Duration {
        self.warmup + self.duration + self.cooldown
    }
}

/// Samples produced by a running band. Internal executor failures are
/// reported as `Err` items rather than panics.
pub type SampleStream = BoxStream<'static, Result<SampleEvent, ExecutorError>>;

/// Capability to run one band of the workload.
///
/// Implementations must stop producing samples shortly after `cancel`
/// fires, within roughly one operation's latency.
pub trait BandExecutor: Send + Sync {
    fn run_band(
        &self,
        request: &BandRequest,
        cancel: CancelSignal,
    ) -> Result<SampleStream, ExecutorError>;
}

impl<E: BandExecutor + ?Sized> BandExecutor for Arc<E> {
    fn run_band(
        &self,
        request: &BandRequest,
        cancel: CancelSignal,
    ) -> Result<SampleStream, ExecutorError> {
        (**self).run_band(request, cancel)
    }
}
