//! Checkpoint documents and their on-disk store.
//!
//! A checkpoint is a self-contained JSON snapshot of a run: the test
//! configuration and plan, every committed band result, the execution
//! state, and recovery advice when the run failed. Restoring one is enough
//! to resume the run or to export its results.

mod store;

pub use store::{CheckpointManager, CheckpointSummary, RetryPolicy};

use crate::error::{ErrorKind, ErrorRecord};
use crate::models::{BandPhase, BandPlan, BandResult, TestConfiguration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Version of the checkpoint file layout.
pub const FORMAT_VERSION: u32 = 1;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether the run has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Identity and configuration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMetadata {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Executor name as reported by the caller.
    pub executor: String,
    /// Version of the engine that started the run.
    pub engine_version: String,
    pub configuration: TestConfiguration,
    pub plan: Vec<BandPlan>,
}

impl TestMetadata {
    pub fn new(
        executor: impl Into<String>,
        configuration: TestConfiguration,
        plan: Vec<BandPlan>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            executor: executor.into(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            configuration,
            plan,
        }
    }
}

/// The band that was in flight when the checkpoint was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentBandState {
    pub plan: BandPlan,
    pub phase: BandPhase,
    pub started_at: DateTime<Utc>,
    /// Operations observed so far, all phases included.
    pub operations_seen: u64,
}

/// Mutable progress of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: RunStatus,
    pub current_band: Option<CurrentBandState>,
    /// Plan position: bands before this index are done.
    pub next_band: usize,
    pub total_bands: usize,
    pub errors: Vec<ErrorRecord>,
    /// Recovery actions applied so far in this run.
    pub recovery_attempts: u32,
    /// Cleared when a checkpoint could not be persisted.
    pub resumable: bool,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(total_bands: usize) -> Self {
        Self {
            status: RunStatus::Idle,
            current_band: None,
            next_band: 0,
            total_bands,
            errors: Vec::new(),
            recovery_attempts: 0,
            resumable: true,
            updated_at: Utc::now(),
        }
    }

    /// Fraction of the plan completed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_bands == 0 {
            1.0
        } else {
            (self.next_band as f64 / self.total_bands as f64).min(1.0)
        }
    }
}

/// What to do with the band that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Skip the failed band and carry on with the next one.
    Continue,
    /// Run the failed band again unchanged.
    RetryBand,
    /// Run the failed band again with half the workers and connections.
    ReduceLoad,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryAction::Continue => write!(f, "continue"),
            RecoveryAction::RetryBand => write!(f, "retry_band"),
            RecoveryAction::ReduceLoad => write!(f, "reduce_load"),
        }
    }
}

impl std::str::FromStr for RecoveryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "continue" => Ok(Self::Continue),
            "retry_band" | "retry" => Ok(Self::RetryBand),
            "reduce_load" | "reduce" => Ok(Self::ReduceLoad),
            other => Err(format!(
                "unknown recovery action '{}'; expected continue, retry_band or reduce_load",
                other
            )),
        }
    }
}

/// Recovery advice stored with a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub failed_band: BandPlan,
    pub error: ErrorRecord,
    /// False when the failure cannot be fixed by re-running bands.
    pub can_recover: bool,
    pub proposed: RecoveryAction,
    /// Every action that makes sense for this failure.
    pub candidates: Vec<RecoveryAction>,
    /// Band to run if `ReduceLoad` is chosen.
    pub reduced_band: BandPlan,
    /// Consecutive failures of this band so far.
    pub failures: u32,
}

impl RecoveryInfo {
    /// Propose an action: retry a first failure, reduce load on a repeat,
    /// and move on once the band cannot be shrunk any further.
    pub fn propose(failed_band: BandPlan, error: ErrorRecord, failures: u32) -> Self {
        let reduced_band = reduce_load(&failed_band);
        let proposed = if failures <= 1 {
            RecoveryAction::RetryBand
        } else if reduced_band != failed_band {
            RecoveryAction::ReduceLoad
        } else {
            RecoveryAction::Continue
        };
        let mut candidates = vec![RecoveryAction::RetryBand];
        if reduced_band != failed_band {
            candidates.push(RecoveryAction::ReduceLoad);
        }
        candidates.push(RecoveryAction::Continue);
        Self {
            failed_band,
            can_recover: error.kind != ErrorKind::Configuration,
            error,
            proposed,
            candidates,
            reduced_band,
            failures,
        }
    }
}

/// Halve workers and connections, never below one.
pub fn reduce_load(plan: &BandPlan) -> BandPlan {
    BandPlan {
        index: plan.index,
        workers: (plan.workers / 2).max(1),
        connections: (plan.connections / 2).max(1),
    }
}

/// Everything needed to resume or report on a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub metadata: TestMetadata,
    /// Committed results in plan order, including no-data bands.
    pub results: Vec<BandResult>,
    /// Results of interrupted bands; never compared against complete ones.
    pub partial_results: Vec<BandResult>,
    pub execution: ExecutionState,
    pub recovery: Option<RecoveryInfo>,
}

impl CheckpointState {
    pub fn new(metadata: TestMetadata) -> Self {
        let total = metadata.plan.len();
        Self {
            metadata,
            results: Vec::new(),
            partial_results: Vec::new(),
            execution: ExecutionState::new(total),
            recovery: None,
        }
    }

    /// Bands still to run, in order.
    pub fn remaining_bands(&self) -> &[BandPlan] {
        let next = self.execution.next_band.min(self.metadata.plan.len());
        &self.metadata.plan[next..]
    }
}

/// A persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Monotonic per-directory sequence number.
    pub sequence: u64,
    pub format_version: u32,
    /// Bands not yet committed when the checkpoint was taken.
    pub remaining_bands: Vec<BandPlan>,
    #[serde(flatten)]
    pub state: CheckpointState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn plan(index: usize, workers: u32, connections: u32) -> BandPlan {
        BandPlan {
            index,
            workers,
            connections,
        }
    }

    #[test]
    fn test_recovery_proposal_escalates() {
        let failed = plan(2, 8, 16);
        let record = EngineError::executor(&failed, "timeout").record();

        let first = RecoveryInfo::propose(failed, record.clone(), 1);
        assert_eq!(first.proposed, RecoveryAction::RetryBand);
        assert_eq!(first.reduced_band, plan(2, 4, 8));
        assert!(first.can_recover);
        assert_eq!(
            first.candidates,
            vec![
                RecoveryAction::RetryBand,
                RecoveryAction::ReduceLoad,
                RecoveryAction::Continue
            ]
        );

        let second = RecoveryInfo::propose(failed, record.clone(), 2);
        assert_eq!(second.proposed, RecoveryAction::ReduceLoad);

        let tiny = plan(0, 1, 1);
        let third = RecoveryInfo::propose(tiny, record, 3);
        assert_eq!(third.proposed, RecoveryAction::Continue);
        assert!(!third.candidates.contains(&RecoveryAction::ReduceLoad));
    }

    #[test]
    fn test_reduce_load_keeps_at_least_one() {
        assert_eq!(reduce_load(&plan(0, 1, 3)), plan(0, 1, 1));
        assert_eq!(reduce_load(&plan(4, 9, 20)), plan(4, 4, 10));
    }

    #[test]
    fn test_recovery_action_parses_cli_spellings() {
        assert_eq!("retry-band".parse::<RecoveryAction>(), Ok(RecoveryAction::RetryBand));
        assert_eq!("REDUCE_LOAD".parse::<RecoveryAction>(), Ok(RecoveryAction::ReduceLoad));
        assert!("rollback".parse::<RecoveryAction>().is_err());
    }

    #[test]
    fn test_remaining_bands_and_progress() {
        let metadata = TestMetadata::new(
            "synthetic",
            TestConfiguration::default(),
            vec![plan(0, 1, 1), plan(1, 2, 2), plan(2, 4, 4)],
        );
        let mut state = CheckpointState::new(metadata);
        assert_eq!(state.remaining_bands().len(), 3);
        assert_eq!(state.execution.progress(), 0.0);

        state.execution.next_band = 2;
        assert_eq!(state.remaining_bands(), &[plan(2, 4, 4)]);
        assert!((state.execution.progress() - 2.0 / 3.0).abs() < 1e-12);
    }
}
