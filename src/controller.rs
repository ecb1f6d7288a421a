//! Execution controller.
//!
//! This module drives a [`BandExecutor`] through the planned bands one at a
//! time, aggregates each band, refreshes the analysis, notifies observers
//! and keeps checkpoints current. A background task refreshes the
//! checkpoint on a fixed interval while a band is running.

use crate::analysis::{AnalysisEngine, AnalysisResult, BandAggregator, Completion};
use crate::cancel::CancelSignal;
use crate::checkpoint::{
    Checkpoint, CheckpointManager, CheckpointState, CurrentBandState, RecoveryAction,
    RecoveryInfo, RetryPolicy, RunStatus, TestMetadata,
};
use crate::error::{EngineError, Result};
use crate::executor::{BandExecutor, BandRequest};
use crate::models::{BandPhase, BandPlan, BandResult, BandStatus, TestConfiguration};
use crate::planner;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives progress notifications. Every method defaults to a no-op.
pub trait ProgressObserver: Send + Sync {
    fn on_run_started(&self, _metadata: &TestMetadata) {}
    fn on_band_started(&self, _plan: &BandPlan, _request: &BandRequest) {}
    fn on_phase_changed(&self, _plan: &BandPlan, _phase: BandPhase) {}
    fn on_band_completed(&self, _result: &BandResult, _analysis: Option<&AnalysisResult>) {}
    fn on_checkpoint(&self, _checkpoint: &Checkpoint) {}
    fn on_run_finished(&self, _outcome: &RunOutcome) {}
}

/// Observers registered with one controller.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl ObserverRegistry {
    pub fn register(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    fn each(&self, f: impl Fn(&dyn ProgressObserver)) {
        for observer in &self.observers {
            f(observer.as_ref());
        }
    }
}

/// Whether failed bands are recovered without operator input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Apply the proposed recovery action automatically.
    #[serde(default)]
    pub auto_recover: bool,

    /// Upper bound on automatic recoveries per run.
    #[serde(default = "default_max_auto_recoveries")]
    pub max_auto_recoveries: u32,
}

fn default_max_auto_recoveries() -> u32 {
    2
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            auto_recover: false,
            max_auto_recoveries: default_max_auto_recoveries(),
        }
    }
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Name recorded in the run metadata.
    pub executor_name: String,
    /// Period of the background checkpoint refresh; zero disables it.
    pub checkpoint_interval: Duration,
    pub retry: RetryPolicy,
    pub recovery: RecoveryPolicy,
    /// Time allowed past a band's wall time before it counts as failed.
    pub deadline_grace: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            executor_name: "unknown".to_string(),
            checkpoint_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            recovery: RecoveryPolicy::default(),
            deadline_grace: Duration::from_secs(30),
        }
    }
}

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub state: CheckpointState,
    /// Analysis over the committed results, if any band had data.
    pub analysis: Option<AnalysisResult>,
    pub last_checkpoint: Option<Uuid>,
}

impl RunOutcome {
    pub fn remaining_bands(&self) -> &[BandPlan] {
        self.state.remaining_bands()
    }
}

/// State shared between the band loop and the checkpoint task.
#[derive(Debug)]
struct RunState {
    state: CheckpointState,
    has_checkpoint: bool,
    last_checkpoint: Option<Uuid>,
}

impl RunState {
    /// Band a failure outside any executor call is attributed to: the
    /// running band, else the last committed one, else the next planned.
    fn band_in_focus(&self) -> Option<BandPlan> {
        let execution = &self.state.execution;
        execution
            .current_band
            .as_ref()
            .map(|band| band.plan)
            .or_else(|| self.state.results.last().map(BandResult::plan))
            .or_else(|| self.state.metadata.plan.get(execution.next_band).copied())
    }
}

enum BandOutcome {
    Completed(BandResult),
    NoData(EngineError),
    Cancelled(Option<BandResult>),
    /// Carries the partial result when the stream stopped short.
    Failed(EngineError, Option<BandResult>),
}

/// Runs scaling tests against one executor.
pub struct ExecutionController<E> {
    executor: E,
    engine: AnalysisEngine,
    checkpoints: Option<Arc<CheckpointManager>>,
    observers: ObserverRegistry,
    options: ControllerOptions,
    cancel: CancelSignal,
}

impl<E: BandExecutor> ExecutionController<E> {
    pub fn new(executor: E, engine: AnalysisEngine, options: ControllerOptions) -> Self {
        Self {
            executor,
            engine,
            checkpoints: None,
            observers: ObserverRegistry::default(),
            options,
            cancel: CancelSignal::new(),
        }
    }

    /// Persist checkpoints through `manager`.
    pub fn with_checkpoints(mut self, manager: Arc<CheckpointManager>) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn observers_mut(&mut self) -> &mut ObserverRegistry {
        &mut self.observers
    }

    /// Signal that stops the run when cancelled.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Plan and run a fresh test.
    pub async fn run(&self, config: TestConfiguration) -> Result<RunOutcome> {
        let plan = planner::plan_bands(&config)?;
        let metadata = TestMetadata::new(self.options.executor_name.clone(), config, plan);
        info!(
            "Starting run {} with {} bands ({} strategy)",
            metadata.run_id,
            metadata.plan.len(),
            metadata.configuration.strategy
        );
        self.drive(CheckpointState::new(metadata), None, 0).await
    }

    /// Continue a run from a checkpoint.
    ///
    /// Bands already committed are not run again. For a failed run the
    /// recovery `action` (or the checkpoint's proposal when `None`) decides
    /// how the failed band is handled. Retrying or shrinking the band keeps
    /// its failure count, so a repeat failure escalates. A manual resume
    /// does not count against the auto-recovery budget.
    pub async fn resume(
        &self,
        checkpoint: Checkpoint,
        action: Option<RecoveryAction>,
    ) -> Result<RunOutcome> {
        let mut state = checkpoint.state;
        if state.execution.status == RunStatus::Completed {
            return Err(EngineError::invalid_config(format!(
                "checkpoint {} belongs to a completed run",
                checkpoint.id
            )));
        }
        planner::validate(&state.metadata.configuration)?;
        if !state.execution.resumable {
            warn!(
                "Checkpoint {} was flagged non-resumable; later progress may be lost",
                checkpoint.id
            );
        }

        let mut override_plan = None;
        let mut failures = 0;
        if let Some(recovery) = state.recovery.take() {
            let action = action.unwrap_or(recovery.proposed);
            info!(
                "Resuming after failure of {} with action {}",
                recovery.failed_band, action
            );
            if !recovery.candidates.contains(&action) {
                warn!(
                    "{} is not a suggested action for this failure (suggested: {:?})",
                    action, recovery.candidates
                );
            }
            match action {
                RecoveryAction::Continue => state.execution.next_band += 1,
                RecoveryAction::RetryBand => failures = recovery.failures,
                RecoveryAction::ReduceLoad => {
                    override_plan = Some(recovery.reduced_band);
                    failures = recovery.failures;
                }
            }
        }
        state.execution.current_band = None;

        info!(
            "Resuming run {} at band {}/{}",
            state.metadata.run_id,
            state.execution.next_band + 1,
            state.metadata.plan.len()
        );
        self.drive(state, override_plan, failures).await
    }

    /// `failures` counts earlier consecutive failures of the first band run.
    async fn drive(
        &self,
        mut state: CheckpointState,
        mut override_plan: Option<BandPlan>,
        mut failures: u32,
    ) -> Result<RunOutcome> {
        let config = state.metadata.configuration.clone();
        state.execution.status = RunStatus::Running;
        state.execution.total_bands = state.metadata.plan.len();
        self.observers.each(|o| o.on_run_started(&state.metadata));

        let shared = Arc::new(Mutex::new(RunState {
            state,
            has_checkpoint: false,
            last_checkpoint: None,
        }));

        self.checkpoint(&shared).await;
        let (stop, periodic) = self.spawn_periodic(&shared);

        let mut analysis = {
            let run = shared.lock().await;
            self.engine.analyze(&run.state.results).ok()
        };

        let status = loop {
            if self.cancel.is_cancelled() {
                break RunStatus::Cancelled;
            }

            let next = {
                let run = shared.lock().await;
                run.state
                    .metadata
                    .plan
                    .get(run.state.execution.next_band)
                    .copied()
            };
            let Some(planned) = next else {
                break RunStatus::Completed;
            };
            let plan = override_plan.take().unwrap_or(planned);

            match self.run_band(plan, &config, &shared).await {
                BandOutcome::Completed(result) => {
                    failures = 0;
                    info!(
                        "Completed {}: {:.1} TPS, p95 {:.2} ms, {:.2} errors/s",
                        plan, result.total_tps, result.p95_latency_ms, result.error_rate
                    );
                    analysis = self.commit(&shared, plan, result, None).await;
                }
                BandOutcome::NoData(err) => {
                    failures = 0;
                    warn!("{}", err);
                    let result = BandResult::no_data(&plan);
                    analysis = self.commit(&shared, plan, result, Some(err)).await;
                }
                BandOutcome::Cancelled(partial) => {
                    info!("Run cancelled during {}", plan);
                    let mut run = shared.lock().await;
                    run.state.execution.current_band = None;
                    if let Some(partial) = partial {
                        run.state.partial_results.push(partial);
                    }
                    break RunStatus::Cancelled;
                }
                BandOutcome::Failed(err, partial) => {
                    failures += 1;
                    error!("{}", err);
                    let record = err.record_in(Some(&plan));
                    let recovery = RecoveryInfo::propose(plan, record.clone(), failures);

                    let mut run = shared.lock().await;
                    run.state.execution.current_band = None;
                    run.state.execution.errors.push(record);
                    if let Some(partial) = partial {
                        run.state.partial_results.push(partial);
                    }

                    let policy = self.options.recovery;
                    if policy.auto_recover
                        && run.state.execution.recovery_attempts < policy.max_auto_recoveries
                    {
                        run.state.execution.recovery_attempts += 1;
                        info!(
                            "Auto-recovering {} with {} (attempt {}/{})",
                            plan,
                            recovery.proposed,
                            run.state.execution.recovery_attempts,
                            policy.max_auto_recoveries
                        );
                        match recovery.proposed {
                            RecoveryAction::Continue => {
                                run.state.execution.next_band += 1;
                                failures = 0;
                            }
                            RecoveryAction::RetryBand => override_plan = Some(plan),
                            RecoveryAction::ReduceLoad => {
                                override_plan = Some(recovery.reduced_band)
                            }
                        }
                        continue;
                    }

                    info!(
                        "Proposed recovery for {}: {}",
                        recovery.failed_band, recovery.proposed
                    );
                    run.state.recovery = Some(recovery);
                    break RunStatus::Failed;
                }
            }
        };

        stop.cancel();
        if let Some(handle) = periodic {
            if let Err(e) = handle.await {
                warn!("Checkpoint task ended abnormally: {}", e);
            }
        }

        {
            let mut run = shared.lock().await;
            run.state.execution.status = status;
            run.state.execution.current_band = None;
        }
        self.checkpoint(&shared).await;

        let run = shared.lock().await;
        let outcome = RunOutcome {
            status,
            state: run.state.clone(),
            analysis,
            last_checkpoint: run.last_checkpoint,
        };
        drop(run);

        info!(
            "Run {} finished: {} ({}/{} bands)",
            outcome.state.metadata.run_id,
            outcome.status,
            outcome.state.execution.next_band,
            outcome.state.execution.total_bands
        );
        self.observers.each(|o| o.on_run_finished(&outcome));
        Ok(outcome)
    }

    /// Execute one band until its stream ends, it fails, times out or the
    /// run is cancelled.
    async fn run_band(
        &self,
        plan: BandPlan,
        config: &TestConfiguration,
        shared: &Mutex<RunState>,
    ) -> BandOutcome {
        let request = BandRequest::new(plan, config);
        debug!("Starting {} (wall time {:?})", plan, request.wall_time());
        self.observers.each(|o| o.on_band_started(&plan, &request));
        self.set_phase(shared, plan, BandPhase::Warmup, 0, true).await;

        let mut stream = match self.executor.run_band(&request, self.cancel.clone()) {
            Ok(stream) => stream,
            Err(e) => return BandOutcome::Failed(EngineError::executor(&plan, e.message), None),
        };

        let mut aggregator = BandAggregator::new(plan, config);
        let mut phase = BandPhase::Warmup;
        let deadline = tokio::time::sleep(request.wall_time() + self.options.deadline_grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return BandOutcome::Cancelled(aggregator.finish(Completion::Partial).ok());
                }
                _ = &mut deadline => {
                    let err = EngineError::executor(
                        &plan,
                        format!("band exceeded its deadline of {:?}", request.wall_time()),
                    );
                    return BandOutcome::Failed(err, None);
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let now = aggregator.record(&event);
                        if now != phase {
                            phase = now;
                            self.observers.each(|o| o.on_phase_changed(&plan, phase));
                            self.set_phase(shared, plan, phase, aggregator.operations(), false)
                                .await;
                        }
                    }
                    Some(Err(e)) => {
                        let err = EngineError::executor(&plan, e.message);
                        return BandOutcome::Failed(err, None);
                    }
                    None => break,
                }
            }
        }

        if self.cancel.is_cancelled() {
            return BandOutcome::Cancelled(aggregator.finish(Completion::Partial).ok());
        }

        debug!(
            "{} stream ended: {} operations, {} outside the run phase",
            plan,
            aggregator.operations(),
            aggregator.discarded()
        );
        match aggregator.finish(Completion::Full) {
            Ok(result) if result.status == BandStatus::Partial => {
                let err = EngineError::executor(
                    &plan,
                    format!(
                        "sample stream ended {:?} into the {:?} run phase",
                        result.duration, request.duration
                    ),
                );
                BandOutcome::Failed(err, Some(result))
            }
            Ok(result) => BandOutcome::Completed(result),
            Err(err @ EngineError::NoDataCollected { .. }) => BandOutcome::NoData(err),
            Err(err) => BandOutcome::Failed(err, None),
        }
    }

    /// Append a result, refresh analysis and checkpoint.
    async fn commit(
        &self,
        shared: &Mutex<RunState>,
        plan: BandPlan,
        result: BandResult,
        error: Option<EngineError>,
    ) -> Option<AnalysisResult> {
        self.observers
            .each(|o| o.on_phase_changed(&plan, BandPhase::AnalysisUpdate));

        let analysis = {
            let mut run = shared.lock().await;
            if let Some(band) = run.state.execution.current_band.as_mut() {
                band.phase = BandPhase::AnalysisUpdate;
            }
            if let Some(err) = error {
                run.state.execution.errors.push(err.record());
            }
            run.state.results.push(result.clone());
            run.state.execution.next_band += 1;
            run.state.execution.current_band = None;
            run.state.recovery = None;

            match self.engine.analyze(&run.state.results) {
                Ok(analysis) => Some(analysis),
                Err(e) => {
                    debug!("Analysis unavailable: {}", e);
                    None
                }
            }
        };

        self.observers
            .each(|o| o.on_band_completed(&result, analysis.as_ref()));
        self.checkpoint(shared).await;
        analysis
    }

    async fn set_phase(
        &self,
        shared: &Mutex<RunState>,
        plan: BandPlan,
        phase: BandPhase,
        operations_seen: u64,
        starting: bool,
    ) {
        let mut run = shared.lock().await;
        run.state.execution.updated_at = Utc::now();
        match run.state.execution.current_band.as_mut() {
            Some(band) if !starting => {
                band.phase = phase;
                band.operations_seen = operations_seen;
            }
            _ => {
                run.state.execution.current_band = Some(CurrentBandState {
                    plan,
                    phase,
                    started_at: Utc::now(),
                    operations_seen,
                });
            }
        }
    }

    /// Write a checkpoint of the current state, if a store is configured.
    async fn checkpoint(&self, shared: &Mutex<RunState>) {
        let Some(manager) = &self.checkpoints else {
            return;
        };
        let created = {
            let mut run = shared.lock().await;
            persist(manager, &mut run, self.options.retry).await
        };
        if let Some(checkpoint) = created {
            self.observers.each(|o| o.on_checkpoint(&checkpoint));
        }
    }

    fn spawn_periodic(
        &self,
        shared: &Arc<Mutex<RunState>>,
    ) -> (CancelSignal, Option<JoinHandle<()>>) {
        let stop = CancelSignal::new();
        let handle = match &self.checkpoints {
            Some(manager) if !self.options.checkpoint_interval.is_zero() => {
                Some(tokio::spawn(periodic_checkpoints(
                    Arc::clone(manager),
                    Arc::clone(shared),
                    self.options.checkpoint_interval,
                    self.options.retry,
                    stop.clone(),
                    self.cancel.clone(),
                )))
            }
            _ => None,
        };
        (stop, handle)
    }
}

/// Persist `run.state`; on failure the run is flagged non-resumable.
async fn persist(
    manager: &CheckpointManager,
    run: &mut RunState,
    retry: RetryPolicy,
) -> Option<Checkpoint> {
    run.state.execution.updated_at = Utc::now();
    match manager.create_with_retry(&run.state, retry).await {
        Ok(checkpoint) => {
            run.has_checkpoint = true;
            run.last_checkpoint = Some(checkpoint.id);
            Some(checkpoint)
        }
        Err(e) => {
            warn!("Checkpoint failed, run is no longer resumable: {}", e);
            let record = e.record_in(run.band_in_focus().as_ref());
            run.state.execution.resumable = false;
            run.state.execution.errors.push(record);
            None
        }
    }
}

/// One periodic refresh: only after the initial checkpoint and only while running.
async fn periodic_tick(
    manager: &CheckpointManager,
    shared: &Mutex<RunState>,
    retry: RetryPolicy,
) -> Option<Checkpoint> {
    let mut run = shared.lock().await;
    if !run.has_checkpoint || run.state.execution.status != RunStatus::Running {
        return None;
    }
    persist(manager, &mut run, retry).await
}

async fn periodic_checkpoints(
    manager: Arc<CheckpointManager>,
    shared: Arc<Mutex<RunState>>,
    interval: Duration,
    retry: RetryPolicy,
    stop: CancelSignal,
    cancel: CancelSignal,
) {
    debug!("Checkpoint refresh every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Some(checkpoint) = periodic_tick(&manager, &shared, retry).await {
            debug!("Periodic checkpoint {}", checkpoint.id);
        }
    }
    debug!("Checkpoint refresh stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{FaultMode, SyntheticExecutor, SyntheticModel};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn config() -> TestConfiguration {
        TestConfiguration {
            min_workers: 1,
            max_workers: 4,
            min_connections: 1,
            max_connections: 4,
            band_count: 3,
            band_duration: Duration::from_millis(400),
            warmup: Duration::from_millis(50),
            cooldown: Duration::from_millis(50),
            ..TestConfiguration::default()
        }
    }

    fn executor() -> SyntheticExecutor {
        SyntheticExecutor::new(SyntheticModel {
            per_connection_tps: 200.0,
            snapshot_interval: Duration::from_millis(50),
            ..SyntheticModel::default()
        })
    }

    fn options() -> ControllerOptions {
        ControllerOptions {
            executor_name: "synthetic".to_string(),
            checkpoint_interval: Duration::ZERO,
            retry: RetryPolicy {
                attempts: 1,
                base_delay: Duration::from_millis(1),
            },
            deadline_grace: Duration::from_millis(200),
            ..ControllerOptions::default()
        }
    }

    async fn store(dir: &TempDir) -> Arc<CheckpointManager> {
        Arc::new(CheckpointManager::open(dir.path(), 50).await.unwrap())
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ProgressObserver for Recorder {
        fn on_band_started(&self, plan: &BandPlan, _request: &BandRequest) {
            self.events.lock().unwrap().push(format!("start {}", plan.index));
        }

        fn on_band_completed(&self, result: &BandResult, _analysis: Option<&AnalysisResult>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done {} {}", result.band_index, result.status));
        }

        fn on_run_finished(&self, outcome: &RunOutcome) {
            self.events
                .lock()
                .unwrap()
                .push(format!("finished {}", outcome.status));
        }
    }

    /// Cancels the run shortly after `band` starts.
    struct CancelAt {
        band: usize,
        signal: CancelSignal,
    }

    impl ProgressObserver for CancelAt {
        fn on_band_started(&self, plan: &BandPlan, _request: &BandRequest) {
            if plan.index == self.band {
                let signal = self.signal.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    signal.cancel();
                });
            }
        }
    }

    #[tokio::test]
    async fn test_full_run_completes_every_band() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut controller = ExecutionController::new(
            executor(),
            AnalysisEngine::default(),
            options(),
        )
        .with_checkpoints(store(&dir).await);
        controller.observers_mut().register(recorder.clone());

        let outcome = controller.run(config()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.state.results.len(), 3);
        assert!(outcome.state.results.iter().all(|r| r.status == BandStatus::Complete));
        assert!(outcome.remaining_bands().is_empty());
        assert_eq!(outcome.analysis.as_ref().unwrap().bands_analyzed, 3);
        assert_eq!(
            recorder.events(),
            vec![
                "start 0",
                "done 0 complete",
                "start 1",
                "done 1 complete",
                "start 2",
                "done 2 complete",
                "finished completed",
            ]
        );

        let manager = store(&dir).await;
        let latest = manager.restore_latest().await.unwrap().unwrap();
        assert_eq!(Some(latest.id), outcome.last_checkpoint);
        assert_eq!(latest.state.execution.status, RunStatus::Completed);
        assert_eq!(latest.state.results, outcome.state.results);
        // initial + one per band + final
        assert_eq!(manager.list().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_cancel_mid_band_keeps_partial_separately() {
        let dir = TempDir::new().unwrap();
        let mut controller = ExecutionController::new(
            executor().with_fault(1, FaultMode::StallMidBand),
            AnalysisEngine::default(),
            options(),
        )
        .with_checkpoints(store(&dir).await);
        let signal = controller.cancel_signal();
        controller
            .observers_mut()
            .register(Arc::new(CancelAt { band: 1, signal }));

        let outcome = controller.run(config()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.state.results.len(), 1);
        assert_eq!(outcome.state.partial_results.len(), 1);
        assert_eq!(outcome.state.partial_results[0].status, BandStatus::Partial);
        assert_eq!(outcome.state.partial_results[0].band_index, 1);

        let full = planner::plan_bands(&config()).unwrap();
        assert_eq!(outcome.remaining_bands(), &full[1..]);

        let latest = store(&dir).await.restore_latest().await.unwrap().unwrap();
        assert_eq!(latest.state.execution.status, RunStatus::Cancelled);
        assert_eq!(latest.state.remaining_bands(), &full[1..]);
    }

    #[tokio::test]
    async fn test_failure_records_recovery_and_resume_finishes() {
        let dir = TempDir::new().unwrap();
        let manager = store(&dir).await;
        let controller = ExecutionController::new(
            executor().with_fault(1, FaultMode::FailMidBand),
            AnalysisEngine::default(),
            options(),
        )
        .with_checkpoints(Arc::clone(&manager));

        let outcome = controller.run(config()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.state.results.len(), 1);

        let recovery = outcome.state.recovery.as_ref().unwrap();
        assert_eq!(recovery.failed_band.index, 1);
        assert_eq!(recovery.proposed, RecoveryAction::RetryBand);
        assert_eq!(recovery.error.code, "BSC-2001");
        assert_eq!(outcome.state.execution.errors.len(), 1);

        let checkpoint = manager.restore_latest().await.unwrap().unwrap();
        assert_eq!(checkpoint.state.execution.status, RunStatus::Failed);

        let resumed = ExecutionController::new(executor(), AnalysisEngine::default(), options())
            .with_checkpoints(Arc::clone(&manager));
        let outcome = resumed
            .resume(checkpoint, Some(RecoveryAction::ReduceLoad))
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        let indices: Vec<usize> = outcome.state.results.iter().map(|r| r.band_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        // only the two remaining bands ran
        assert_eq!(resumed.executor().calls(), 2);

        let full = planner::plan_bands(&config()).unwrap();
        let reduced = crate::checkpoint::reduce_load(&full[1]);
        assert_eq!(outcome.state.results[1].workers, reduced.workers);
        assert_eq!(outcome.state.results[1].connections, reduced.connections);
        assert!(outcome.state.recovery.is_none());
    }

    #[tokio::test]
    async fn test_repeat_failure_after_resume_escalates() {
        let dir = TempDir::new().unwrap();
        let manager = store(&dir).await;
        let controller = ExecutionController::new(
            executor().with_fault(1, FaultMode::RefuseToStart),
            AnalysisEngine::default(),
            options(),
        )
        .with_checkpoints(Arc::clone(&manager));
        let outcome = controller.run(config()).await.unwrap();
        let recovery = outcome.state.recovery.as_ref().unwrap();
        assert_eq!(recovery.proposed, RecoveryAction::RetryBand);
        assert_eq!(recovery.failures, 1);

        // the retried band is refused again
        let checkpoint = manager.restore_latest().await.unwrap().unwrap();
        let retry = ExecutionController::new(
            executor().with_fault(0, FaultMode::RefuseToStart),
            AnalysisEngine::default(),
            options(),
        )
        .with_checkpoints(Arc::clone(&manager));
        let outcome = retry
            .resume(checkpoint, Some(RecoveryAction::RetryBand))
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        let recovery = outcome.state.recovery.as_ref().unwrap();
        assert_eq!(recovery.failed_band.index, 1);
        assert_eq!(recovery.failures, 2);
        assert_eq!(recovery.proposed, RecoveryAction::ReduceLoad);
        assert_eq!(outcome.state.execution.errors.len(), 2);
        assert_eq!(outcome.state.execution.recovery_attempts, 0);

        let checkpoint = manager.restore_latest().await.unwrap().unwrap();
        let reduced = checkpoint.state.recovery.as_ref().unwrap().reduced_band;
        let finish = ExecutionController::new(executor(), AnalysisEngine::default(), options())
            .with_checkpoints(Arc::clone(&manager));
        let outcome = finish.resume(checkpoint, None).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.state.results[1].connections, reduced.connections);
        assert_eq!(outcome.state.execution.recovery_attempts, 0);
    }

    #[tokio::test]
    async fn test_checkpoint_failures_keep_run_going() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("checkpoints");
        let manager = Arc::new(CheckpointManager::open(&root, 50).await.unwrap());
        std::fs::remove_dir_all(&root).unwrap();

        let controller = ExecutionController::new(executor(), AnalysisEngine::default(), options())
            .with_checkpoints(manager);
        let outcome = controller.run(config()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.state.results.len(), 3);
        assert!(!outcome.state.execution.resumable);
        assert!(outcome.last_checkpoint.is_none());

        let errors = &outcome.state.execution.errors;
        // initial + one per band + final
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().all(|e| e.code == "BSC-4001"));
        assert!(errors.iter().all(|e| e.context.band_index.is_some()));
        assert_eq!(errors[0].context.band_index, Some(0));
        assert_eq!(errors[4].context.band_index, Some(2));
        assert!(errors[4].context.connections > 0);
    }

    #[tokio::test]
    async fn test_stream_ending_early_fails_band_and_keeps_partial() {
        let controller = ExecutionController::new(
            executor().with_fault(1, FaultMode::EndMidBand),
            AnalysisEngine::default(),
            options(),
        );

        let outcome = controller.run(config()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.state.results.len(), 1);
        assert_eq!(outcome.state.partial_results.len(), 1);
        let partial = &outcome.state.partial_results[0];
        assert_eq!(partial.band_index, 1);
        assert_eq!(partial.status, BandStatus::Partial);
        assert!(partial.duration < config().band_duration);

        let recovery = outcome.state.recovery.as_ref().unwrap();
        assert_eq!(recovery.failed_band.index, 1);
        assert!(recovery.error.message.contains("ended"));
    }

    #[tokio::test]
    async fn test_auto_recovery_retries_failed_band() {
        let controller = ExecutionController::new(
            executor().with_fault(1, FaultMode::RefuseToStart),
            AnalysisEngine::default(),
            ControllerOptions {
                recovery: RecoveryPolicy {
                    auto_recover: true,
                    max_auto_recoveries: 1,
                },
                ..options()
            },
        );

        let outcome = controller.run(config()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.state.results.len(), 3);
        assert_eq!(outcome.state.execution.recovery_attempts, 1);
        assert_eq!(outcome.state.execution.errors.len(), 1);
        assert_eq!(controller.executor().calls(), 4);
    }

    #[tokio::test]
    async fn test_no_data_band_is_recorded_and_run_continues() {
        let controller = ExecutionController::new(
            executor().with_fault(0, FaultMode::NoSamples),
            AnalysisEngine::default(),
            options(),
        );

        let outcome = controller.run(config()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.state.results[0].status, BandStatus::NoDataCollected);
        assert_eq!(outcome.state.execution.errors[0].code, "BSC-2002");

        let analysis = outcome.analysis.unwrap();
        assert_eq!(analysis.bands_analyzed, 2);
        assert_eq!(analysis.skipped_bands, vec![0]);
    }

    #[tokio::test]
    async fn test_stalled_band_hits_deadline() {
        let controller = ExecutionController::new(
            executor().with_fault(0, FaultMode::StallMidBand),
            AnalysisEngine::default(),
            options(),
        );

        let outcome = tokio::time::timeout(Duration::from_secs(5), controller.run(config()))
            .await
            .expect("deadline should end the band")
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.state.results.is_empty());
        assert!(outcome.state.execution.errors[0].message.contains("deadline"));
    }

    #[tokio::test]
    async fn test_resume_rejects_completed_run() {
        let dir = TempDir::new().unwrap();
        let manager = store(&dir).await;
        let controller = ExecutionController::new(executor(), AnalysisEngine::default(), options())
            .with_checkpoints(Arc::clone(&manager));
        controller.run(config()).await.unwrap();

        let checkpoint = manager.restore_latest().await.unwrap().unwrap();
        let err = controller.resume(checkpoint, None).await.unwrap_err();
        assert_eq!(err.code(), "BSC-1001");
    }

    #[tokio::test]
    async fn test_periodic_refresh_is_gated() {
        let dir = TempDir::new().unwrap();
        let manager = store(&dir).await;
        let metadata = TestMetadata::new(
            "synthetic",
            config(),
            planner::plan_bands(&config()).unwrap(),
        );
        let shared = Mutex::new(RunState {
            state: CheckpointState::new(metadata),
            has_checkpoint: false,
            last_checkpoint: None,
        });
        let retry = RetryPolicy::default();

        shared.lock().await.state.execution.status = RunStatus::Running;
        assert!(periodic_tick(&manager, &shared, retry).await.is_none());

        shared.lock().await.has_checkpoint = true;
        assert!(periodic_tick(&manager, &shared, retry).await.is_some());

        shared.lock().await.state.execution.status = RunStatus::Completed;
        assert!(periodic_tick(&manager, &shared, retry).await.is_none());

        assert_eq!(manager.list().await.unwrap().len(), 1);
    }
}
