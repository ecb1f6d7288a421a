//! Terminal progress display for running tests.

use bandscale::analysis::AnalysisResult;
use bandscale::checkpoint::{Checkpoint, TestMetadata};
use bandscale::controller::{ProgressObserver, RunOutcome};
use bandscale::executor::BandRequest;
use bandscale::models::{BandPhase, BandPlan, BandResult, BandStatus};
use indicatif::{ProgressBar, ProgressStyle};

/// Band-level progress bar driven by controller notifications.
pub struct BandProgress {
    bar: ProgressBar,
}

impl BandProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }
}

impl ProgressObserver for BandProgress {
    fn on_run_started(&self, metadata: &TestMetadata) {
        self.bar.set_length(metadata.plan.len() as u64);
    }

    fn on_band_started(&self, plan: &BandPlan, _request: &BandRequest) {
        self.bar.set_position(plan.index as u64);
        self.bar.set_message(format!("{}", plan));
    }

    fn on_phase_changed(&self, plan: &BandPlan, phase: BandPhase) {
        self.bar.set_message(format!("{}: {}", plan, phase));
    }

    fn on_band_completed(&self, result: &BandResult, _analysis: Option<&AnalysisResult>) {
        self.bar.set_position(result.band_index as u64 + 1);
        if result.status == BandStatus::Complete {
            self.bar.println(format!(
                "   band {} ({}w/{}c): {:.1} TPS, p95 {:.2} ms",
                result.band_index + 1,
                result.workers,
                result.connections,
                result.total_tps,
                result.p95_latency_ms
            ));
        } else {
            self.bar.println(format!(
                "   band {} ({}w/{}c): {}",
                result.band_index + 1,
                result.workers,
                result.connections,
                result.status
            ));
        }
    }

    fn on_checkpoint(&self, checkpoint: &Checkpoint) {
        self.bar
            .set_message(format!("checkpoint {}", checkpoint.sequence));
    }

    fn on_run_finished(&self, outcome: &RunOutcome) {
        self.bar.finish_with_message(format!("run {}", outcome.status));
    }
}
