//! Optimal configuration selection.

use super::AnalysisThresholds;
use crate::models::BandResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimalConfiguration {
    pub band_index: usize,
    pub workers: u32,
    pub connections: u32,
    pub tps: f64,
    pub avg_latency_ms: f64,
    /// Per-worker efficiency after the latency penalty.
    pub score: f64,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub reasoning: String,
}

/// Efficiency score: TPS per worker, scaled down once mean latency passes
/// the penalty threshold.
pub fn score(band: &BandResult, thresholds: &AnalysisThresholds) -> f64 {
    let efficiency = band.total_tps / band.workers.max(1) as f64;
    let penalty = if band.avg_latency_ms > thresholds.latency_penalty_ms {
        thresholds.latency_penalty_ms / band.avg_latency_ms
    } else {
        1.0
    };
    efficiency * penalty
}

/// Best-scoring band among those reaching `optimal_tps_fraction` of peak TPS.
pub fn select_optimal(
    bands: &[&BandResult],
    thresholds: &AnalysisThresholds,
) -> Option<OptimalConfiguration> {
    let peak = bands.iter().map(|b| b.total_tps).fold(0.0f64, f64::max);
    if peak <= 0.0 {
        return None;
    }

    let mut candidates: Vec<(&BandResult, f64)> = bands
        .iter()
        .filter(|b| b.total_tps >= thresholds.optimal_tps_fraction * peak)
        .map(|b| (*b, score(b, thresholds)))
        .collect();
    // stable: earlier band wins ties
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

    let (best, best_score) = *candidates.first()?;
    let scores: Vec<f64> = candidates.iter().map(|(_, s)| *s).collect();
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;

    let gap = match candidates.get(1) {
        Some((_, runner_up)) if best_score > 0.0 => (best_score - runner_up) / best_score,
        _ => 0.0,
    };
    let confidence = (1.0 / (1.0 + variance) + gap).clamp(0.0, 1.0);

    let mut reasoning = format!(
        "{:.0} TPS ({:.0}% of peak) at {:.1} TPS/worker",
        best.total_tps,
        best.total_tps / peak * 100.0,
        best.total_tps / best.workers.max(1) as f64
    );
    if best.avg_latency_ms > thresholds.latency_penalty_ms {
        reasoning.push_str(&format!(
            "; penalized for {:.1} ms mean latency",
            best.avg_latency_ms
        ));
    }
    if candidates.len() > 1 {
        reasoning.push_str(&format!(
            "; best of {} bands within {:.0}% of peak",
            candidates.len(),
            thresholds.optimal_tps_fraction * 100.0
        ));
    }

    Some(OptimalConfiguration {
        band_index: best.band_index,
        workers: best.workers,
        connections: best.connections,
        tps: best.total_tps,
        avg_latency_ms: best.avg_latency_ms,
        score: best_score,
        confidence,
        reasoning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::test_support::band;

    #[test]
    fn test_prefers_efficient_band_near_peak() {
        let mut bands = vec![
            band(0, 10, 100.0, 5.0),
            band(1, 20, 300.0, 10.0),
            band(2, 40, 320.0, 150.0),
        ];
        bands[0].workers = 1;
        bands[1].workers = 2;
        bands[2].workers = 4;
        let refs: Vec<&BandResult> = bands.iter().collect();
        let t = AnalysisThresholds::default();

        let optimal = select_optimal(&refs, &t).unwrap();
        assert_eq!(optimal.band_index, 1);
        assert_eq!(optimal.score, 150.0);

        let runner_up = 80.0 * (100.0 / 150.0);
        let mean = (150.0 + runner_up) / 2.0;
        let variance =
            ((150.0 - mean) * (150.0 - mean) + (runner_up - mean) * (runner_up - mean)) / 2.0;
        let expected = 1.0 / (1.0 + variance) + (150.0 - runner_up) / 150.0;
        assert!((optimal.confidence - expected).abs() < 1e-9);
        assert!(optimal.reasoning.contains("best of 2 bands"));
    }

    #[test]
    fn test_single_candidate_is_fully_confident() {
        let bands = vec![band(0, 10, 100.0, 1.0), band(1, 20, 1_000.0, 1.0)];
        let refs: Vec<&BandResult> = bands.iter().collect();
        let optimal = select_optimal(&refs, &AnalysisThresholds::default()).unwrap();
        assert_eq!(optimal.band_index, 1);
        assert_eq!(optimal.confidence, 1.0);
    }

    #[test]
    fn test_zero_throughput_has_no_optimum() {
        let bands = vec![band(0, 10, 0.0, 1.0)];
        let refs: Vec<&BandResult> = bands.iter().collect();
        assert!(select_optimal(&refs, &AnalysisThresholds::default()).is_none());
    }
}
