//! Statistical analysis of band results.
//!
//! This module turns the growing list of [`BandResult`]s into an
//! [`AnalysisResult`]: marginal gains and their derivative, cumulative
//! capacity, scaling regions, curve fits, M/M/c queueing diagnostics, a
//! bottleneck classification and the recommended operating point.
//!
//! Analysis is pure and is always recomputed from the full list, so running
//! it twice over the same input gives identical output.

pub mod aggregator;
pub mod curve_fit;
pub mod optimal;
pub mod queueing;
pub mod scaling;

pub use aggregator::{aggregate_band, percentile, BandAggregator, Completion};
pub use curve_fit::{CurveFit, CurveModel, Extrapolation, FitSummary};
pub use optimal::OptimalConfiguration;
pub use queueing::{
    BottleneckAssessment, BottleneckKind, BottleneckThresholds, QueueingDiagnostic,
};
pub use scaling::{
    CumulativeCapacity, GainInterpretation, InflectionKind, InflectionPoint, MarginalGain,
    RegionKind, ScalingPoint, ScalingRegion, SecondDerivative, SecondDerivatives, SweetSpot,
};

use crate::error::{EngineError, Result};
use crate::models::BandResult;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Tunable thresholds for every analysis rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisThresholds {
    /// Gain above which scaling is "excellent".
    #[serde(default = "default_excellent_gain")]
    pub excellent_gain: f64,

    #[serde(default = "default_good_gain")]
    pub good_gain: f64,

    #[serde(default = "default_moderate_gain")]
    pub moderate_gain: f64,

    #[serde(default)]
    pub minimal_gain: f64,

    /// Gains between this and `minimal_gain` read as slight degradation.
    #[serde(default = "default_slight_degradation_gain")]
    pub slight_degradation_gain: f64,

    /// Minimum gain for a band to be in the sweet spot.
    #[serde(default = "default_sweet_spot_min_gain")]
    pub sweet_spot_min_gain: f64,

    /// Maximum P95 (ms) for a band to be in the sweet spot.
    #[serde(default = "default_sweet_spot_max_p95_ms")]
    pub sweet_spot_max_p95_ms: f64,

    /// Connection count from which diminishing returns are looked for.
    #[serde(default = "default_diminishing_min_connections")]
    pub diminishing_min_connections: u32,

    /// Gain below which returns count as diminishing.
    #[serde(default = "default_diminishing_max_gain")]
    pub diminishing_max_gain: f64,

    /// Second-derivative magnitude that marks an inflection point.
    #[serde(default = "default_inflection_threshold")]
    pub inflection_threshold: f64,

    /// Mean latency (ms) above which the optimal score is penalized.
    #[serde(default = "default_latency_penalty_ms")]
    pub latency_penalty_ms: f64,

    /// Share of peak TPS a band needs to be an optimal candidate.
    #[serde(default = "default_optimal_tps_fraction")]
    pub optimal_tps_fraction: f64,

    /// Observed-P95 / theoretical-response ratio that flags a non-queueing bottleneck.
    #[serde(default = "default_queueing_gap_ratio")]
    pub queueing_gap_ratio: f64,

    /// Coefficient of variation above which a band is reported as unstable.
    #[serde(default = "default_max_stable_cv")]
    pub max_stable_cv: f64,

    /// Multiple of the largest tested connection count to extrapolate to.
    #[serde(default = "default_extrapolation_factor")]
    pub extrapolation_factor: f64,

    #[serde(default)]
    pub bottleneck: BottleneckThresholds,
}

fn default_excellent_gain() -> f64 {
    50.0
}

fn default_good_gain() -> f64 {
    20.0
}

fn default_moderate_gain() -> f64 {
    5.0
}

fn default_slight_degradation_gain() -> f64 {
    -5.0
}

fn default_sweet_spot_min_gain() -> f64 {
    60.0
}

fn default_sweet_spot_max_p95_ms() -> f64 {
    5.0
}

fn default_diminishing_min_connections() -> u32 {
    40
}

fn default_diminishing_max_gain() -> f64 {
    20.0
}

fn default_inflection_threshold() -> f64 {
    0.05
}

fn default_latency_penalty_ms() -> f64 {
    100.0
}

fn default_optimal_tps_fraction() -> f64 {
    0.8
}

fn default_queueing_gap_ratio() -> f64 {
    3.0
}

fn default_max_stable_cv() -> f64 {
    0.2
}

fn default_extrapolation_factor() -> f64 {
    2.0
}

impl Default for AnalysisThresholds {
    fn default() -> Self {
        Self {
            excellent_gain: default_excellent_gain(),
            good_gain: default_good_gain(),
            moderate_gain: default_moderate_gain(),
            minimal_gain: 0.0,
            slight_degradation_gain: default_slight_degradation_gain(),
            sweet_spot_min_gain: default_sweet_spot_min_gain(),
            sweet_spot_max_p95_ms: default_sweet_spot_max_p95_ms(),
            diminishing_min_connections: default_diminishing_min_connections(),
            diminishing_max_gain: default_diminishing_max_gain(),
            inflection_threshold: default_inflection_threshold(),
            latency_penalty_ms: default_latency_penalty_ms(),
            optimal_tps_fraction: default_optimal_tps_fraction(),
            queueing_gap_ratio: default_queueing_gap_ratio(),
            max_stable_cv: default_max_stable_cv(),
            extrapolation_factor: default_extrapolation_factor(),
            bottleneck: BottleneckThresholds::default(),
        }
    }
}

/// A metric that could not be computed, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedMetric {
    pub metric: String,
    pub reason: String,
}

impl DegradedMetric {
    fn new(metric: &str, reason: impl Into<String>) -> Self {
        Self {
            metric: metric.to_string(),
            reason: reason.into(),
        }
    }
}

/// Derived view over all usable band results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Number of complete bands that took part.
    pub bands_analyzed: usize,
    /// Indices of partial or no-data bands that were left out.
    pub skipped_bands: Vec<usize>,
    pub marginal_gains: Vec<MarginalGain>,
    pub second_derivatives: SecondDerivatives,
    pub inflection_points: Vec<InflectionPoint>,
    pub cumulative_capacity: Option<CumulativeCapacity>,
    pub sweet_spot: Option<SweetSpot>,
    pub diminishing_returns: Option<ScalingPoint>,
    pub overload_point: Option<ScalingPoint>,
    pub scaling_regions: Vec<ScalingRegion>,
    pub curve_fit: Option<FitSummary>,
    pub queueing: Vec<QueueingDiagnostic>,
    pub bottleneck: Option<BottleneckAssessment>,
    pub optimal: Option<OptimalConfiguration>,
    pub recommendations: Vec<String>,
    /// Metrics that were skipped for lack of data.
    pub degraded: Vec<DegradedMetric>,
}

impl AnalysisResult {
    /// Marginal gain of the transition ending at `band_index`, if any.
    pub fn gain_into(&self, band_index: usize) -> Option<f64> {
        self.marginal_gains
            .iter()
            .find(|g| g.to_band == band_index)
            .map(|g| g.gain)
    }
}

/// Stateless analyzer configured with a set of thresholds.
#[derive(Debug, Clone, Default)]
pub struct AnalysisEngine {
    thresholds: AnalysisThresholds,
}

impl AnalysisEngine {
    pub fn new(thresholds: AnalysisThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &AnalysisThresholds {
        &self.thresholds
    }

    /// Analyze every complete band in `results`.
    ///
    /// Fails with [`EngineError::InsufficientData`] only when no band is
    /// usable; every other shortfall degrades the affected metric.
    pub fn analyze(&self, results: &[BandResult]) -> Result<AnalysisResult> {
        let t = &self.thresholds;

        let usable: Vec<&BandResult> = results.iter().filter(|r| r.is_fair()).collect();
        let skipped_bands: Vec<usize> = results
            .iter()
            .filter(|r| !r.is_fair())
            .map(|r| r.band_index)
            .collect();

        if usable.is_empty() {
            return Err(EngineError::InsufficientData {
                details: format!(
                    "none of {} band result(s) completed with data",
                    results.len()
                ),
            });
        }
        if !skipped_bands.is_empty() {
            debug!("Skipping bands {:?} in analysis", skipped_bands);
        }

        let mut degraded = Vec::new();

        let marginal_gains = scaling::marginal_gains(&usable, t);
        let second_derivatives = scaling::second_derivatives(&marginal_gains, usable.len());
        if let SecondDerivatives::NotEnoughData { bands } = &second_derivatives {
            degraded.push(DegradedMetric::new(
                "inflection_points",
                format!("needs at least 3 complete bands, have {}", bands),
            ));
        }
        let inflection_points = scaling::inflection_points(&second_derivatives, t);

        let cumulative_capacity = scaling::cumulative_capacity(&usable);
        if cumulative_capacity.is_none() {
            degraded.push(DegradedMetric::new(
                "cumulative_capacity",
                "needs at least 2 complete bands",
            ));
        }

        let sweet_spot = scaling::sweet_spot(&usable, &marginal_gains, t);
        let diminishing_returns = scaling::diminishing_returns_point(&usable, &marginal_gains, t);
        let overload_point = scaling::overload_point(&usable, &marginal_gains);
        let scaling_regions = scaling::scaling_regions(&marginal_gains, t);

        let curve_fit = curve_fit::fit_curves(&usable, t.extrapolation_factor);
        if curve_fit.is_none() {
            degraded.push(DegradedMetric::new(
                "curve_fit",
                "needs at least 2 distinct connection counts",
            ));
        }

        let queueing: Vec<QueueingDiagnostic> = usable
            .iter()
            .filter_map(|b| queueing::diagnose(b, t))
            .collect();
        if queueing.len() < usable.len() {
            degraded.push(DegradedMetric::new(
                "queueing",
                format!(
                    "{} band(s) had no latency or throughput to model",
                    usable.len() - queueing.len()
                ),
            ));
        }

        let bottleneck = queueing::classify_bottleneck(&usable, &queueing, t);
        if bottleneck.is_none() {
            degraded.push(DegradedMetric::new(
                "bottleneck",
                "needs at least 2 complete bands",
            ));
        }

        let optimal = optimal::select_optimal(&usable, t);
        if optimal.is_none() {
            degraded.push(DegradedMetric::new(
                "optimal",
                "no band recorded any throughput",
            ));
        }

        for metric in &degraded {
            warn!("Analysis degraded: {} ({})", metric.metric, metric.reason);
        }

        let mut result = AnalysisResult {
            bands_analyzed: usable.len(),
            skipped_bands,
            marginal_gains,
            second_derivatives,
            inflection_points,
            cumulative_capacity,
            sweet_spot,
            diminishing_returns,
            overload_point,
            scaling_regions,
            curve_fit,
            queueing,
            bottleneck,
            optimal,
            recommendations: Vec::new(),
            degraded,
        };
        result.recommendations = recommendations(&result, &usable, t);
        Ok(result)
    }
}

/// Plain-language advice derived from the computed metrics.
fn recommendations(
    result: &AnalysisResult,
    bands: &[&BandResult],
    t: &AnalysisThresholds,
) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(optimal) = &result.optimal {
        out.push(format!(
            "Run at {} workers / {} connections for {:.0} TPS (confidence {:.0}%)",
            optimal.workers,
            optimal.connections,
            optimal.tps,
            optimal.confidence * 100.0
        ));
    }

    if let Some(spot) = &result.sweet_spot {
        out.push(format!(
            "Connections {}-{} scale at {:.1}+ TPS/connection with P95 under {:.1} ms",
            spot.start_connections, spot.end_connections, spot.min_gain, spot.max_p95_ms
        ));
    }

    if let Some(point) = &result.overload_point {
        out.push(format!(
            "Throughput drops at {} connections; keep load below that level",
            point.connections
        ));
    } else if let Some(point) = &result.diminishing_returns {
        out.push(format!(
            "Beyond {} connections each added connection yields under {:.0} TPS",
            point.connections, t.diminishing_max_gain
        ));
    }

    if let Some(assessment) = &result.bottleneck {
        let advice = match assessment.kind {
            BottleneckKind::ConnectionBound => {
                Some("Connections are saturated; raise the pool size or add replicas")
            }
            BottleneckKind::CpuBound => {
                Some("Throughput is CPU-limited; scale compute before adding connections")
            }
            BottleneckKind::IoBound => {
                Some("Latency exceeds queueing predictions; investigate storage and lock waits")
            }
            BottleneckKind::MemoryBound => {
                Some("Errors grow with load; check memory pressure and connection limits")
            }
            BottleneckKind::None => None,
        };
        if let Some(advice) = advice {
            out.push(format!(
                "{} ({} bottleneck, confidence {:.0}%)",
                advice,
                assessment.kind,
                assessment.confidence * 100.0
            ));
        }
    }

    let extrapolation = result
        .curve_fit
        .as_ref()
        .and_then(|f| f.extrapolation.as_ref());
    if let Some(extrapolation) = extrapolation {
        out.push(format!(
            "The {} fit projects {:.0} TPS at {} connections",
            extrapolation.model, extrapolation.predicted_tps, extrapolation.connections
        ));
    }

    for band in bands {
        if band.coefficient_of_variation > t.max_stable_cv {
            out.push(format!(
                "Band {} throughput varied by {:.0}%; consider longer bands",
                band.band_index + 1,
                band.coefficient_of_variation * 100.0
            ));
        }
    }

    if bands.len() < 3 {
        out.push("Run at least 3 bands to detect inflection points".to_string());
    }

    out
}


#[cfg(test)]
mod tests {
    use super::test_support::band;
    use super::*;
    use crate::models::BandStatus;

    fn four_bands() -> Vec<BandResult> {
        vec![
            band(0, 10, 100.0, 1.0),
            band(1, 20, 200.0, 1.0),
            band(2, 40, 400.0, 1.0),
            band(3, 80, 420.0, 1.0),
        ]
    }

    #[test]
    fn test_empty_input_is_insufficient_data() {
        let err = AnalysisEngine::default().analyze(&[]).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
        assert_eq!(err.code(), "BSC-3001");
    }

    #[test]
    fn test_analysis_is_idempotent() {
        let engine = AnalysisEngine::default();
        let bands = four_bands();
        let first = engine.analyze(&bands).unwrap();
        let second = engine.analyze(&bands).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.bands_analyzed, 4);
        assert_eq!(first.marginal_gains.len(), 3);
        assert_eq!(
            first.marginal_gains[2].interpretation,
            GainInterpretation::Minimal
        );
    }

    #[test]
    fn test_partial_and_empty_bands_are_skipped() {
        let mut bands = four_bands();
        bands[1].status = BandStatus::Partial;
        bands.push(BandResult::no_data(&crate::models::BandPlan {
            index: 4,
            workers: 160,
            connections: 160,
        }));

        let result = AnalysisEngine::default().analyze(&bands).unwrap();
        assert_eq!(result.bands_analyzed, 3);
        assert_eq!(result.skipped_bands, vec![1, 4]);
        assert_eq!(result.marginal_gains[0].from_band, 0);
        assert_eq!(result.marginal_gains[0].to_band, 2);
    }

    #[test]
    fn test_single_band_degrades_gracefully() {
        let result = AnalysisEngine::default()
            .analyze(&[band(0, 10, 100.0, 1.0)])
            .unwrap();

        assert!(result.marginal_gains.is_empty());
        assert!(result.cumulative_capacity.is_none());
        assert!(result.curve_fit.is_none());
        assert!(result.bottleneck.is_none());
        assert_eq!(
            result.second_derivatives,
            SecondDerivatives::NotEnoughData { bands: 1 }
        );
        assert_eq!(result.optimal.as_ref().unwrap().band_index, 0);

        let degraded: Vec<&str> = result.degraded.iter().map(|d| d.metric.as_str()).collect();
        assert!(degraded.contains(&"inflection_points"));
        assert!(degraded.contains(&"curve_fit"));
        assert!(result
            .recommendations
            .iter()
            .any(|r| r.contains("at least 3 bands")));
    }

    #[test]
    fn test_overload_is_reported() {
        let bands = vec![band(0, 10, 500.0, 1.0), band(1, 20, 450.0, 2.0)];
        let result = AnalysisEngine::default().analyze(&bands).unwrap();

        let overload = result.overload_point.as_ref().unwrap();
        assert_eq!(overload.band_index, 1);
        assert!(result.gain_into(1).unwrap() < 0.0);
        assert!(result.gain_into(0).is_none());
        assert!(result
            .recommendations
            .iter()
            .any(|r| r.contains("Throughput drops at 20 connections")));
    }

    #[test]
    fn test_thresholds_deserialize_with_defaults() {
        let thresholds: AnalysisThresholds =
            toml::from_str("excellent_gain = 75.0\n[bottleneck]\nsaturation_utilization = 0.9\n")
                .unwrap();
        assert_eq!(thresholds.excellent_gain, 75.0);
        assert_eq!(thresholds.good_gain, 20.0);
        assert_eq!(thresholds.bottleneck.saturation_utilization, 0.9);
        assert_eq!(thresholds.bottleneck.io_latency_exponent, 1.0);
    }
}
