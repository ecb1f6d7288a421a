//! Discrete-derivative analysis of the throughput-vs-connections curve.
//!
//! All functions take the usable bands in plan order and are pure.

use super::AnalysisThresholds;
use crate::models::BandResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Qualitative reading of a marginal gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainInterpretation {
    Excellent,
    Good,
    Moderate,
    Minimal,
    SlightDegradation,
    Overloaded,
}

impl GainInterpretation {
    pub fn classify(gain: f64, thresholds: &AnalysisThresholds) -> Self {
        if gain > thresholds.excellent_gain {
            Self::Excellent
        } else if gain >= thresholds.good_gain {
            Self::Good
        } else if gain >= thresholds.moderate_gain {
            Self::Moderate
        } else if gain >= thresholds.minimal_gain {
            Self::Minimal
        } else if gain >= thresholds.slight_degradation_gain {
            Self::SlightDegradation
        } else {
            Self::Overloaded
        }
    }
}

impl fmt::Display for GainInterpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excellent => write!(f, "excellent scaling"),
            Self::Good => write!(f, "good scaling"),
            Self::Moderate => write!(f, "moderate gains"),
            Self::Minimal => write!(f, "minimal gains"),
            Self::SlightDegradation => write!(f, "slight degradation"),
            Self::Overloaded => write!(f, "overloaded"),
        }
    }
}

/// First derivative of throughput between two adjacent bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginalGain {
    pub from_band: usize,
    pub to_band: usize,
    pub from_connections: u32,
    pub to_connections: u32,
    pub delta_tps: f64,
    /// TPS gained per added connection.
    pub gain: f64,
    pub interpretation: GainInterpretation,
}

/// Second derivative at the band shared by two transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondDerivative {
    pub band_index: usize,
    pub connections: u32,
    pub value: f64,
}

/// Second-derivative availability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SecondDerivatives {
    NotEnoughData { bands: usize },
    Computed { values: Vec<SecondDerivative> },
}

/// Direction of a change in scaling behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InflectionKind {
    Acceleration,
    Deceleration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InflectionPoint {
    pub band_index: usize,
    pub connections: u32,
    pub second_derivative: f64,
    pub kind: InflectionKind,
}

/// Area under the throughput-vs-connections curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CumulativeCapacity {
    pub total: f64,
    /// Trapezoid area per transition, in band order.
    pub segments: Vec<f64>,
}

/// A notable band on the curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPoint {
    pub band_index: usize,
    pub workers: u32,
    pub connections: u32,
    pub tps: f64,
    pub gain: f64,
}

/// Contiguous bands with high gain and low latency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweetSpot {
    pub start_band: usize,
    pub end_band: usize,
    pub start_connections: u32,
    pub end_connections: u32,
    pub min_gain: f64,
    pub max_p95_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    LinearScaling,
    DiminishingReturns,
    Degradation,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinearScaling => write!(f, "linear scaling"),
            Self::DiminishingReturns => write!(f, "diminishing returns"),
            Self::Degradation => write!(f, "degradation"),
        }
    }
}

/// Run of transitions that share a region kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRegion {
    pub kind: RegionKind,
    pub start_band: usize,
    pub end_band: usize,
    pub start_connections: u32,
    pub end_connections: u32,
    pub avg_gain: f64,
}

/// ΔTPS/ΔConns for every adjacent pair; 0 when connections did not change.
pub fn marginal_gains(bands: &[&BandResult], thresholds: &AnalysisThresholds) -> Vec<MarginalGain> {
    bands
        .windows(2)
        .map(|pair| {
            let (prev, next) = (pair[0], pair[1]);
            let delta_tps = next.total_tps - prev.total_tps;
            let delta_conns = next.connections as f64 - prev.connections as f64;
            let gain = if delta_conns == 0.0 {
                0.0
            } else {
                delta_tps / delta_conns
            };
            MarginalGain {
                from_band: prev.band_index,
                to_band: next.band_index,
                from_connections: prev.connections,
                to_connections: next.connections,
                delta_tps,
                gain,
                interpretation: GainInterpretation::classify(gain, thresholds),
            }
        })
        .collect()
}

/// Change in gain per connection between transition midpoints.
pub fn second_derivatives(gains: &[MarginalGain], band_count: usize) -> SecondDerivatives {
    if band_count < 3 {
        return SecondDerivatives::NotEnoughData { bands: band_count };
    }

    let midpoint = |g: &MarginalGain| (g.from_connections as f64 + g.to_connections as f64) / 2.0;
    let values = gains
        .windows(2)
        .map(|pair| {
            let (prev, next) = (&pair[0], &pair[1]);
            let delta_mid = midpoint(next) - midpoint(prev);
            let value = if delta_mid == 0.0 {
                0.0
            } else {
                (next.gain - prev.gain) / delta_mid
            };
            SecondDerivative {
                band_index: next.from_band,
                connections: next.from_connections,
                value,
            }
        })
        .collect();

    SecondDerivatives::Computed { values }
}

/// Points where the curvature flips sign or is large enough to matter.
pub fn inflection_points(
    derivatives: &SecondDerivatives,
    thresholds: &AnalysisThresholds,
) -> Vec<InflectionPoint> {
    let SecondDerivatives::Computed { values } = derivatives else {
        return Vec::new();
    };

    let mut points = Vec::new();
    let mut previous_sign = 0.0f64;
    for d in values {
        let sign = if d.value.abs() < f64::EPSILON {
            0.0
        } else {
            d.value.signum()
        };
        let flipped = sign != 0.0 && previous_sign != 0.0 && sign != previous_sign;
        if flipped || d.value.abs() >= thresholds.inflection_threshold {
            points.push(InflectionPoint {
                band_index: d.band_index,
                connections: d.connections,
                second_derivative: d.value,
                kind: if d.value >= 0.0 {
                    InflectionKind::Acceleration
                } else {
                    InflectionKind::Deceleration
                },
            });
        }
        if sign != 0.0 {
            previous_sign = sign;
        }
    }
    points
}

/// Trapezoidal AUC; needs at least two bands.
pub fn cumulative_capacity(bands: &[&BandResult]) -> Option<CumulativeCapacity> {
    if bands.len() < 2 {
        return None;
    }
    let segments: Vec<f64> = bands
        .windows(2)
        .map(|pair| {
            let width = pair[1].connections as f64 - pair[0].connections as f64;
            (pair[0].total_tps + pair[1].total_tps) / 2.0 * width
        })
        .collect();
    Some(CumulativeCapacity {
        total: segments.iter().sum(),
        segments,
    })
}

/// Longest run of consecutive bands with gain and P95 inside the sweet-spot bounds.
pub fn sweet_spot(
    bands: &[&BandResult],
    gains: &[MarginalGain],
    thresholds: &AnalysisThresholds,
) -> Option<SweetSpot> {
    // gains[i] ends at bands[i + 1]
    let qualifies = |i: usize| {
        gains[i].gain >= thresholds.sweet_spot_min_gain
            && bands[i + 1].p95_latency_ms <= thresholds.sweet_spot_max_p95_ms
    };

    let mut best: Option<(usize, usize)> = None;
    let mut start: Option<usize> = None;
    for i in 0..gains.len() {
        if qualifies(i) {
            let s = *start.get_or_insert(i);
            let longer = best.map_or(true, |(bs, be)| i - s > be - bs);
            if longer {
                best = Some((s, i));
            }
        } else {
            start = None;
        }
    }

    best.map(|(s, e)| {
        let run = &bands[s + 1..=e + 1];
        SweetSpot {
            start_band: run[0].band_index,
            end_band: run[run.len() - 1].band_index,
            start_connections: run[0].connections,
            end_connections: run[run.len() - 1].connections,
            min_gain: gains[s..=e]
                .iter()
                .map(|g| g.gain)
                .fold(f64::INFINITY, f64::min),
            max_p95_ms: run.iter().map(|b| b.p95_latency_ms).fold(0.0, f64::max),
        }
    })
}

/// First band past the connection floor whose gain has dropped below the cut-off.
pub fn diminishing_returns_point(
    bands: &[&BandResult],
    gains: &[MarginalGain],
    thresholds: &AnalysisThresholds,
) -> Option<ScalingPoint> {
    gains.iter().enumerate().find_map(|(i, g)| {
        let band = bands[i + 1];
        (band.connections >= thresholds.diminishing_min_connections
            && g.gain < thresholds.diminishing_max_gain)
            .then(|| point(band, g.gain))
    })
}

/// First band whose throughput fell below the previous band's.
pub fn overload_point(bands: &[&BandResult], gains: &[MarginalGain]) -> Option<ScalingPoint> {
    gains.iter().enumerate().find_map(|(i, g)| {
        (bands[i + 1].total_tps < bands[i].total_tps).then(|| point(bands[i + 1], g.gain))
    })
}

/// Group consecutive transitions by region kind.
pub fn scaling_regions(
    gains: &[MarginalGain],
    thresholds: &AnalysisThresholds,
) -> Vec<ScalingRegion> {
    let kind_of = |gain: f64| {
        if gain >= thresholds.moderate_gain {
            RegionKind::LinearScaling
        } else if gain >= 0.0 {
            RegionKind::DiminishingReturns
        } else {
            RegionKind::Degradation
        }
    };

    let mut regions: Vec<(RegionKind, Vec<&MarginalGain>)> = Vec::new();
    for gain in gains {
        let kind = kind_of(gain.gain);
        match regions.last_mut() {
            Some((last, members)) if *last == kind => members.push(gain),
            _ => regions.push((kind, vec![gain])),
        }
    }

    regions
        .into_iter()
        .map(|(kind, members)| {
            let first = members[0];
            let last = members[members.len() - 1];
            ScalingRegion {
                kind,
                start_band: first.from_band,
                end_band: last.to_band,
                start_connections: first.from_connections,
                end_connections: last.to_connections,
                avg_gain: members.iter().map(|g| g.gain).sum::<f64>() / members.len() as f64,
            }
        })
        .collect()
}

fn point(band: &BandResult, gain: f64) -> ScalingPoint {
    ScalingPoint {
        band_index: band.band_index,
        workers: band.workers,
        connections: band.connections,
        tps: band.total_tps,
        gain,
    }
}
