//! M/M/c queueing diagnostics and bottleneck classification.
//!
//! Each band is treated as an M/M/c system with one server per connection:
//! arrival rate λ is the measured TPS, per-server service rate μ is the
//! reciprocal of the mean latency. Erlang C gives the probability of
//! waiting and from that the theoretical response time, which is compared
//! against the observed P95.

use super::AnalysisThresholds;
use crate::models::BandResult;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueingDiagnostic {
    pub band_index: usize,
    pub servers: u32,
    /// λ, ops/sec.
    pub arrival_rate: f64,
    /// μ per server, ops/sec.
    pub service_rate: f64,
    /// ρ = λ / (c·μ).
    pub utilization: f64,
    pub wait_probability: Option<f64>,
    pub theoretical_wait_ms: Option<f64>,
    pub theoretical_response_ms: Option<f64>,
    pub observed_p95_ms: f64,
    /// Observed P95 divided by the theoretical response time.
    pub gap_ratio: Option<f64>,
    /// ρ ≥ 1: the queue grows without bound.
    pub saturated: bool,
    /// Observed latency far exceeds what queueing alone explains.
    pub unexplained_latency: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    ConnectionBound,
    CpuBound,
    IoBound,
    MemoryBound,
    None,
}

impl fmt::Display for BottleneckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionBound => write!(f, "connection-bound"),
            Self::CpuBound => write!(f, "cpu-bound"),
            Self::IoBound => write!(f, "io-bound"),
            Self::MemoryBound => write!(f, "memory-bound"),
            Self::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckAssessment {
    pub kind: BottleneckKind,
    pub confidence: f64,
    pub evidence: Vec<String>,
}

/// Thresholds for the bottleneck classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckThresholds {
    /// Utilization above which a band counts as near saturation.
    #[serde(default = "default_saturation_utilization")]
    pub saturation_utilization: f64,

    /// Latency-vs-connections log-log slope that indicates I/O waits.
    #[serde(default = "default_io_latency_exponent")]
    pub io_latency_exponent: f64,

    /// Slope that indicates CPU contention.
    #[serde(default = "default_cpu_latency_exponent")]
    pub cpu_latency_exponent: f64,

    /// Growth of errors/sec from first to last band that indicates exhaustion.
    #[serde(default = "default_error_growth")]
    pub error_growth_per_sec: f64,
}

fn default_saturation_utilization() -> f64 {
    0.85
}

fn default_io_latency_exponent() -> f64 {
    1.0
}

fn default_cpu_latency_exponent() -> f64 {
    0.5
}

fn default_error_growth() -> f64 {
    1.0
}

impl Default for BottleneckThresholds {
    fn default() -> Self {
        Self {
            saturation_utilization: default_saturation_utilization(),
            io_latency_exponent: default_io_latency_exponent(),
            cpu_latency_exponent: default_cpu_latency_exponent(),
            error_growth_per_sec: default_error_growth(),
        }
    }
}

/// Diagnose one band. `None` when the band has no latency to derive μ from.
pub fn diagnose(band: &BandResult, thresholds: &AnalysisThresholds) -> Option<QueueingDiagnostic> {
    if band.avg_latency_ms <= 0.0 || band.total_tps <= 0.0 {
        return None;
    }

    let servers = band.connections.max(1);
    let c = servers as f64;
    let lambda = band.total_tps;
    let mu = 1_000.0 / band.avg_latency_ms;
    let utilization = lambda / (c * mu);
    let saturated = utilization >= 1.0;

    let (wait_probability, theoretical_wait_ms, theoretical_response_ms) = if saturated {
        (None, None, None)
    } else {
        let p_wait = erlang_c(servers, lambda / mu);
        let wait_secs = p_wait / (c * mu - lambda);
        let response_ms = (wait_secs + 1.0 / mu) * 1_000.0;
        (Some(p_wait), Some(wait_secs * 1_000.0), Some(response_ms))
    };

    let gap_ratio = theoretical_response_ms
        .filter(|r| *r > 0.0)
        .map(|r| band.p95_latency_ms / r);
    let unexplained_latency = gap_ratio.map_or(false, |g| g > thresholds.queueing_gap_ratio);

    Some(QueueingDiagnostic {
        band_index: band.band_index,
        servers,
        arrival_rate: lambda,
        service_rate: mu,
        utilization,
        wait_probability,
        theoretical_wait_ms,
        theoretical_response_ms,
        observed_p95_ms: band.p95_latency_ms,
        gap_ratio,
        saturated,
        unexplained_latency,
    })
}

/// Probability that an arrival waits, for `servers` servers at offered load `a` (Erlangs).
///
/// Computed from Erlang B by the stable recursion `B(k) = a·B(k-1) / (k + a·B(k-1))`.
pub fn erlang_c(servers: u32, offered_load: f64) -> f64 {
    let c = servers.max(1) as f64;
    let rho = offered_load / c;
    if rho >= 1.0 {
        return 1.0;
    }
    let mut b = 1.0;
    for k in 1..=servers.max(1) {
        b = offered_load * b / (k as f64 + offered_load * b);
    }
    b / (1.0 - rho * (1.0 - b))
}

/// Classify the dominant bottleneck across bands. `None` with fewer than two bands.
pub fn classify_bottleneck(
    bands: &[&BandResult],
    diagnostics: &[QueueingDiagnostic],
    thresholds: &AnalysisThresholds,
) -> Option<BottleneckAssessment> {
    if bands.len() < 2 {
        return None;
    }
    let limits = &thresholds.bottleneck;
    let mut evidence = Vec::new();

    let peak_utilization = diagnostics
        .iter()
        .map(|d| d.utilization)
        .fold(0.0f64, f64::max);
    let near_saturation = peak_utilization >= limits.saturation_utilization;
    if near_saturation {
        evidence.push(format!("peak utilization {:.2}", peak_utilization));
    }

    let unexplained = diagnostics.iter().filter(|d| d.unexplained_latency).count();
    let mostly_unexplained = !diagnostics.is_empty() && unexplained * 2 > diagnostics.len();
    if mostly_unexplained {
        evidence.push(format!(
            "P95 exceeds queueing prediction in {}/{} bands",
            unexplained,
            diagnostics.len()
        ));
    }

    let exponent = latency_exponent(bands);
    if let Some(e) = exponent {
        evidence.push(format!("latency grows as connections^{:.2}", e));
    }
    let exponent = exponent.unwrap_or(0.0);

    let first = bands[0];
    let last = bands[bands.len() - 1];
    let error_growth = last.error_rate - first.error_rate;
    let errors_growing = error_growth >= limits.error_growth_per_sec;
    if errors_growing {
        evidence.push(format!("error rate grew by {:.2}/s", error_growth));
    }

    let last_gain = {
        let prev = bands[bands.len() - 2];
        let delta = last.connections as f64 - prev.connections as f64;
        if delta == 0.0 {
            0.0
        } else {
            (last.total_tps - prev.total_tps) / delta
        }
    };
    let plateau = last_gain < thresholds.diminishing_max_gain;
    if plateau {
        evidence.push(format!("final marginal gain {:.2} TPS/conn", last_gain));
    }

    let (kind, signals): (BottleneckKind, Vec<bool>) =
        if errors_growing && (exponent >= limits.io_latency_exponent || plateau) {
            (
                BottleneckKind::MemoryBound,
                vec![errors_growing, exponent >= limits.io_latency_exponent, plateau],
            )
        } else if mostly_unexplained && exponent >= limits.io_latency_exponent {
            (
                BottleneckKind::IoBound,
                vec![mostly_unexplained, exponent >= limits.io_latency_exponent, plateau],
            )
        } else if near_saturation && !mostly_unexplained {
            (BottleneckKind::ConnectionBound, vec![near_saturation, plateau])
        } else if plateau && exponent >= limits.cpu_latency_exponent {
            (
                BottleneckKind::CpuBound,
                vec![plateau, exponent >= limits.cpu_latency_exponent, near_saturation],
            )
        } else {
            (BottleneckKind::None, Vec::new())
        };

    let confidence = if signals.is_empty() {
        let distance = (exponent / limits.cpu_latency_exponent.max(f64::EPSILON)).min(1.0);
        (1.0 - distance).clamp(0.0, 1.0)
    } else {
        signals.iter().filter(|s| **s).count() as f64 / signals.len() as f64
    };

    Some(BottleneckAssessment {
        kind,
        confidence,
        evidence,
    })
}

/// Log-log slope of average latency against connections.
fn latency_exponent(bands: &[&BandResult]) -> Option<f64> {
    let points: Vec<(f64, f64)> = bands
        .iter()
        .filter(|b| b.avg_latency_ms > 0.0 && b.connections > 0)
        .map(|b| ((b.connections as f64).ln(), b.avg_latency_ms.ln()))
        .collect();
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    if sxx <= f64::EPSILON {
        return None;
    }
    let sxy: f64 = points
        .iter()
        .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
        .sum();
    Some(sxy / sxx)
}
