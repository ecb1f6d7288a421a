//! Least-squares fits of throughput against connections.

use crate::models::BandResult;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveModel {
    /// `tps = a + b·c`
    Linear,
    /// `tps = a + b·ln(c)`
    Logarithmic,
    /// `tps = a·e^(b·c)`
    Exponential,
}

impl fmt::Display for CurveModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Logarithmic => write!(f, "logarithmic"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveFit {
    pub model: CurveModel,
    pub a: f64,
    pub b: f64,
    /// Coefficient of determination in the original (untransformed) space.
    pub r_squared: f64,
}

impl CurveFit {
    pub fn predict(&self, connections: f64) -> f64 {
        match self.model {
            CurveModel::Linear => self.a + self.b * connections,
            CurveModel::Logarithmic => self.a + self.b * connections.ln(),
            CurveModel::Exponential => self.a * (self.b * connections).exp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extrapolation {
    pub model: CurveModel,
    pub connections: u32,
    pub predicted_tps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub fits: Vec<CurveFit>,
    pub best: Option<CurveModel>,
    pub extrapolation: Option<Extrapolation>,
}

impl FitSummary {
    pub fn best_fit(&self) -> Option<&CurveFit> {
        self.best
            .and_then(|model| self.fits.iter().find(|fit| fit.model == model))
    }
}

/// Fit every model the data admits, pick the best by R², and extrapolate
/// to `extrapolation_factor` times the largest tested connection count.
///
/// Returns `None` with fewer than two distinct connection counts.
pub fn fit_curves(bands: &[&BandResult], extrapolation_factor: f64) -> Option<FitSummary> {
    let xs: Vec<f64> = bands.iter().map(|b| b.connections as f64).collect();
    let ys: Vec<f64> = bands.iter().map(|b| b.total_tps).collect();

    let mut fits = Vec::new();

    if let Some((a, b)) = least_squares(&xs, &ys) {
        fits.push(finish(CurveModel::Linear, a, b, &xs, &ys));
    }

    if xs.iter().all(|x| *x > 0.0) {
        let log_xs: Vec<f64> = xs.iter().map(|x| x.ln()).collect();
        if let Some((a, b)) = least_squares(&log_xs, &ys) {
            fits.push(finish(CurveModel::Logarithmic, a, b, &xs, &ys));
        }
    }

    if ys.iter().all(|y| *y > 0.0) {
        let log_ys: Vec<f64> = ys.iter().map(|y| y.ln()).collect();
        if let Some((ln_a, b)) = least_squares(&xs, &log_ys) {
            fits.push(finish(CurveModel::Exponential, ln_a.exp(), b, &xs, &ys));
        }
    }

    fits.retain(|fit| fit.a.is_finite() && fit.b.is_finite() && fit.r_squared.is_finite());
    if fits.is_empty() {
        return None;
    }

    let best = fits
        .iter()
        .fold(None::<&CurveFit>, |best, fit| match best {
            Some(current) if current.r_squared >= fit.r_squared => Some(current),
            _ => Some(fit),
        })
        .map(|fit| fit.model);

    let max_connections = bands.iter().map(|b| b.connections).max().unwrap_or(0);
    let target = (max_connections as f64 * extrapolation_factor).round();
    let extrapolation = best
        .and_then(|model| fits.iter().find(|fit| fit.model == model))
        .and_then(|fit| {
            let predicted_tps = fit.predict(target);
            (predicted_tps.is_finite() && target <= u32::MAX as f64).then(|| Extrapolation {
                model: fit.model,
                connections: target as u32,
                predicted_tps,
            })
        });

    Some(FitSummary {
        fits,
        best,
        extrapolation,
    })
}

fn finish(model: CurveModel, a: f64, b: f64, xs: &[f64], ys: &[f64]) -> CurveFit {
    let mut fit = CurveFit {
        model,
        a,
        b,
        r_squared: 0.0,
    };
    let predicted: Vec<f64> = xs.iter().map(|x| fit.predict(*x)).collect();
    fit.r_squared = r_squared(ys, &predicted);
    fit
}

/// Ordinary least squares; `(intercept, slope)`.
fn least_squares(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    let n = xs.len() as f64;
    if xs.len() < 2 {
        return None;
    }
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let sxx: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
    if sxx <= f64::EPSILON {
        return None;
    }
    let sxy: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let slope = sxy / sxx;
    Some((mean_y - slope * mean_x, slope))
}

fn r_squared(observed: &[f64], predicted: &[f64]) -> f64 {
    let mean = observed.iter().sum::<f64>() / observed.len() as f64;
    let ss_tot: f64 = observed.iter().map(|y| (y - mean).powi(2)).sum();
    let ss_res: f64 = observed
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    if ss_tot <= f64::EPSILON {
        if ss_res <= 1e-9 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::test_support::band;

    #[test]
    fn test_perfect_linear_data_prefers_linear() {
        let bands: Vec<BandResult> = (1..=5)
            .map(|i| band(i - 1, i as u32 * 10, 100.0 + 20.0 * (i as f64 * 10.0), 1.0))
            .collect();
        let refs: Vec<&BandResult> = bands.iter().collect();

        let summary = fit_curves(&refs, 2.0).unwrap();
        assert_eq!(summary.best, Some(CurveModel::Linear));

        let linear = summary.best_fit().unwrap();
        assert!((linear.a - 100.0).abs() < 1e-6);
        assert!((linear.b - 20.0).abs() < 1e-9);
        assert!((linear.r_squared - 1.0).abs() < 1e-12);

        let extrapolation = summary.extrapolation.unwrap();
        assert_eq!(extrapolation.connections, 100);
        assert!((extrapolation.predicted_tps - 2_100.0).abs() < 1e-6);
    }

    #[test]
    fn test_logarithmic_data_prefers_logarithmic() {
        let bands: Vec<BandResult> = [1u32, 2, 4, 8, 16, 32]
            .iter()
            .enumerate()
            .map(|(i, c)| band(i, *c, 500.0 + 300.0 * (*c as f64).ln(), 1.0))
            .collect();
        let refs: Vec<&BandResult> = bands.iter().collect();

        let summary = fit_curves(&refs, 2.0).unwrap();
        assert_eq!(summary.best, Some(CurveModel::Logarithmic));
        assert_eq!(summary.fits.len(), 3);
    }

    #[test]
    fn test_single_connection_count_cannot_be_fit() {
        let bands = vec![band(0, 10, 100.0, 1.0), band(1, 10, 120.0, 1.0)];
        let refs: Vec<&BandResult> = bands.iter().collect();
        assert!(fit_curves(&refs, 2.0).is_none());
        assert!(fit_curves(&refs[..1], 2.0).is_none());
    }

    #[test]
    fn test_zero_throughput_skips_exponential() {
        let bands = vec![band(0, 1, 0.0, 1.0), band(1, 2, 100.0, 1.0), band(2, 3, 200.0, 1.0)];
        let refs: Vec<&BandResult> = bands.iter().collect();
        let summary = fit_curves(&refs, 2.0).unwrap();
        assert!(summary
            .fits
            .iter()
            .all(|fit| fit.model != CurveModel::Exponential));
    }
}
