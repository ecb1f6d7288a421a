//! Markdown report generation.
//!
//! This module renders a [`ResultDocument`] as a human-readable Markdown
//! summary: run metadata, the per-band table, scaling analysis and the
//! recommended configuration.

use super::ResultDocument;
use crate::analysis::{AnalysisResult, OptimalConfiguration, SecondDerivatives};
use crate::checkpoint::TestMetadata;
use crate::models::{BandResult, BandStatus};

/// Generate a complete Markdown report.
pub fn generate_markdown_report(document: &ResultDocument) -> String {
    let mut output = String::new();

    output.push_str("# Scaling Test Report\n\n");
    output.push_str(&generate_metadata_section(&document.metadata, document));
    output.push_str(&generate_bands_section(document));

    match &document.analysis {
        Some(analysis) => output.push_str(&generate_analysis_section(analysis)),
        None => output.push_str("## Analysis\n\nNo band completed with data.\n\n"),
    }

    if let Some(optimal) = &document.optimal_configuration {
        output.push_str(&generate_optimal_section(optimal));
    }

    if let Some(analysis) = &document.analysis {
        output.push_str(&generate_recommendations_section(&analysis.recommendations));
    }

    output.push_str(&generate_footer());
    output
}

fn generate_metadata_section(metadata: &TestMetadata, document: &ResultDocument) -> String {
    let config = &metadata.configuration;
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Run:** `{}`\n", metadata.run_id));
    section.push_str(&format!(
        "- **Started:** {}\n",
        metadata.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Executor:** {}\n", metadata.executor));
    section.push_str(&format!("- **Status:** {}\n", document.status));
    section.push_str(&format!(
        "- **Strategy:** {} ({} bands, {}-{} workers, {}-{} connections)\n",
        config.strategy,
        metadata.plan.len(),
        config.min_workers,
        config.max_workers,
        config.min_connections,
        config.max_connections
    ));
    section.push_str(&format!(
        "- **Band timing:** {:?} warmup, {:?} run, {:?} cooldown\n",
        config.warmup, config.band_duration, config.cooldown
    ));
    section.push('\n');

    section
}

fn generate_bands_section(document: &ResultDocument) -> String {
    let mut section = String::new();

    section.push_str("## Bands\n\n");
    if document.bands.is_empty() {
        section.push_str("No bands were committed.\n\n");
    } else {
        section.push_str(concat!(
            "| Band | Workers | Conns | TPS | Avg ms | P50 ms | P95 ms | P99 ms ",
            "| Errors/s | Gain | Status |\n"
        ));
        section.push_str("|---:|---:|---:|---:|---:|---:|---:|---:|---:|---:|:---|\n");
        for band in &document.bands {
            let gain = document
                .marginal_gain(band.band_index)
                .map(|g| format!("{:.2}", g))
                .unwrap_or_else(|| "-".to_string());
            section.push_str(&band_row(band, &gain));
        }
        section.push('\n');
    }

    if !document.partial_bands.is_empty() {
        section.push_str("### Interrupted Bands\n\n");
        section.push_str(
            "These bands were cut short and are excluded from the analysis.\n\n",
        );
        for band in &document.partial_bands {
            section.push_str(&format!(
                "- Band {} ({}w/{}c): {} operations over {:.1}s, {:.1} TPS\n",
                band.band_index + 1,
                band.workers,
                band.connections,
                band.total_operations,
                band.duration.as_secs_f64(),
                band.total_tps
            ));
        }
        section.push('\n');
    }

    section
}

fn band_row(band: &BandResult, gain: &str) -> String {
    if band.status == BandStatus::NoDataCollected {
        return format!(
            "| {} | {} | {} | - | - | - | - | - | - | - | {} |\n",
            band.band_index + 1,
            band.workers,
            band.connections,
            band.status
        );
    }
    format!(
        "| {} | {} | {} | {:.1} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {} | {} |\n",
        band.band_index + 1,
        band.workers,
        band.connections,
        band.total_tps,
        band.avg_latency_ms,
        band.p50_latency_ms,
        band.p95_latency_ms,
        band.p99_latency_ms,
        band.error_rate,
        gain,
        band.status
    )
}

fn generate_analysis_section(analysis: &AnalysisResult) -> String {
    let mut section = String::new();

    section.push_str("## Analysis\n\n");

    if !analysis.marginal_gains.is_empty() {
        section.push_str("### Marginal Gains\n\n");
        section.push_str("| Transition | Connections | TPS/conn | Reading |\n");
        section.push_str("|:---|:---|---:|:---|\n");
        for gain in &analysis.marginal_gains {
            section.push_str(&format!(
                "| {} → {} | {} → {} | {:.2} | {} |\n",
                gain.from_band + 1,
                gain.to_band + 1,
                gain.from_connections,
                gain.to_connections,
                gain.gain,
                gain.interpretation
            ));
        }
        section.push('\n');
    }

    if !analysis.scaling_regions.is_empty() {
        section.push_str("### Scaling Regions\n\n");
        for region in &analysis.scaling_regions {
            section.push_str(&format!(
                "- **{}**: {}-{} connections (avg {:.2} TPS/conn)\n",
                region.kind, region.start_connections, region.end_connections, region.avg_gain
            ));
        }
        section.push('\n');
    }

    section.push_str("### Curve Features\n\n");
    match &analysis.second_derivatives {
        SecondDerivatives::NotEnoughData { bands } => section.push_str(&format!(
            "- Inflection points: not enough data ({} complete bands)\n",
            bands
        )),
        SecondDerivatives::Computed { .. } if analysis.inflection_points.is_empty() => {
            section.push_str("- Inflection points: none\n")
        }
        SecondDerivatives::Computed { .. } => {
            for point in &analysis.inflection_points {
                section.push_str(&format!(
                    "- Inflection at {} connections ({:?}, {:.4})\n",
                    point.connections, point.kind, point.second_derivative
                ));
            }
        }
    }
    if let Some(capacity) = &analysis.cumulative_capacity {
        section.push_str(&format!(
            "- Cumulative capacity (AUC): {:.0}\n",
            capacity.total
        ));
    }
    if let Some(spot) = &analysis.sweet_spot {
        section.push_str(&format!(
            "- Sweet spot: {}-{} connections\n",
            spot.start_connections, spot.end_connections
        ));
    }
    if let Some(point) = &analysis.diminishing_returns {
        section.push_str(&format!(
            "- Diminishing returns from {} connections\n",
            point.connections
        ));
    }
    if let Some(point) = &analysis.overload_point {
        section.push_str(&format!("- Overload at {} connections\n", point.connections));
    }
    if let Some(fit) = analysis.curve_fit.as_ref().and_then(|f| f.best_fit()) {
        section.push_str(&format!(
            "- Best fit: {} (R² {:.3})\n",
            fit.model, fit.r_squared
        ));
    }
    if let Some(bottleneck) = &analysis.bottleneck {
        section.push_str(&format!(
            "- Bottleneck: {} (confidence {:.0}%)\n",
            bottleneck.kind,
            bottleneck.confidence * 100.0
        ));
    }
    section.push('\n');

    section
}

fn generate_optimal_section(optimal: &OptimalConfiguration) -> String {
    let mut section = String::new();

    section.push_str("## Optimal Configuration\n\n");
    section.push_str(&format!(
        "**{} workers / {} connections**: {:.1} TPS at {:.2} ms mean latency\n\n",
        optimal.workers, optimal.connections, optimal.tps, optimal.avg_latency_ms
    ));
    section.push_str(&format!(
        "Score {:.2}, confidence {:.0}%. {}\n\n",
        optimal.score,
        optimal.confidence * 100.0,
        optimal.reasoning
    ));

    section
}

fn generate_recommendations_section(recommendations: &[String]) -> String {
    if recommendations.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Recommendations\n\n");
    for (i, rec) in recommendations.iter().enumerate() {
        section.push_str(&format!("{}. {}\n", i + 1, rec));
    }
    section.push('\n');

    section
}

fn generate_footer() -> String {
    "---\n\n*Report generated by bandscale*\n".to_string()
}
