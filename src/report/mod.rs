//! Result documents and their export formats.

pub mod generator;
pub mod tabular;

pub use generator::generate_markdown_report;
pub use tabular::{generate_csv_report, CSV_HEADER};

use crate::analysis::{AnalysisEngine, AnalysisResult, OptimalConfiguration};
use crate::checkpoint::{CheckpointState, RunStatus, TestMetadata};
use crate::error::Result;
use crate::models::BandResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported export formats.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
    Markdown,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Markdown => "md",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "json"),
            ExportFormat::Csv => write!(f, "csv"),
            ExportFormat::Markdown => write!(f, "markdown"),
        }
    }
}

/// Everything a run produced, in presentation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    pub metadata: TestMetadata,
    pub status: RunStatus,
    /// Committed bands in plan order.
    pub bands: Vec<BandResult>,
    /// Interrupted bands, reported separately.
    pub partial_bands: Vec<BandResult>,
    pub optimal_configuration: Option<OptimalConfiguration>,
    pub analysis: Option<AnalysisResult>,
}

impl ResultDocument {
    /// Build a document from a run state, recomputing the analysis.
    pub fn from_state(state: &CheckpointState, engine: &AnalysisEngine) -> Self {
        let analysis = engine.analyze(&state.results).ok();
        Self {
            metadata: state.metadata.clone(),
            status: state.execution.status,
            bands: state.results.clone(),
            partial_bands: state.partial_results.clone(),
            optimal_configuration: analysis.as_ref().and_then(|a| a.optimal.clone()),
            analysis,
        }
    }

    /// Marginal gain into `band_index`, when one was computed.
    pub fn marginal_gain(&self, band_index: usize) -> Option<f64> {
        self.analysis
            .as_ref()
            .and_then(|analysis| analysis.gain_into(band_index))
    }
}

/// Render `document` in `format`.
pub fn render(document: &ResultDocument, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => generate_json_report(document),
        ExportFormat::Csv => generate_csv_report(document),
        ExportFormat::Markdown => Ok(generate_markdown_report(document)),
    }
}

/// Pretty-printed JSON document.
pub fn generate_json_report(document: &ResultDocument) -> Result<String> {
    serde_json::to_string_pretty(document).map_err(Into::into)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::analysis::test_support::band;
    use crate::models::{BandPlan, TestConfiguration};

    pub fn document() -> ResultDocument {
        let plan: Vec<BandPlan> = [10u32, 20, 40]
            .iter()
            .enumerate()
            .map(|(index, c)| BandPlan {
                index,
                workers: *c,
                connections: *c,
            })
            .collect();
        let mut state = CheckpointState::new(TestMetadata::new(
            "synthetic",
            TestConfiguration::default(),
            plan,
        ));
        state.results = vec![
            band(0, 10, 1_000.0, 2.0),
            band(1, 20, 1_800.0, 3.0),
            band(2, 40, 2_000.0, 9.0),
        ];
        state.execution.next_band = 3;
        state.execution.status = RunStatus::Completed;
        ResultDocument::from_state(&state, &AnalysisEngine::default())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::document;
    use super::*;

    #[test]
    fn test_document_carries_optimal_and_gains() {
        let doc = document();
        assert_eq!(doc.bands.len(), 3);
        assert!(doc.optimal_configuration.is_some());
        assert_eq!(doc.marginal_gain(0), None);
        assert_eq!(doc.marginal_gain(1), Some(80.0));
    }

    #[test]
    fn test_generate_json_report() {
        let doc = document();
        let json = generate_json_report(&doc).unwrap();
        assert!(json.contains("\"metadata\""));
        assert!(json.contains("\"optimal_configuration\""));
        assert!(json.contains("\"marginal_gains\""));
        assert!(json.contains("\"recommendations\""));

        let parsed: ResultDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_export_format_names() {
        assert_eq!(ExportFormat::Markdown.to_string(), "markdown");
        assert_eq!(ExportFormat::Markdown.extension(), "md");
        assert_eq!(ExportFormat::default(), ExportFormat::Json);
    }
}
