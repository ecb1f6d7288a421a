//! Flat per-band CSV export.

use super::ResultDocument;
use crate::error::{EngineError, Result};
use crate::models::BandStatus;

/// Column layout of the CSV export.
pub const CSV_HEADER: [&str; 10] = [
    "band_id",
    "workers",
    "connections",
    "total_tps",
    "avg_latency_ms",
    "p50_latency_ms",
    "p95_latency_ms",
    "p99_latency_ms",
    "error_rate",
    "marginal_gain",
];

/// One row per committed band. `band_id` is 1-based; `marginal_gain` is
/// empty for the first band and for bands left out of the analysis.
pub fn generate_csv_report(document: &ResultDocument) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER).map_err(csv_error)?;

    for band in &document.bands {
        let measured = band.status != BandStatus::NoDataCollected;
        let number = |value: f64| {
            if measured {
                value.to_string()
            } else {
                String::new()
            }
        };
        let gain = document
            .marginal_gain(band.band_index)
            .map(|g| g.to_string())
            .unwrap_or_default();

        writer
            .write_record([
                (band.band_index + 1).to_string(),
                band.workers.to_string(),
                band.connections.to_string(),
                number(band.total_tps),
                number(band.avg_latency_ms),
                number(band.p50_latency_ms),
                number(band.p95_latency_ms),
                number(band.p99_latency_ms),
                number(band.error_rate),
                gain,
            ])
            .map_err(csv_error)?;
    }

    let bytes = writer.into_inner().map_err(|e| EngineError::Serialization {
        context: "csv",
        details: e.to_string(),
    })?;
    String::from_utf8(bytes).map_err(|e| EngineError::Serialization {
        context: "csv",
        details: e.to_string(),
    })
}

fn csv_error(e: csv::Error) -> EngineError {
    EngineError::Serialization {
        context: "csv",
        details: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BandResult;
    use crate::report::test_support::document;

    #[test]
    fn test_csv_column_layout() {
        let csv = generate_csv_report(&document()).unwrap();
        let mut lines = csv.lines();

        assert_eq!(
            lines.next().unwrap(),
            "band_id,workers,connections,total_tps,avg_latency_ms,p50_latency_ms,\
             p95_latency_ms,p99_latency_ms,error_rate,marginal_gain"
        );

        let first: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(first.len(), 10);
        assert_eq!(first[0], "1");
        assert_eq!(first[3], "1000");
        assert_eq!(first[9], "");

        let second: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(second[0], "2");
        assert_eq!(second[9], "80");
        assert_eq!(csv.lines().count(), 4);
    }

    #[test]
    fn test_no_data_band_has_empty_measurements() {
        let mut doc = document();
        let plan = doc.metadata.plan[2];
        doc.bands[2] = BandResult::no_data(&plan);

        let csv = generate_csv_report(&doc).unwrap();
        let last: Vec<&str> = csv.lines().last().unwrap().split(',').collect();
        assert_eq!(last[0], "3");
        assert_eq!(last[1], "40");
        assert!(last[3..9].iter().all(|field| field.is_empty()));
    }
}
