//! Sample reports and the sample records built from them.
//!
//! Every delivery ships a `<batch>-SampleReport.csv` with one row per scanned
//! sample. Only the columns below are read; anything else is ignored.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::intensity::TABLE_SUFFIX;

/// One row of a sample report, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SampleReportRow {
    #[serde(default)]
    pub sample_id: Option<String>,
    /// Customer-facing sample code.
    #[serde(default)]
    pub embark_id: Option<String>,
    /// Chip (beadchip barcode).
    #[serde(default)]
    pub sentrix_id: Option<String>,
    /// Position on the chip, e.g. `R01C01`.
    #[serde(default)]
    pub sentrix_position: Option<String>,
    /// Calibration (cluster) file the delivery was called with.
    #[serde(default)]
    pub cluster_file: Option<String>,
    /// Manifest product name.
    #[serde(default)]
    pub product: Option<String>,
    /// 1-based data row number, filled in by the parser.
    #[serde(skip)]
    pub row: usize,
}

/// A validated sample ready for processing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SampleRecord {
    pub sample_id: String,
    pub sample_code: String,
    pub batch: String,
    pub chip_id: String,
    pub chip_position: String,
}

impl SampleRecord {
    /// `<chip>_<position>`, the stem of the scan and call artifact files.
    pub fn scan_stem(&self) -> String {
        format!("{}_{}", self.chip_id, self.chip_position)
    }

    /// File name of the call artifact the genotype caller produces.
    pub fn artifact_file_name(&self) -> String {
        format!("{}.gtc", self.scan_stem())
    }

    /// File name of the output table.
    pub fn output_file_name(&self) -> String {
        format!("{}_{}{}", self.sample_id, self.sample_code, TABLE_SUFFIX)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn is_path_segment(value: &str) -> bool {
    value != "." && value != ".." && !value.contains(['/', '\\', '\0'])
}

impl SampleReportRow {
    pub fn sample_code(&self) -> Option<&str> {
        non_empty(&self.embark_id)
    }

    pub fn cluster_file(&self) -> Option<&str> {
        non_empty(&self.cluster_file)
    }

    pub fn product(&self) -> Option<&str> {
        non_empty(&self.product)
    }

    /// Validates the row into a [`SampleRecord`] for `batch`.
    ///
    /// Identifying values end up in file and folder names, so they must be
    /// single path segments.
    pub fn to_record(&self, batch: &str, source: &str) -> Result<SampleRecord, ParseError> {
        let malformed = |reason: String| ParseError::Malformed {
            path: source.to_string(),
            line: self.row,
            reason,
        };
        let required = |value: &Option<String>, column: &str| -> Result<String, ParseError> {
            let value =
                non_empty(value).ok_or_else(|| malformed(format!("missing required column '{column}'")))?;
            if !is_path_segment(value) {
                return Err(malformed(format!(
                    "column '{column}' is not a valid file name component: '{value}'"
                )));
            }
            Ok(value.to_string())
        };

        Ok(SampleRecord {
            sample_id: required(&self.sample_id, "sample_id")?,
            sample_code: required(&self.embark_id, "embark_id")?,
            batch: batch.to_string(),
            chip_id: required(&self.sentrix_id, "sentrix_id")?,
            chip_position: required(&self.sentrix_position, "sentrix_position")?,
        })
    }
}

/// Parses a sample report. `source` names the report in error messages.
pub fn parse_sample_report(bytes: &[u8], source: &str) -> Result<Vec<SampleReportRow>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader.headers().map_err(|e| ParseError::Unreadable {
        path: source.to_string(),
        reason: e.to_string(),
    })?;
    if !headers.iter().any(|h| h == "embark_id") {
        return Err(ParseError::Malformed {
            path: source.to_string(),
            line: 1,
            reason: "header has no 'embark_id' column".to_string(),
        });
    }

    reader
        .deserialize()
        .enumerate()
        .map(|(i, row)| {
            let mut row: SampleReportRow = row.map_err(|e| ParseError::Malformed {
                path: source.to_string(),
                line: i + 1,
                reason: e.to_string(),
            })?;
            row.row = i + 1;
            Ok(row)
        })
        .collect()
}

/// Rows whose sample code is in `codes`, or every row when `codes` is `None`.
pub fn filter_rows(rows: &[SampleReportRow], codes: Option<&BTreeSet<String>>) -> Vec<SampleReportRow> {
    rows.iter()
        .filter(|row| match codes {
            Some(codes) => row.sample_code().is_some_and(|code| codes.contains(code)),
            None => true,
        })
        .cloned()
        .collect()
}
