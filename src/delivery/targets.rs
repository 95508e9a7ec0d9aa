//! Deciding what to process: which batches, which samples in each, and which
//! calibration and manifest files the batch shares.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, warn};

use crate::error::SetupError;
use crate::storage::{MetadataSource, ObjectLocation};

use super::keys::KeyLayout;
use super::report::SampleReportRow;

/// Delivery names in the supported (v2) layout: `embark_YYYY-MM-DD_hhmm`.
static BATCH_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^embark_\d{4}-\d{2}-\d{2}_\d{4}$").ok());

/// Per batch, the sample codes to keep (`None` keeps every report row).
pub type BatchTargets = BTreeMap<String, Option<BTreeSet<String>>>;

/// What the operator asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelection {
    /// Explicit sample codes; their batches come from the metadata source.
    SampleCodes(Vec<String>),
    /// Whole batches, optionally narrowed by the metadata source.
    Batches(Vec<String>),
}

/// Reads one sample code per line, skipping blank lines.
pub async fn read_sample_codes(path: &Path) -> Result<Vec<String>, SetupError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SetupError::Workspace {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(parse_sample_codes(&content))
}

pub fn parse_sample_codes(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Splits a comma-separated batch list, dropping empty and repeated entries.
pub fn parse_batch_list(list: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_string()))
        .map(str::to_string)
        .collect()
}

/// Whether `name` follows the supported delivery naming; logs a warning if not.
pub fn check_batch_name(name: &str) -> bool {
    let supported = BATCH_NAME.as_ref().is_some_and(|re| re.is_match(name));
    if !supported {
        warn!(
            batch = %name,
            "Batch name does not match embark_YYYY-MM-DD_hhmm; only the v2 delivery layout is supported"
        );
    }
    supported
}

/// Groups the selection into batches, consulting `metadata` where needed.
pub async fn resolve_targets(
    selection: &TargetSelection,
    metadata: Option<&dyn MetadataSource>,
) -> Result<BatchTargets, SetupError> {
    let mut targets = BatchTargets::new();

    match (selection, metadata) {
        (TargetSelection::SampleCodes(_), None) => {
            return Err(SetupError::Metadata(
                "a sample code list requires a metadata database (--database-url)".to_string(),
            ));
        }
        (TargetSelection::SampleCodes(codes), Some(metadata)) => {
            let rows = metadata
                .samples_by_code(codes)
                .await
                .map_err(|e| SetupError::Metadata(e.to_string()))?;

            for row in rows {
                targets
                    .entry(row.batch)
                    .or_insert_with(|| Some(BTreeSet::new()))
                    .get_or_insert_with(BTreeSet::new)
                    .insert(row.sample_code);
            }

            let found: BTreeSet<&String> = targets.values().flatten().flatten().collect();
            let missing = codes.iter().filter(|c| !found.contains(c)).count();
            if missing > 0 {
                warn!(missing = missing, "Sample codes without a delivery were skipped");
            }
        }
        (TargetSelection::Batches(batches), Some(metadata)) => {
            for batch in batches {
                targets.insert(batch.clone(), Some(BTreeSet::new()));
            }

            let rows = metadata
                .samples_by_batch(batches)
                .await
                .map_err(|e| SetupError::Metadata(e.to_string()))?;

            for row in rows {
                if let Some(Some(codes)) = targets.get_mut(&row.batch) {
                    codes.insert(row.sample_code);
                }
            }
        }
        (TargetSelection::Batches(batches), None) => {
            for batch in batches {
                targets.insert(batch.clone(), None);
            }
        }
    }

    for (batch, codes) in &targets {
        check_batch_name(batch);
        match codes {
            Some(codes) => info!(batch = %batch, samples = codes.len(), "Resolved batch"),
            None => info!(batch = %batch, "Resolved batch (all report rows)"),
        }
    }

    Ok(targets)
}

/// Explicit artifact locations supplied by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactOverrides {
    pub calibration: Option<ObjectLocation>,
    pub manifest: Option<ObjectLocation>,
    /// Accept an explicit calibration file that differs from the report.
    pub allow_calibration_override: bool,
}

/// Calibration and manifest shared by every sample in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedArtifacts {
    pub calibration: ObjectLocation,
    pub manifest: ObjectLocation,
}

fn distinct<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Vec<&'a str> {
    let mut seen = Vec::new();
    for value in values.flatten() {
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}

/// Resolves the batch's calibration and manifest locations.
///
/// The report must agree with itself and with an explicit calibration file
/// unless `allow_calibration_override` is set.
pub fn resolve_shared_artifacts(
    batch: &str,
    rows: &[SampleReportRow],
    bucket: &str,
    keys: &KeyLayout,
    overrides: &ArtifactOverrides,
) -> Result<SharedArtifacts, SetupError> {
    let reported = distinct(rows.iter().map(SampleReportRow::cluster_file));
    let overridden = overrides.allow_calibration_override && overrides.calibration.is_some();

    if reported.len() > 1 && !overridden {
        return Err(SetupError::CalibrationMismatch {
            batch: batch.to_string(),
            expected: reported[0].to_string(),
            found: reported[1].to_string(),
        });
    }

    let calibration = match (&overrides.calibration, reported.first()) {
        (Some(explicit), Some(&from_report)) => {
            if explicit.file_name() != from_report && !overrides.allow_calibration_override {
                return Err(SetupError::CalibrationMismatch {
                    batch: batch.to_string(),
                    expected: from_report.to_string(),
                    found: explicit.file_name().to_string(),
                });
            }
            if explicit.file_name() != from_report {
                warn!(
                    batch = %batch,
                    reported = %from_report,
                    using = %explicit,
                    "Overriding the calibration file named in the sample report"
                );
            }
            explicit.clone()
        }
        (Some(explicit), None) => explicit.clone(),
        (None, Some(&from_report)) => ObjectLocation::new(bucket, keys.calibration(from_report)),
        (None, None) => {
            return Err(SetupError::MissingArtifactLocation {
                batch: batch.to_string(),
                artifact: "calibration",
            })
        }
    };

    let manifest = match &overrides.manifest {
        Some(explicit) => explicit.clone(),
        None => {
            let products = distinct(rows.iter().map(SampleReportRow::product));
            match products.as_slice() {
                [product] => ObjectLocation::new(bucket, keys.manifest(product)),
                [] => {
                    return Err(SetupError::MissingArtifactLocation {
                        batch: batch.to_string(),
                        artifact: "manifest",
                    })
                }
                several => {
                    return Err(SetupError::Metadata(format!(
                        "sample report for '{batch}' names several products ({}); pass --manifest-path",
                        several.join(", ")
                    )))
                }
            }
        }
    };

    Ok(SharedArtifacts {
        calibration,
        manifest,
    })
}
