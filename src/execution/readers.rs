//! Manifest and call artifact readers.
//!
//! Both binary formats are vendor-defined, so reading them is delegated to a
//! helper program speaking a small tab-separated protocol:
//!
//! ```text
//! <program> manifest <manifest.bpm>               -> Name<TAB>NormalizationId per marker
//! <program> intensities <call.gtc> <manifest.bpm> -> X<TAB>Y per marker, manifest order
//! ```
//!
//! A leading header line whose first field is `Name` or `X` is skipped.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ExternalToolError, ParseError};
use crate::intensity::RawIntensity;

/// Default helper program.
pub const DEFAULT_BEAD_ARRAY_PROGRAM: &str = "bead-array-tool";

/// Marker names and normalization lookups of one array design.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub path: PathBuf,
    /// Marker names in manifest order.
    pub names: Vec<String>,
    /// One normalization transform id per marker.
    pub normalization_lookups: Vec<u32>,
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[async_trait]
pub trait ManifestReader: Send + Sync {
    async fn read_manifest(&self, path: &Path) -> Result<Manifest, ParseError>;
}

#[async_trait]
pub trait CallReader: Send + Sync {
    /// Normalized intensities from `artifact`, one per manifest marker.
    async fn read_intensities(
        &self,
        artifact: &Path,
        manifest: &Manifest,
    ) -> Result<Vec<RawIntensity>, ParseError>;
}

/// Rejects intensity lists whose length differs from the manifest.
pub fn check_marker_count(
    artifact: &Path,
    manifest: &Manifest,
    found: usize,
) -> Result<(), ParseError> {
    if found != manifest.len() {
        return Err(ParseError::MarkerCountMismatch {
            path: artifact.display().to_string(),
            expected: manifest.len(),
            found,
        });
    }
    Ok(())
}

fn data_lines<'a>(text: &'a str, header: &'a str) -> impl Iterator<Item = (usize, &'a str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty())
        .filter(move |(i, line)| !(*i == 1 && line.split('\t').next() == Some(header)))
}

/// Parses `Name<TAB>NormalizationId` rows.
pub fn parse_manifest_listing(text: &str, path: &Path) -> Result<Manifest, ParseError> {
    let source = path.display().to_string();
    let mut names = Vec::new();
    let mut normalization_lookups = Vec::new();

    for (line, row) in data_lines(text, "Name") {
        let malformed = |reason: String| ParseError::Malformed {
            path: source.clone(),
            line,
            reason,
        };
        let (name, lookup) = row
            .split_once('\t')
            .ok_or_else(|| malformed("expected two tab-separated fields".to_string()))?;
        let lookup: u32 = lookup
            .trim()
            .parse()
            .map_err(|e| malformed(format!("invalid normalization id '{}': {e}", lookup.trim())))?;

        names.push(name.trim().to_string());
        normalization_lookups.push(lookup);
    }

    if names.is_empty() {
        return Err(ParseError::Unreadable {
            path: source,
            reason: "manifest lists no markers".to_string(),
        });
    }

    Ok(Manifest {
        path: path.to_path_buf(),
        names,
        normalization_lookups,
    })
}

/// Parses `X<TAB>Y` rows and checks them against `manifest`.
pub fn parse_intensity_listing(
    text: &str,
    artifact: &Path,
    manifest: &Manifest,
) -> Result<Vec<RawIntensity>, ParseError> {
    let source = artifact.display().to_string();
    let mut values = Vec::with_capacity(manifest.len());

    for (line, row) in data_lines(text, "X") {
        let malformed = |reason: String| ParseError::Malformed {
            path: source.clone(),
            line,
            reason,
        };
        let (x, y) = row
            .split_once('\t')
            .ok_or_else(|| malformed("expected two tab-separated fields".to_string()))?;
        let parse = |field: &str| -> Result<f64, ParseError> {
            let value: f64 = field
                .trim()
                .parse()
                .map_err(|e| malformed(format!("invalid intensity '{}': {e}", field.trim())))?;
            if !value.is_finite() {
                return Err(malformed(format!("non-finite intensity '{}'", field.trim())));
            }
            Ok(value)
        };

        values.push(RawIntensity::new(parse(x)?, parse(y)?));
    }

    if values.is_empty() {
        return Err(ParseError::Unreadable {
            path: source,
            reason: "no intensities".to_string(),
        });
    }
    check_marker_count(artifact, manifest, values.len())?;
    Ok(values)
}

/// Reads manifests and call artifacts through the bead-array helper program.
#[derive(Debug, Clone)]
pub struct BeadArrayTool {
    program: String,
}

impl Default for BeadArrayTool {
    fn default() -> Self {
        Self::new(DEFAULT_BEAD_ARRAY_PROGRAM)
    }
}

impl BeadArrayTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&Path], subcommand: &str) -> Result<String, ExternalToolError> {
        debug!(program = %self.program, subcommand = subcommand, "Running bead-array helper");

        let output = Command::new(&self.program)
            .arg(subcommand)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ExternalToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExternalToolError::NonZeroExit {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ManifestReader for BeadArrayTool {
    async fn read_manifest(&self, path: &Path) -> Result<Manifest, ParseError> {
        let text = self.run(&[path], "manifest").await?;
        parse_manifest_listing(&text, path)
    }
}

#[async_trait]
impl CallReader for BeadArrayTool {
    async fn read_intensities(
        &self,
        artifact: &Path,
        manifest: &Manifest,
    ) -> Result<Vec<RawIntensity>, ParseError> {
        let text = self.run(&[artifact, manifest.path.as_path()], "intensities").await?;
        parse_intensity_listing(&text, artifact, manifest)
    }
}
