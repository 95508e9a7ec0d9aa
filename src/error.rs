//! Error types for idat-forge operations.
//!
//! Errors are split by how far they reach:
//! - `SetupError`: fatal to a whole batch (shared artifacts, metadata, workspace)
//! - `RetrievalError`: a remote object could not be fetched
//! - `ExternalToolError`: the genotype caller or a reader process failed
//! - `ParseError`: a call artifact, manifest or report could not be interpreted
//! - `SampleError`: any of the above, scoped to one sample

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::pipeline::ConfigError;
use crate::scheduler::PoolError;

/// Errors that abort an entire batch before or outside per-sample work.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Failed to fetch {artifact} from '{location}': {source}")]
    ArtifactUnavailable {
        artifact: &'static str,
        location: String,
        #[source]
        source: RetrievalError,
    },

    #[error("Calibration file mismatch for batch '{batch}': expected '{expected}', found '{found}'")]
    CalibrationMismatch {
        batch: String,
        expected: String,
        found: String,
    },

    #[error("No {artifact} location for batch '{batch}': pass it explicitly or add the column to the sample report")]
    MissingArtifactLocation {
        batch: String,
        artifact: &'static str,
    },

    #[error("Failed to read manifest: {0}")]
    Manifest(#[source] ParseError),

    #[error("Unable to resolve samples: {0}")]
    Metadata(String),

    #[error("Invalid sample report for batch '{batch}': {source}")]
    SampleReport {
        batch: String,
        #[source]
        source: ParseError,
    },

    #[error("No samples to process for batch '{0}'")]
    NoSamples(String),

    #[error("Workspace error at '{}': {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Genotype caller failed: {0}")]
    GenotypeCaller(#[source] ExternalToolError),

    #[error("Object storage unavailable: {0}")]
    Storage(#[source] RetrievalError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while fetching objects from storage.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Object '{key}' not found")]
    NotFound { key: String },

    #[error("Transient failure fetching '{key}': {reason}")]
    Transient { key: String, reason: String },

    #[error("Request for '{key}' rejected with status {status}")]
    Rejected { key: String, status: u16 },

    #[error("Invalid storage location '{0}'")]
    InvalidLocation(String),

    #[error("Failed to build storage client: {0}")]
    Client(String),

    #[error("IO error at '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RetrievalError {
    /// Whether a later attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetrievalError::Transient { .. })
    }
}

/// Errors raised by external programs.
#[derive(Debug, Error)]
pub enum ExternalToolError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {}: {stderr}", exit_label(.code))]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Expected call artifact '{}' was not produced", .path.display())]
    MissingArtifact { path: PathBuf },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

/// Errors raised while interpreting manifests, call artifacts and reports.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unable to read '{path}': {reason}")]
    Unreadable { path: String, reason: String },

    #[error("Malformed content in '{path}' at line {line}: {reason}")]
    Malformed {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("'{path}' has {found} markers, manifest has {expected}")]
    MarkerCountMismatch {
        path: String,
        expected: usize,
        found: usize,
    },

    #[error("Reader process failed: {0}")]
    Tool(#[from] ExternalToolError),
}

/// Failure of a single sample; never aborts sibling samples.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("Retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Genotype caller failed: {0}")]
    ExternalTool(#[from] ExternalToolError),

    #[error("Call artifact unreadable: {0}")]
    Parse(#[from] ParseError),

    #[error("Failed to write output '{}': {source}", .path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker pool: {0}")]
    Pool(#[from] PoolError),
}

/// Category reported for a failed sample in summaries and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retrieval,
    ExternalTool,
    Parse,
    Output,
    Cancelled,
    Panicked,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Retrieval => "retrieval",
            FailureKind::ExternalTool => "external_tool",
            FailureKind::Parse => "parse",
            FailureKind::Output => "output",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Panicked => "panicked",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SampleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SampleError::Retrieval(_) => FailureKind::Retrieval,
            SampleError::ExternalTool(_) => FailureKind::ExternalTool,
            SampleError::Parse(_) => FailureKind::Parse,
            SampleError::Output { .. } => FailureKind::Output,
            SampleError::Pool(PoolError::Cancelled) => FailureKind::Cancelled,
            SampleError::Pool(_) => FailureKind::Panicked,
        }
    }
}
