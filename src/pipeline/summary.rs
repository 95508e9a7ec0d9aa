//! Outcome reporting for batches and runs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::delivery::SampleRecord;
use crate::error::{FailureKind, SampleError};
use crate::intensity::WrittenTable;

use super::config::CallMode;

/// A sample whose table was written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleSuccess {
    pub sample_id: String,
    pub sample_code: String,
    pub output: PathBuf,
    pub markers: usize,
    pub no_signal: usize,
    pub sha256: String,
    pub elapsed_secs: f64,
}

impl SampleSuccess {
    pub fn new(record: &SampleRecord, table: WrittenTable, elapsed_secs: f64) -> Self {
        Self {
            sample_id: record.sample_id.clone(),
            sample_code: record.sample_code.clone(),
            output: table.path,
            markers: table.rows,
            no_signal: table.no_signal,
            sha256: table.sha256,
            elapsed_secs,
        }
    }
}

/// A sample that produced no table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleFailure {
    pub sample_id: String,
    pub sample_code: String,
    pub chip_id: String,
    pub chip_position: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl SampleFailure {
    pub fn new(record: &SampleRecord, error: &SampleError) -> Self {
        Self {
            sample_id: record.sample_id.clone(),
            sample_code: record.sample_code.clone(),
            chip_id: record.chip_id.clone(),
            chip_position: record.chip_position.clone(),
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

/// Outcome of one sample, in input order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SampleOutcome {
    Succeeded(SampleSuccess),
    Failed(SampleFailure),
}

impl SampleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SampleOutcome::Succeeded(_))
    }
}

/// Status of a batch or a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every sample succeeded.
    Success,
    /// Setup completed but some samples failed.
    Partial,
    /// A batch could not be set up.
    Fatal,
}

impl RunStatus {
    /// Process exit code: 0 success, 1 fatal, 2 partial.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Fatal => 1,
            RunStatus::Partial => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Fatal => "fatal",
        }
    }
}

/// Everything that happened to one batch after setup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch: String,
    pub mode: CallMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub samples: Vec<SampleOutcome>,
    /// Whether raw scans and call artifacts were removed.
    pub cleaned: bool,
}

impl BatchSummary {
    pub fn succeeded(&self) -> impl Iterator<Item = &SampleSuccess> {
        self.samples.iter().filter_map(|outcome| match outcome {
            SampleOutcome::Succeeded(success) => Some(success),
            SampleOutcome::Failed(_) => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = &SampleFailure> {
        self.samples.iter().filter_map(|outcome| match outcome {
            SampleOutcome::Failed(failure) => Some(failure),
            SampleOutcome::Succeeded(_) => None,
        })
    }

    pub fn all_succeeded(&self) -> bool {
        self.samples.iter().all(SampleOutcome::is_success)
    }

    pub fn status(&self) -> RunStatus {
        if self.all_succeeded() {
            RunStatus::Success
        } else {
            RunStatus::Partial
        }
    }

    /// Writes the summary as pretty JSON.
    pub async fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await
    }
}

/// A batch that failed before per-sample work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatalBatch {
    pub batch: String,
    pub reason: String,
}

/// Outcome of a whole invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub batches: Vec<BatchSummary>,
    pub fatal: Vec<FatalBatch>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            batches: Vec::new(),
            fatal: Vec::new(),
        }
    }

    pub fn record_batch(&mut self, summary: BatchSummary) {
        self.batches.push(summary);
    }

    pub fn record_fatal(&mut self, batch: impl Into<String>, reason: impl ToString) {
        self.fatal.push(FatalBatch {
            batch: batch.into(),
            reason: reason.to_string(),
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Fatal if any batch failed setup, else partial if any sample failed.
    pub fn status(&self) -> RunStatus {
        if !self.fatal.is_empty() {
            RunStatus::Fatal
        } else if self.batches.iter().all(BatchSummary::all_succeeded) {
            RunStatus::Success
        } else {
            RunStatus::Partial
        }
    }

    pub fn samples_succeeded(&self) -> usize {
        self.batches.iter().map(|b| b.succeeded().count()).sum()
    }

    pub fn samples_failed(&self) -> usize {
        self.batches.iter().map(|b| b.failed().count()).sum()
    }
}
