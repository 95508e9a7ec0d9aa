//! On-disk layout of one batch.
//!
//! ```text
//! <output>/<batch>/
//!     <calibration>.egt, <manifest>.bpm
//!     idats/                  raw scans (batch-wide) or idats/<n>_<chip>_<pos>/ (per-sample)
//!     gtcs/                   call artifacts, same split
//!     <sample>_<code>_normalized_intensity.tsv
//!     summary.json
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::delivery::SampleRecord;
use crate::error::SetupError;

pub const RAW_DIR: &str = "idats";
pub const CALLS_DIR: &str = "gtcs";
pub const SUMMARY_FILE: &str = "summary.json";

/// Directories of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWorkspace {
    root: PathBuf,
}

impl BatchWorkspace {
    pub fn new(output_dir: &Path, batch: &str) -> Self {
        Self {
            root: output_dir.join(batch),
        }
    }

    /// Creates the batch, raw scan and call artifact directories.
    pub async fn create(output_dir: &Path, batch: &str) -> Result<Self, SetupError> {
        let workspace = Self::new(output_dir, batch);
        for dir in [workspace.raw_dir(), workspace.calls_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| SetupError::Workspace { path: dir, source })?;
        }
        debug!(root = %workspace.root.display(), "Created batch workspace");
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join(RAW_DIR)
    }

    pub fn calls_dir(&self) -> PathBuf {
        self.root.join(CALLS_DIR)
    }

    /// Where a shared artifact named `file_name` is stored.
    pub fn shared_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    fn unit_dir_name(ordinal: usize, record: &SampleRecord) -> String {
        format!("{}_{}", ordinal, record.scan_stem())
    }

    /// Private raw scan folder of one per-sample unit.
    pub fn unit_raw_dir(&self, ordinal: usize, record: &SampleRecord) -> PathBuf {
        self.raw_dir().join(Self::unit_dir_name(ordinal, record))
    }

    /// Private call artifact folder of one per-sample unit.
    pub fn unit_calls_dir(&self, ordinal: usize, record: &SampleRecord) -> PathBuf {
        self.calls_dir().join(Self::unit_dir_name(ordinal, record))
    }

    pub fn output_path(&self, record: &SampleRecord) -> PathBuf {
        self.root.join(record.output_file_name())
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE)
    }

    /// Removes raw scans and call artifacts.
    pub async fn remove_intermediates(&self) -> Result<(), SetupError> {
        for dir in [self.raw_dir(), self.calls_dir()] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(SetupError::Workspace { path: dir, source }),
            }
        }
        info!(root = %self.root.display(), "Removed intermediate files");
        Ok(())
    }
}
