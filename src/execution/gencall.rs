//! Genotype caller invocation.
//!
//! The caller turns a folder of raw scan pairs into one call artifact per
//! scan pair. It is an external program (`iaap-cli gencall`); this module
//! wraps it behind [`GenotypeCaller`] so tests and alternative callers can
//! stand in for it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::ExternalToolError;
use crate::scheduler::available_parallelism;

/// Default caller program.
pub const DEFAULT_GENCALL_PROGRAM: &str = "iaap-cli";

/// Extension of call artifacts.
pub const ARTIFACT_EXTENSION: &str = "gtc";

/// One caller invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GencallRequest {
    pub manifest: PathBuf,
    pub calibration: PathBuf,
    pub output_dir: PathBuf,
    pub input_dir: PathBuf,
    pub threads: Option<usize>,
}

impl GencallRequest {
    pub fn new(
        manifest: impl Into<PathBuf>,
        calibration: impl Into<PathBuf>,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            manifest: manifest.into(),
            calibration: calibration.into(),
            output_dir: output_dir.into(),
            input_dir: input_dir.into(),
            threads: None,
        }
    }

    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }
}

/// Result of a caller invocation that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GencallResponse {
    pub program: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Call artifacts found in the output folder, sorted.
    pub artifacts: Vec<PathBuf>,
    pub duration: Duration,
    pub stderr: String,
}

impl GencallResponse {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Converts a non-zero exit into an error.
    pub fn ensure_success(self) -> Result<Self, ExternalToolError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExternalToolError::NonZeroExit {
                program: self.program,
                code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Turns raw scans into call artifacts.
#[async_trait]
pub trait GenotypeCaller: Send + Sync {
    /// Runs one invocation. A process that starts but exits non-zero is still
    /// an `Ok` response; only failure to start is an error.
    async fn call(&self, request: &GencallRequest) -> Result<GencallResponse, ExternalToolError>;
}

/// Thread count for one caller run over a whole batch: all but one
/// processing unit, at least one.
pub fn default_batch_threads() -> usize {
    available_parallelism().saturating_sub(1).max(1)
}

/// Call artifacts under `dir`, sorted by path.
pub fn list_artifacts(dir: &Path) -> Vec<PathBuf> {
    let mut artifacts: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == ARTIFACT_EXTENSION))
        .collect();
    artifacts.sort();
    artifacts
}

/// The Illumina Array Analysis Platform command line caller.
#[derive(Debug, Clone)]
pub struct IaapCli {
    program: String,
}

impl Default for IaapCli {
    fn default() -> Self {
        Self::new(DEFAULT_GENCALL_PROGRAM)
    }
}

impl IaapCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Command line arguments for `request`.
    pub fn args(request: &GencallRequest) -> Vec<String> {
        let mut args = vec![
            "gencall".to_string(),
            request.manifest.display().to_string(),
            request.calibration.display().to_string(),
            request.output_dir.display().to_string(),
            "--idat-folder".to_string(),
            request.input_dir.display().to_string(),
        ];
        if let Some(threads) = request.threads {
            args.push("--num-threads".to_string());
            args.push(threads.to_string());
        }
        args.push("--output-gtc".to_string());
        args
    }
}

#[async_trait]
impl GenotypeCaller for IaapCli {
    async fn call(&self, request: &GencallRequest) -> Result<GencallResponse, ExternalToolError> {
        let start = Instant::now();
        let args = Self::args(request);

        info!(
            program = %self.program,
            input = %request.input_dir.display(),
            output = %request.output_dir.display(),
            threads = ?request.threads,
            "Starting genotype caller"
        );
        debug!(command = %format!("{} {}", self.program, args.join(" ")), "Caller command line");

        let output = Command::new(&self.program)
            .args(&args)
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

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("[gencall stdout] {}", line);
        }

        let duration = start.elapsed();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code();

        if output.status.success() {
            info!(duration_secs = duration.as_secs_f64(), "Genotype caller finished");
        } else {
            warn!(
                exit_code = ?exit_code,
                stderr = %stderr,
                "Genotype caller exited unsuccessfully"
            );
        }

        Ok(GencallResponse {
            program: self.program.clone(),
            exit_code,
            artifacts: list_artifacts(&request.output_dir),
            duration,
            stderr,
        })
    }
}
