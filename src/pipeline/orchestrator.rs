//! Batch orchestrator.
//!
//! This module provides the `BatchOrchestrator` that coordinates:
//! - Sample report retrieval and shared-artifact resolution
//! - Shared calibration and manifest downloads
//! - Bounded fan-out of per-sample retrieval, calling and extraction
//! - Per-sample failure capture and batch summaries
//!
//! Setup problems abort the batch with a [`SetupError`]. Anything that goes
//! wrong for one sample is recorded in that sample's outcome and never
//! affects its siblings.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::delivery::{
    filter_rows, parse_sample_report, raw_scan_file_name, resolve_shared_artifacts,
    ArtifactOverrides, BatchTargets, Channel, KeyLayout, SampleRecord, SharedArtifacts,
};
use crate::error::{ExternalToolError, SampleError, SetupError};
use crate::execution::{
    check_marker_count, default_batch_threads, BeadArrayTool, CallReader, GencallRequest,
    GenotypeCaller, IaapCli, Manifest, ManifestReader,
};
use crate::intensity::{transform, write_table};
use crate::metrics::MetricsCollector;
use crate::scheduler::{CancellationFlag, PoolError, WorkerPool, WorkerPoolConfig};
use crate::storage::{
    download_with_retry, fetch_with_retry, open_store, ObjectLocation, ObjectStore,
};
use crate::utils::RetryPolicy;

use super::config::{CallMode, PipelineConfig};
use super::summary::{
    BatchSummary, RunSummary, SampleFailure, SampleOutcome, SampleSuccess,
};
use super::workspace::BatchWorkspace;

/// One batch, resolved and ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub batch: String,
    pub samples: Vec<SampleRecord>,
    pub artifacts: SharedArtifacts,
}

/// State shared read-only by every work unit of a batch.
struct UnitContext {
    store: Arc<dyn ObjectStore>,
    caller: Arc<dyn GenotypeCaller>,
    calls: Arc<dyn CallReader>,
    keys: KeyLayout,
    bucket: String,
    retry: RetryPolicy,
    workspace: BatchWorkspace,
    manifest: Manifest,
    calibration_path: PathBuf,
    gencall_threads: Option<usize>,
    metrics: MetricsCollector,
}

impl UnitContext {
    /// Downloads both channel scans of `record` into `dir`.
    ///
    /// On failure the channels already fetched are removed again, so the
    /// caller never sees an unpaired scan.
    async fn fetch_raw_scans(&self, record: &SampleRecord, dir: &Path) -> Result<(), SampleError> {
        let mut fetched: Vec<PathBuf> = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let location = ObjectLocation::new(&self.bucket, self.keys.raw_scan(record, channel));
            let dest = dir.join(raw_scan_file_name(record, channel));
            if let Err(e) =
                download_with_retry(self.store.as_ref(), &self.retry, &location, &dest).await
            {
                for path in &fetched {
                    if let Err(err) = tokio::fs::remove_file(path).await {
                        warn!(path = %path.display(), error = %err, "Failed to remove unpaired scan");
                    }
                }
                return Err(e.into());
            }
            fetched.push(dest);
        }
        debug!(sample_id = %record.sample_id, "Fetched raw scans");
        Ok(())
    }

    /// Reads, transforms and writes one sample's call artifact.
    async fn extract(
        &self,
        record: &SampleRecord,
        artifact: PathBuf,
        started: Instant,
    ) -> Result<SampleSuccess, SampleError> {
        if !tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
            return Err(ExternalToolError::MissingArtifact { path: artifact }.into());
        }

        let raw = self.calls.read_intensities(&artifact, &self.manifest).await?;
        check_marker_count(&artifact, &self.manifest, raw.len())?;
        let polar = transform(&raw);

        let output = self.workspace.output_path(record);
        let table = write_table(&output, &self.manifest.names, &polar)
            .await
            .map_err(|source| SampleError::Output {
                path: output.clone(),
                source,
            })?;

        debug!(
            sample_id = %record.sample_id,
            markers = table.rows,
            no_signal = table.no_signal,
            "Wrote intensity table"
        );
        Ok(SampleSuccess::new(
            record,
            table,
            started.elapsed().as_secs_f64(),
        ))
    }

    /// Per-sample mode: retrieval, calling and extraction in private folders.
    async fn process_sample(
        &self,
        ordinal: usize,
        record: &SampleRecord,
    ) -> Result<SampleSuccess, SampleError> {
        let started = Instant::now();
        let raw_dir = self.workspace.unit_raw_dir(ordinal, record);
        let calls_dir = self.workspace.unit_calls_dir(ordinal, record);
        for dir in [&raw_dir, &calls_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| SampleError::Output {
                    path: dir.clone(),
                    source,
                })?;
        }

        self.fetch_raw_scans(record, &raw_dir).await?;

        let request = GencallRequest::new(
            &self.manifest.path,
            &self.calibration_path,
            &raw_dir,
            &calls_dir,
        )
        .with_threads(self.gencall_threads);
        let response = self.caller.call(&request).await;
        let success = matches!(&response, Ok(r) if r.success());
        self.metrics
            .record_caller(CallMode::PerSample.as_str(), success);
        response?.ensure_success()?;

        self.extract(record, calls_dir.join(record.artifact_file_name()), started)
            .await
    }
}

/// Coordinates the processing of batches.
pub struct BatchOrchestrator {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    caller: Arc<dyn GenotypeCaller>,
    manifests: Arc<dyn ManifestReader>,
    calls: Arc<dyn CallReader>,
    keys: KeyLayout,
    cancel: CancellationFlag,
    metrics: MetricsCollector,
}

impl BatchOrchestrator {
    /// Creates an orchestrator with explicit collaborators.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        caller: Arc<dyn GenotypeCaller>,
        manifests: Arc<dyn ManifestReader>,
        calls: Arc<dyn CallReader>,
    ) -> Self {
        let keys = KeyLayout::new(&config.env_prefix);
        Self {
            config,
            store,
            caller,
            manifests,
            calls,
            keys,
            cancel: CancellationFlag::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates an orchestrator backed by the configured store and programs.
    pub fn from_config(config: PipelineConfig) -> Result<Self, SetupError> {
        let store = open_store(&config.storage_endpoint, config.storage_token.clone())
            .map_err(SetupError::Storage)?;
        let caller = Arc::new(IaapCli::new(config.gencall_program.clone()));
        let reader = Arc::new(BeadArrayTool::new(config.bead_array_program.clone()));
        Ok(Self::new(config, store, caller, reader.clone(), reader))
    }

    /// Observes `cancel` at every unit boundary.
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Gets the current configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn pool(&self) -> WorkerPool {
        WorkerPool::with_cancellation(
            WorkerPoolConfig::from_parallelism(self.config.pool_multiplier),
            self.cancel.clone(),
        )
    }

    /// Resolves one batch: fetches its sample report, keeps the rows whose
    /// code is in `codes`, validates them and locates the shared artifacts.
    pub async fn prepare_batch(
        &self,
        batch: &str,
        codes: Option<&BTreeSet<String>>,
        overrides: &ArtifactOverrides,
    ) -> Result<BatchRequest, SetupError> {
        let report = ObjectLocation::new(&self.config.bucket, self.keys.sample_report(batch));
        let bytes = fetch_with_retry(self.store.as_ref(), &self.config.retry_policy(), &report)
            .await
            .map_err(|source| SetupError::ArtifactUnavailable {
                artifact: "sample report",
                location: report.to_string(),
                source,
            })?;

        let source = report.to_string();
        let rows = parse_sample_report(&bytes, &source).map_err(|source| {
            SetupError::SampleReport {
                batch: batch.to_string(),
                source,
            }
        })?;
        let kept = filter_rows(&rows, codes);
        if kept.is_empty() {
            return Err(SetupError::NoSamples(batch.to_string()));
        }

        let samples = kept
            .iter()
            .map(|row| row.to_record(batch, &source))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| SetupError::SampleReport {
                batch: batch.to_string(),
                source,
            })?;

        let overrides = ArtifactOverrides {
            allow_calibration_override: overrides.allow_calibration_override
                || self.config.allow_calibration_override,
            ..overrides.clone()
        };
        let artifacts =
            resolve_shared_artifacts(batch, &kept, &self.config.bucket, &self.keys, &overrides)?;

        info!(
            batch = %batch,
            samples = samples.len(),
            calibration = %artifacts.calibration,
            manifest = %artifacts.manifest,
            "Prepared batch"
        );

        Ok(BatchRequest {
            batch: batch.to_string(),
            samples,
            artifacts,
        })
    }

    async fn fetch_shared(
        &self,
        artifact: &'static str,
        location: &ObjectLocation,
        workspace: &BatchWorkspace,
    ) -> Result<PathBuf, SetupError> {
        let dest = workspace.shared_path(location.file_name());
        download_with_retry(
            self.store.as_ref(),
            &self.config.retry_policy(),
            location,
            &dest,
        )
        .await
        .map_err(|source| SetupError::ArtifactUnavailable {
            artifact,
            location: location.to_string(),
            source,
        })?;
        Ok(dest)
    }

    /// Runs one batch to completion.
    ///
    /// # Errors
    ///
    /// Returns `SetupError` if the batch cannot be set up, or if the batch-wide
    /// caller invocation fails. Per-sample failures are reported in the summary.
    pub async fn run_batch(&self, request: BatchRequest) -> Result<BatchSummary, SetupError> {
        let started_at = Utc::now();
        let mode = self.config.call_mode;

        if request.samples.is_empty() {
            return Err(SetupError::NoSamples(request.batch));
        }

        info!(
            batch = %request.batch,
            samples = request.samples.len(),
            mode = %mode,
            "Starting batch"
        );

        let workspace = BatchWorkspace::create(&self.config.output_dir, &request.batch).await?;
        let calibration_path = self
            .fetch_shared("calibration", &request.artifacts.calibration, &workspace)
            .await?;
        let manifest_path = self
            .fetch_shared("manifest", &request.artifacts.manifest, &workspace)
            .await?;
        let manifest = self
            .manifests
            .read_manifest(&manifest_path)
            .await
            .map_err(SetupError::Manifest)?;
        info!(markers = manifest.len(), "Loaded manifest");

        let gencall_threads = match mode {
            CallMode::BatchWide => self.config.gencall_threads.or(Some(default_batch_threads())),
            CallMode::PerSample => self.config.gencall_threads,
        };

        let ctx = Arc::new(UnitContext {
            store: Arc::clone(&self.store),
            caller: Arc::clone(&self.caller),
            calls: Arc::clone(&self.calls),
            keys: self.keys.clone(),
            bucket: self.config.bucket.clone(),
            retry: self.config.retry_policy(),
            workspace: workspace.clone(),
            manifest,
            calibration_path,
            gencall_threads,
            metrics: self.metrics.clone(),
        });

        let samples = Arc::new(request.samples);
        let results = match mode {
            CallMode::BatchWide => self.run_batch_wide(&ctx, &samples).await?,
            CallMode::PerSample => self.run_per_sample(&ctx, &samples).await,
        };

        let outcomes: Vec<SampleOutcome> = samples
            .iter()
            .zip(results)
            .map(|(record, result)| match result {
                Ok(success) => {
                    self.metrics
                        .record_sample_success(mode.as_str(), success.elapsed_secs);
                    SampleOutcome::Succeeded(success)
                }
                Err(e) => {
                    warn!(
                        batch = %record.batch,
                        sample_id = %record.sample_id,
                        sample_code = %record.sample_code,
                        kind = %e.kind(),
                        error = %e,
                        "Sample failed"
                    );
                    self.metrics.record_sample_failure(e.kind().as_str());
                    SampleOutcome::Failed(SampleFailure::new(record, &e))
                }
            })
            .collect();

        let all_succeeded = outcomes.iter().all(SampleOutcome::is_success);
        let mut cleaned = false;
        if self.config.cleanup {
            if all_succeeded {
                match workspace.remove_intermediates().await {
                    Ok(()) => cleaned = true,
                    Err(e) => warn!(
                        batch = %request.batch,
                        error = %e,
                        "Cleanup failed, keeping intermediates"
                    ),
                }
            } else {
                info!(batch = %request.batch, "Keeping intermediates: some samples failed");
            }
        }

        let summary = BatchSummary {
            batch: request.batch,
            mode,
            started_at,
            finished_at: Utc::now(),
            samples: outcomes,
            cleaned,
        };

        let summary_path = workspace.summary_path();
        summary
            .write_json(&summary_path)
            .await
            .map_err(|source| SetupError::Workspace {
                path: summary_path,
                source,
            })?;

        self.metrics.record_batch(summary.status().as_str());
        info!(
            batch = %summary.batch,
            succeeded = summary.succeeded().count(),
            failed = summary.failed().count(),
            status = summary.status().as_str(),
            "Finished batch"
        );

        Ok(summary)
    }

    /// Retrieve all, call once over the batch, then extract.
    async fn run_batch_wide(
        &self,
        ctx: &Arc<UnitContext>,
        samples: &Arc<Vec<SampleRecord>>,
    ) -> Result<Vec<Result<SampleSuccess, SampleError>>, SetupError> {
        let pool = self.pool();
        let indices: Vec<usize> = (0..samples.len()).collect();

        let fetched = {
            let ctx = Arc::clone(ctx);
            let samples = Arc::clone(samples);
            pool.map(indices.clone(), move |i| {
                let ctx = Arc::clone(&ctx);
                let samples = Arc::clone(&samples);
                async move {
                    let started = Instant::now();
                    let raw_dir = ctx.workspace.raw_dir();
                    ctx.fetch_raw_scans(&samples[i], &raw_dir).await?;
                    Ok::<Instant, SampleError>(started)
                }
            })
            .await
        };

        let retrieved: Vec<usize> = fetched
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_ok())
            .map(|(i, _)| i)
            .collect();
        info!(
            retrieved = retrieved.len(),
            total = samples.len(),
            "Raw scan retrieval finished"
        );

        let extracted = if retrieved.is_empty() {
            Vec::new()
        } else {
            let request = GencallRequest::new(
                &ctx.manifest.path,
                &ctx.calibration_path,
                ctx.workspace.raw_dir(),
                ctx.workspace.calls_dir(),
            )
            .with_threads(ctx.gencall_threads);

            let response = self.caller.call(&request).await;
            let success = matches!(&response, Ok(r) if r.success());
            self.metrics
                .record_caller(CallMode::BatchWide.as_str(), success);
            let response = response
                .and_then(|r| r.ensure_success())
                .map_err(|e| {
                    error!(error = %e, "Genotype caller failed for batch");
                    SetupError::GenotypeCaller(e)
                })?;
            info!(
                artifacts = response.artifacts.len(),
                duration_secs = response.duration.as_secs_f64(),
                "Genotype caller produced artifacts"
            );

            let jobs: Vec<(usize, Instant)> = fetched
                .iter()
                .enumerate()
                .filter_map(|(i, r)| r.as_ref().ok().map(|started| (i, *started)))
                .collect();

            let ctx = Arc::clone(ctx);
            let samples = Arc::clone(samples);
            pool.map(jobs, move |(i, started)| {
                let ctx = Arc::clone(&ctx);
                let samples = Arc::clone(&samples);
                async move {
                    let record = &samples[i];
                    let artifact = ctx.workspace.calls_dir().join(record.artifact_file_name());
                    ctx.extract(record, artifact, started).await
                }
            })
            .await
        };

        // Merge the two phases back into input order
        let mut extracted = extracted.into_iter();
        let results = fetched
            .into_iter()
            .map(|fetch| match fetch {
                Ok(_) => extracted
                    .next()
                    .unwrap_or(Err(SampleError::Pool(PoolError::Closed))),
                Err(e) => Err(e),
            })
            .collect();

        Ok(results)
    }

    /// One unit per sample, each with its own caller invocation.
    async fn run_per_sample(
        &self,
        ctx: &Arc<UnitContext>,
        samples: &Arc<Vec<SampleRecord>>,
    ) -> Vec<Result<SampleSuccess, SampleError>> {
        let pool = self.pool();
        let ctx = Arc::clone(ctx);
        let samples_for_units = Arc::clone(samples);

        pool.map((0..samples.len()).collect(), move |i| {
            let ctx = Arc::clone(&ctx);
            let samples = Arc::clone(&samples_for_units);
            async move { ctx.process_sample(i + 1, &samples[i]).await }
        })
        .await
    }

    /// Prepares and runs every batch in `targets`, in name order.
    ///
    /// A batch that fails setup is recorded as fatal and the remaining
    /// batches still run.
    pub async fn run(&self, targets: &BatchTargets, overrides: &ArtifactOverrides) -> RunSummary {
        let mut run = RunSummary::new();
        info!(run_id = %run.run_id, batches = targets.len(), "Starting run");

        for (batch, codes) in targets {
            if self.cancel.is_cancelled() {
                warn!(batch = %batch, "Run cancelled before batch started");
                run.record_fatal(batch.clone(), "cancelled before start");
                continue;
            }

            let outcome = match self.prepare_batch(batch, codes.as_ref(), overrides).await {
                Ok(request) => self.run_batch(request).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(summary) => run.record_batch(summary),
                Err(e) => {
                    error!(batch = %batch, error = %e, "Batch failed");
                    self.metrics.record_batch("fatal");
                    run.record_fatal(batch.clone(), &e);
                }
            }
        }

        run.finish();
        info!(
            run_id = %run.run_id,
            succeeded = run.samples_succeeded(),
            failed = run.samples_failed(),
            status = run.status().as_str(),
            "Run finished"
        );
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::GencallResponse;
    use crate::intensity::RawIntensity;
    use crate::storage::LocalObjectStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedManifest;

    #[async_trait]
    impl ManifestReader for FixedManifest {
        async fn read_manifest(&self, path: &Path) -> Result<Manifest, crate::error::ParseError> {
            Ok(Manifest {
                path: path.to_path_buf(),
                names: vec!["M1".to_string(), "M2".to_string()],
                normalization_lookups: vec![0, 0],
            })
        }
    }

    struct FixedCalls;

    #[async_trait]
    impl CallReader for FixedCalls {
        async fn read_intensities(
            &self,
            _artifact: &Path,
            _manifest: &Manifest,
        ) -> Result<Vec<RawIntensity>, crate::error::ParseError> {
            Ok(vec![RawIntensity::new(0.0, 0.0), RawIntensity::new(2.0, 0.0)])
        }
    }

    /// Writes one artifact per Grn scan found in the input folder.
    struct TouchCaller;

    #[async_trait]
    impl GenotypeCaller for TouchCaller {
        async fn call(&self, request: &GencallRequest) -> Result<GencallResponse, ExternalToolError> {
            let mut artifacts = Vec::new();
            let entries = std::fs::read_dir(&request.input_dir).map_err(|source| {
                ExternalToolError::Spawn {
                    program: "touch-caller".to_string(),
                    source,
                }
            })?;
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(stem) = name.strip_suffix("_Grn.idat") {
                    let path = request.output_dir.join(format!("{stem}.gtc"));
                    std::fs::write(&path, b"gtc").map_err(|source| ExternalToolError::Spawn {
                        program: "touch-caller".to_string(),
                        source,
                    })?;
                    artifacts.push(path);
                }
            }
            Ok(GencallResponse {
                program: "touch-caller".to_string(),
                exit_code: Some(0),
                artifacts,
                duration: Duration::from_millis(1),
                stderr: String::new(),
            })
        }
    }

    fn seed(root: &Path, key: &str, bytes: &[u8]) {
        let path = root.join("bucket").join(key);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, bytes).expect("write");
    }

    fn record(id: &str, position: &str) -> SampleRecord {
        SampleRecord {
            sample_id: id.to_string(),
            sample_code: format!("c{id}"),
            batch: "b".to_string(),
            chip_id: "2050".to_string(),
            chip_position: position.to_string(),
        }
    }

    /// Refuses to run when a Grn scan has no Red partner.
    struct PairedCaller;

    #[async_trait]
    impl GenotypeCaller for PairedCaller {
        async fn call(&self, request: &GencallRequest) -> Result<GencallResponse, ExternalToolError> {
            let names: Vec<String> = std::fs::read_dir(&request.input_dir)
                .map_err(|source| ExternalToolError::Spawn {
                    program: "paired-caller".to_string(),
                    source,
                })?
                .flatten()
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .collect();
            let unpaired = names.iter().any(|name| {
                name.strip_suffix("_Grn.idat")
                    .is_some_and(|stem| !names.contains(&format!("{stem}_Red.idat")))
            });
            if unpaired {
                return Ok(GencallResponse {
                    program: "paired-caller".to_string(),
                    exit_code: Some(1),
                    artifacts: Vec::new(),
                    duration: Duration::from_millis(1),
                    stderr: "unpaired scan".to_string(),
                });
            }
            TouchCaller.call(request).await
        }
    }

    /// Leaves a plain file where the raw scan folder was, so it cannot be
    /// removed as a directory afterwards.
    struct ClobberingCaller;

    #[async_trait]
    impl GenotypeCaller for ClobberingCaller {
        async fn call(&self, request: &GencallRequest) -> Result<GencallResponse, ExternalToolError> {
            let response = TouchCaller.call(request).await?;
            let clobber = || -> std::io::Result<()> {
                std::fs::remove_dir_all(&request.input_dir)?;
                std::fs::write(&request.input_dir, b"not a directory")
            };
            clobber().map_err(|source| ExternalToolError::Spawn {
                program: "clobbering-caller".to_string(),
                source,
            })?;
            Ok(response)
        }
    }

    fn config(output: &Path, mode: CallMode) -> PipelineConfig {
        PipelineConfig::default()
            .with_bucket("bucket")
            .with_output_dir(output)
            .with_call_mode(mode)
            .with_pool_multiplier(1)
            .with_max_attempts(1)
    }

    fn orchestrator_with(
        store_root: &Path,
        config: PipelineConfig,
        caller: Arc<dyn GenotypeCaller>,
    ) -> BatchOrchestrator {
        BatchOrchestrator::new(
            config,
            Arc::new(LocalObjectStore::new(store_root)),
            caller,
            Arc::new(FixedManifest),
            Arc::new(FixedCalls),
        )
    }

    fn orchestrator(store_root: &Path, output: &Path, mode: CallMode) -> BatchOrchestrator {
        orchestrator_with(store_root, config(output, mode), Arc::new(TouchCaller))
    }

    fn request(samples: Vec<SampleRecord>) -> BatchRequest {
        BatchRequest {
            batch: "b".to_string(),
            samples,
            artifacts: SharedArtifacts {
                calibration: ObjectLocation::new("bucket", "cal/c.egt"),
                manifest: ObjectLocation::new("bucket", "man/m.bpm"),
            },
        }
    }

    fn seed_shared(root: &Path) {
        seed(root, "cal/c.egt", b"egt");
        seed(root, "man/m.bpm", b"bpm");
    }

    fn seed_scans(root: &Path, record: &SampleRecord) {
        let keys = KeyLayout::new("");
        for channel in Channel::ALL {
            seed(root, &keys.raw_scan(record, channel), b"idat");
        }
    }

    #[tokio::test]
    async fn test_run_batch_wide() {
        let store = tempfile::tempdir().expect("tempdir");
        let out = tempfile::tempdir().expect("tempdir");
        seed_shared(store.path());
        let samples = vec![record("S1", "R01C01"), record("S2", "R02C01")];
        for s in &samples {
            seed_scans(store.path(), s);
        }

        let summary = orchestrator(store.path(), out.path(), CallMode::BatchWide)
            .run_batch(request(samples))
            .await
            .expect("batch");

        assert!(summary.all_succeeded());
        let table = std::fs::read_to_string(out.path().join("b/S1_cS1_normalized_intensity.tsv"))
            .expect("table");
        assert_eq!(table, "Name\tNormR\tNormTheta\nM1\t\t\nM2\t2.0\t0.0\n");
        assert!(out.path().join("b/summary.json").exists());
    }

    #[tokio::test]
    async fn test_run_per_sample_uses_private_dirs() {
        let store = tempfile::tempdir().expect("tempdir");
        let out = tempfile::tempdir().expect("tempdir");
        seed_shared(store.path());
        let samples = vec![record("S1", "R01C01"), record("S2", "R02C01")];
        for s in &samples {
            seed_scans(store.path(), s);
        }

        let summary = orchestrator(store.path(), out.path(), CallMode::PerSample)
            .run_batch(request(samples))
            .await
            .expect("batch");

        assert!(summary.all_succeeded());
        assert!(out.path().join("b/idats/2_2050_R02C01/2050_R02C01_Red.idat").exists());
        assert!(out.path().join("b/gtcs/1_2050_R01C01/2050_R01C01.gtc").exists());
    }

    #[tokio::test]
    async fn test_missing_shared_artifact_is_fatal() {
        let store = tempfile::tempdir().expect("tempdir");
        let out = tempfile::tempdir().expect("tempdir");
        seed(store.path(), "man/m.bpm", b"bpm");
        let samples = vec![record("S1", "R01C01")];
        seed_scans(store.path(), &samples[0]);

        let err = orchestrator(store.path(), out.path(), CallMode::BatchWide)
            .run_batch(request(samples))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SetupError::ArtifactUnavailable {
                artifact: "calibration",
                ..
            }
        ));
        assert!(!out.path().join("b/S1_cS1_normalized_intensity.tsv").exists());
    }

    #[tokio::test]
    async fn test_empty_batch_is_fatal() {
        let store = tempfile::tempdir().expect("tempdir");
        let out = tempfile::tempdir().expect("tempdir");
        let err = orchestrator(store.path(), out.path(), CallMode::BatchWide)
            .run_batch(request(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::NoSamples(_)));
    }

    #[tokio::test]
    async fn test_half_retrieved_scan_pair_is_removed() {
        let store = tempfile::tempdir().expect("tempdir");
        let out = tempfile::tempdir().expect("tempdir");
        seed_shared(store.path());
        let samples = vec![record("S1", "R01C01"), record("S2", "R02C01")];
        seed_scans(store.path(), &samples[0]);
        let keys = KeyLayout::new("");
        seed(store.path(), &keys.raw_scan(&samples[1], Channel::Grn), b"idat");

        let summary = orchestrator_with(
            store.path(),
            config(out.path(), CallMode::BatchWide),
            Arc::new(PairedCaller),
        )
        .run_batch(request(samples))
        .await
        .expect("batch");

        assert_eq!(summary.status(), crate::pipeline::RunStatus::Partial);
        assert_eq!(summary.succeeded().count(), 1);
        let failures: Vec<&SampleFailure> = summary.failed().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].sample_id, "S2");
        assert_eq!(failures[0].kind, crate::error::FailureKind::Retrieval);
        assert!(!out.path().join("b/idats/2050_R02C01_Grn.idat").exists());
        assert!(out.path().join("b/idats/2050_R01C01_Grn.idat").exists());
    }

    #[tokio::test]
    async fn test_cleanup_failure_keeps_batch() {
        let store = tempfile::tempdir().expect("tempdir");
        let out = tempfile::tempdir().expect("tempdir");
        seed_shared(store.path());
        let samples = vec![record("S1", "R01C01")];
        seed_scans(store.path(), &samples[0]);

        let summary = orchestrator_with(
            store.path(),
            config(out.path(), CallMode::BatchWide).with_cleanup(true),
            Arc::new(ClobberingCaller),
        )
        .run_batch(request(samples))
        .await
        .expect("batch");

        assert!(summary.all_succeeded());
        assert!(!summary.cleaned);
        assert!(out.path().join("b/S1_cS1_normalized_intensity.tsv").exists());
        let written: serde_json::Value = serde_json::from_slice(
            &std::fs::read(out.path().join("b/summary.json")).expect("summary"),
        )
        .expect("json");
        assert_eq!(written["cleaned"], serde_json::Value::Bool(false));
    }

    #[tokio::test]
    async fn test_cancelled_units_are_failures() {
        let store = tempfile::tempdir().expect("tempdir");
        let out = tempfile::tempdir().expect("tempdir");
        seed_shared(store.path());
        let samples = vec![record("S1", "R01C01")];
        seed_scans(store.path(), &samples[0]);

        let cancel = CancellationFlag::new();
        cancel.cancel();
        let summary = orchestrator(store.path(), out.path(), CallMode::PerSample)
            .with_cancellation(cancel)
            .run_batch(request(samples))
            .await
            .expect("batch");

        let failures: Vec<&SampleFailure> = summary.failed().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, crate::error::FailureKind::Cancelled);
    }
}
