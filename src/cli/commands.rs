//! CLI command definitions for idat-forge.
//!
//! `run` processes deliveries end to end; `resolve` only shows what a run
//! would process.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::delivery::{
    parse_batch_list, read_sample_codes, resolve_targets, ArtifactOverrides, BatchTargets,
    SampleRecord, TargetSelection,
};
use crate::metrics::{init_metrics, write_metrics_file};
use crate::pipeline::{BatchOrchestrator, CallMode, PipelineConfig, RunStatus};
use crate::scheduler::CancellationFlag;
use crate::storage::{MetadataSource, ObjectLocation, PgMetadataSource};

/// Raw array scans to per-sample normalized intensity tables.
#[derive(Parser)]
#[command(name = "idat-forge")]
#[command(about = "Turn genotyping deliveries into per-sample normalized intensity tables")]
#[command(version)]
#[command(
    long_about = "idat-forge downloads raw scans for whole deliveries or selected sample codes, runs the genotype caller, and writes one Name/NormR/NormTheta table per sample.\n\nExample usage:\n  idat-forge run --batch-names embark_2021-12-23_0609 --output-dir ./output --cleanup"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Process deliveries and write intensity tables.
    Run(Box<RunArgs>),

    /// Print the samples and shared artifacts each batch would use.
    Resolve(ResolveArgs),
}

/// What to process. Exactly one of the two inputs is required.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct TargetArgs {
    /// Comma-separated delivery names (e.g. embark_2021-12-23_0609,embark_2022-01-05_0800).
    #[arg(long)]
    pub batch_names: Option<String>,

    /// File with one sample code per line. Requires --database-url.
    #[arg(long)]
    pub sample_code_file: Option<PathBuf>,
}

/// Where deliveries and sample metadata live.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Genotype metadata database.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Object storage endpoint: an http(s) URL or a local directory.
    #[arg(long, env = "IDAT_FORGE_STORAGE_ENDPOINT")]
    pub storage_endpoint: Option<String>,

    /// Bearer token for the storage endpoint.
    #[arg(long, env = "IDAT_FORGE_STORAGE_TOKEN", hide_env_values = true)]
    pub storage_token: Option<String>,

    /// Delivery bucket.
    #[arg(long)]
    pub bucket: Option<String>,

    /// Environment folder prepended to every object key.
    #[arg(long)]
    pub env_prefix: Option<String>,

    /// Calibration (cluster) file, e.g. s3://bucket/Cluster_Files_Updated_Monthly/x.egt.
    #[arg(long)]
    pub calibration_path: Option<String>,

    /// Manifest file, e.g. s3://bucket/beadpool-manifests/x.bpm.
    #[arg(long)]
    pub manifest_path: Option<String>,

    /// Accept a calibration file that differs from the sample report.
    #[arg(long)]
    pub allow_calibration_override: bool,
}

/// Arguments for `idat-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub targets: TargetArgs,

    #[command(flatten)]
    pub source: SourceArgs,

    /// Root of the per-batch output directories.
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// How the genotype caller is applied.
    #[arg(long, value_enum)]
    pub mode: Option<CallMode>,

    /// Remove raw scans and call artifacts after a fully successful batch.
    #[arg(long)]
    pub cleanup: bool,

    /// Workers per processing unit.
    #[arg(long)]
    pub pool_multiplier: Option<usize>,

    /// Threads passed to the genotype caller.
    #[arg(long)]
    pub gencall_threads: Option<usize>,

    /// Attempts per remote fetch, including the first.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Print the run summary as JSON on stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `idat-forge resolve`.
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    #[command(flatten)]
    pub targets: TargetArgs,

    #[command(flatten)]
    pub source: SourceArgs,

    /// Print JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// One resolved batch, as printed by `resolve`.
#[derive(Debug, Serialize)]
struct ResolvedBatch {
    batch: String,
    calibration: String,
    manifest: String,
    samples: Vec<SampleRecord>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<RunStatus> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Returns the overall status; the caller maps it to the process exit code.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<RunStatus> {
    match cli.command {
        Commands::Run(args) => run_command(*args).await,
        Commands::Resolve(args) => resolve_command(args).await,
    }
}

impl SourceArgs {
    fn apply(&self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(endpoint) = &self.storage_endpoint {
            config.storage_endpoint = endpoint.clone();
        }
        if self.storage_token.is_some() {
            config.storage_token = self.storage_token.clone();
        }
        if self.database_url.is_some() {
            config.database_url = self.database_url.clone();
        }
        if let Some(bucket) = &self.bucket {
            config.bucket = bucket.clone();
        }
        if let Some(prefix) = &self.env_prefix {
            config.env_prefix = prefix.clone();
        }
        if self.allow_calibration_override {
            config.allow_calibration_override = true;
        }
        config
    }

    fn overrides(&self) -> anyhow::Result<ArtifactOverrides> {
        let parse = |value: &Option<String>, flag: &str| {
            value
                .as_deref()
                .map(ObjectLocation::parse)
                .transpose()
                .with_context(|| format!("invalid {flag}"))
        };
        Ok(ArtifactOverrides {
            calibration: parse(&self.calibration_path, "--calibration-path")?,
            manifest: parse(&self.manifest_path, "--manifest-path")?,
            allow_calibration_override: self.allow_calibration_override,
        })
    }
}

impl RunArgs {
    /// Environment configuration with command-line flags on top.
    fn config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = self.source.apply(PipelineConfig::from_env()?);

        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(mode) = self.mode {
            config.call_mode = mode;
        }
        if self.cleanup {
            config.cleanup = true;
        }
        if let Some(multiplier) = self.pool_multiplier {
            config.pool_multiplier = multiplier;
        }
        if self.gencall_threads.is_some() {
            config.gencall_threads = self.gencall_threads;
        }
        if let Some(attempts) = self.max_attempts {
            config.max_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }
}

async fn resolve_selection(
    targets: &TargetArgs,
    config: &PipelineConfig,
) -> anyhow::Result<BatchTargets> {
    let selection = match (&targets.batch_names, &targets.sample_code_file) {
        (Some(list), _) => TargetSelection::Batches(parse_batch_list(list)),
        (None, Some(path)) => TargetSelection::SampleCodes(read_sample_codes(path).await?),
        (None, None) => anyhow::bail!("one of --batch-names or --sample-code-file is required"),
    };

    let database = match &config.database_url {
        Some(url) => Some(
            PgMetadataSource::connect(url)
                .await
                .context("failed to connect to the metadata database")?,
        ),
        None => None,
    };
    let metadata = database.as_ref().map(|db| db as &dyn MetadataSource);

    let targets = resolve_targets(&selection, metadata).await?;
    if targets.is_empty() {
        anyhow::bail!("no batches to process");
    }
    Ok(targets)
}

fn install_ctrl_c(cancel: CancellationFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing running samples and skipping the rest");
            cancel.cancel();
        }
    });
}

async fn run_command(args: RunArgs) -> anyhow::Result<RunStatus> {
    let config = args.config()?;
    let overrides = args.source.overrides()?;

    if args.metrics_file.is_some() {
        init_metrics().context("failed to initialize metrics")?;
    }

    let targets = resolve_selection(&args.targets, &config).await?;

    let cancel = CancellationFlag::new();
    install_ctrl_c(cancel.clone());

    info!(
        batches = targets.len(),
        mode = %config.call_mode,
        output_dir = %config.output_dir.display(),
        "Starting idat-forge"
    );
    let orchestrator = BatchOrchestrator::from_config(config)?.with_cancellation(cancel);
    let summary = orchestrator.run(&targets, &overrides).await;

    if let Some(path) = &args.metrics_file {
        if let Err(e) = write_metrics_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to write metrics file");
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for batch in &summary.batches {
            println!(
                "{}: {} succeeded, {} failed",
                batch.batch,
                batch.succeeded().count(),
                batch.failed().count()
            );
            for failure in batch.failed() {
                println!(
                    "  {} ({}) [{}] {}",
                    failure.sample_id, failure.sample_code, failure.kind, failure.reason
                );
            }
        }
        for fatal in &summary.fatal {
            println!("{}: FAILED {}", fatal.batch, fatal.reason);
        }
    }

    Ok(summary.status())
}

async fn resolve_command(args: ResolveArgs) -> anyhow::Result<RunStatus> {
    let config = args.source.apply(PipelineConfig::from_env()?);
    config.validate()?;
    let overrides = args.source.overrides()?;

    let targets = resolve_selection(&args.targets, &config).await?;
    let orchestrator = BatchOrchestrator::from_config(config)?;

    // Reports are small; fetch them all at once
    let prepared = join_all(targets.iter().map(|(batch, codes)| {
        orchestrator.prepare_batch(batch, codes.as_ref(), &overrides)
    }))
    .await;

    let mut status = RunStatus::Success;
    let mut resolved = Vec::new();
    for (batch, result) in targets.keys().zip(prepared) {
        match result {
            Ok(request) => resolved.push(ResolvedBatch {
                batch: request.batch,
                calibration: request.artifacts.calibration.to_string(),
                manifest: request.artifacts.manifest.to_string(),
                samples: request.samples,
            }),
            Err(e) => {
                warn!(batch = %batch, error = %e, "Batch could not be resolved");
                eprintln!("{batch}: {e}");
                status = RunStatus::Fatal;
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
    } else {
        for batch in &resolved {
            println!("{} ({} samples)", batch.batch, batch.samples.len());
            println!("  calibration: {}", batch.calibration);
            println!("  manifest:    {}", batch.manifest);
            for sample in &batch.samples {
                println!(
                    "  {}\t{}\t{}",
                    sample.sample_id,
                    sample.sample_code,
                    sample.scan_stem()
                );
            }
        }
    }

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let args = vec!["idat-forge", "run", "--batch-names", "embark_2021-12-23_0609"];
        let cli = Cli::try_parse_from(args).expect("should parse");

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.targets.batch_names.as_deref(), Some("embark_2021-12-23_0609"));
                assert!(args.targets.sample_code_file.is_none());
                assert!(args.mode.is_none());
                assert!(!args.cleanup);
                assert!(!args.json);
                assert!(args.metrics_file.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_command_with_all_options() {
        let args = vec![
            "idat-forge",
            "-l",
            "debug",
            "run",
            "--sample-code-file",
            "codes.txt",
            "--calibration-path",
            "s3://illumina-embark-data/Cluster_Files_Updated_Monthly/Embark_2021.egt",
            "--manifest-path",
            "s3://illumina-embark-data/beadpool-manifests/Embark_2021_260k.bpm",
            "-o",
            "/scratch/out",
            "--mode",
            "per-sample",
            "--cleanup",
            "--pool-multiplier",
            "3",
            "--gencall-threads",
            "4",
            "--max-attempts",
            "5",
            "--allow-calibration-override",
            "--database-url",
            "postgres://db/genotypes",
            "--storage-endpoint",
            "/mnt/buckets",
            "--bucket",
            "other-bucket",
            "--env-prefix",
            "staging",
            "--metrics-file",
            "metrics.prom",
            "--json",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.targets.sample_code_file, Some(PathBuf::from("codes.txt")));
                assert_eq!(args.mode, Some(CallMode::PerSample));
                assert!(args.cleanup);
                assert_eq!(args.pool_multiplier, Some(3));
                assert_eq!(args.gencall_threads, Some(4));
                assert_eq!(args.max_attempts, Some(5));
                assert!(args.source.allow_calibration_override);
                assert_eq!(args.source.bucket.as_deref(), Some("other-bucket"));
                assert!(args.json);

                let overrides = args.source.overrides().expect("overrides");
                assert_eq!(
                    overrides.calibration.map(|c| c.file_name().to_string()),
                    Some("Embark_2021.egt".to_string())
                );
                assert!(overrides.allow_calibration_override);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_requires_one_target() {
        assert!(Cli::try_parse_from(["idat-forge", "run"]).is_err());
        assert!(Cli::try_parse_from([
            "idat-forge",
            "run",
            "--batch-names",
            "b",
            "--sample-code-file",
            "codes.txt",
        ])
        .is_err());
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let result = Cli::try_parse_from(["idat-forge", "run", "--batch-names", "b", "--mode", "fast"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_source_args_apply() {
        let cli = Cli::try_parse_from([
            "idat-forge",
            "resolve",
            "--batch-names",
            "b",
            "--bucket",
            "other-bucket",
            "--env-prefix",
            "dev",
            "--storage-endpoint",
            "/mnt/buckets",
            "--json",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Resolve(args) => {
                let config = args.source.apply(PipelineConfig::default());
                assert_eq!(config.bucket, "other-bucket");
                assert_eq!(config.env_prefix, "dev");
                assert_eq!(config.storage_endpoint, "/mnt/buckets");
                assert!(!config.allow_calibration_override);
                assert!(args.json);
            }
            _ => panic!("Expected Resolve command"),
        }
    }

    #[test]
    fn test_invalid_override_location() {
        let cli = Cli::try_parse_from([
            "idat-forge",
            "resolve",
            "--batch-names",
            "b",
            "--manifest-path",
            "not-a-uri",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Resolve(args) => {
                let err = args.source.overrides().unwrap_err();
                assert!(err.to_string().contains("--manifest-path"));
            }
            _ => panic!("Expected Resolve command"),
        }
    }
}
