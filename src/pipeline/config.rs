//! Pipeline configuration.
//!
//! This module provides the settings a run needs: where deliveries live, how
//! samples are called, how much parallelism to use, and how remote fetches
//! are retried.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::{DEFAULT_BEAD_ARRAY_PROGRAM, DEFAULT_GENCALL_PROGRAM};
use crate::scheduler::DEFAULT_POOL_MULTIPLIER;
use crate::utils::RetryPolicy;

/// Bucket holding deliveries, manifests and calibration files.
pub const DEFAULT_BUCKET: &str = "illumina-embark-data";

/// Default object storage endpoint.
pub const DEFAULT_STORAGE_ENDPOINT: &str = "https://s3.us-east-1.amazonaws.com";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// How the genotype caller is applied to a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CallMode {
    /// One caller invocation over the whole batch.
    #[default]
    BatchWide,
    /// One caller invocation per sample, in the sample's own folders.
    PerSample,
}

impl CallMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallMode::BatchWide => "batch-wide",
            CallMode::PerSample => "per-sample",
        }
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "batch-wide" | "batch_wide" | "batch" => Ok(CallMode::BatchWide),
            "per-sample" | "per_sample" | "sample" => Ok(CallMode::PerSample),
            other => Err(format!("unknown call mode '{other}'")),
        }
    }
}

/// Configuration for a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    // Storage settings
    /// Bucket holding deliveries and shared artifacts.
    pub bucket: String,
    /// Environment folder prepended to every key (empty in production).
    pub env_prefix: String,
    /// `http(s)://` endpoint, or a local directory with one folder per bucket.
    pub storage_endpoint: String,
    /// Bearer token for the HTTP endpoint.
    pub storage_token: Option<String>,
    /// Genotype metadata database. Required for sample code lists.
    pub database_url: Option<String>,
    /// Root of per-batch output directories.
    pub output_dir: PathBuf,

    // Calling settings
    pub call_mode: CallMode,
    pub gencall_program: String,
    /// Threads passed to the caller; `None` lets the mode decide.
    pub gencall_threads: Option<usize>,
    pub bead_array_program: String,

    // Execution settings
    /// Workers per processing unit.
    pub pool_multiplier: usize,
    /// Attempts per remote fetch, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Remove raw scans and call artifacts after a fully successful batch.
    pub cleanup: bool,
    /// Accept an explicit calibration file that differs from the sample report.
    pub allow_calibration_override: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            env_prefix: String::new(),
            storage_endpoint: DEFAULT_STORAGE_ENDPOINT.to_string(),
            storage_token: None,
            database_url: None,
            output_dir: PathBuf::from("./output"),

            call_mode: CallMode::BatchWide,
            gencall_program: DEFAULT_GENCALL_PROGRAM.to_string(),
            gencall_threads: None,
            bead_array_program: DEFAULT_BEAD_ARRAY_PROGRAM.to_string(),

            pool_multiplier: DEFAULT_POOL_MULTIPLIER,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            cleanup: false,
            allow_calibration_override: false,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `IDAT_FORGE_BUCKET`: Delivery bucket (default: illumina-embark-data)
    /// - `IDAT_FORGE_ENV_PREFIX`: Key prefix (default: empty)
    /// - `IDAT_FORGE_STORAGE_ENDPOINT`: Storage endpoint URL or directory
    /// - `IDAT_FORGE_STORAGE_TOKEN`: Bearer token for the storage endpoint
    /// - `DATABASE_URL`: PostgreSQL connection URL (optional)
    /// - `IDAT_FORGE_OUTPUT_DIR`: Output root (default: ./output)
    /// - `IDAT_FORGE_MODE`: `batch-wide` or `per-sample`
    /// - `IDAT_FORGE_GENCALL_PROGRAM`: Caller executable (default: iaap-cli)
    /// - `IDAT_FORGE_GENCALL_THREADS`: Caller thread count
    /// - `IDAT_FORGE_BEAD_ARRAY_PROGRAM`: Reader helper executable
    /// - `IDAT_FORGE_POOL_MULTIPLIER`: Workers per processing unit (default: 2)
    /// - `IDAT_FORGE_MAX_ATTEMPTS`: Attempts per fetch (default: 3)
    /// - `IDAT_FORGE_INITIAL_BACKOFF_MS`: First retry delay (default: 500)
    /// - `IDAT_FORGE_CLEANUP`: Remove intermediates on success (default: false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if variables have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Storage settings
        if let Some(val) = var("IDAT_FORGE_BUCKET") {
            config.bucket = val;
        }

        if let Some(val) = var("IDAT_FORGE_ENV_PREFIX") {
            config.env_prefix = val;
        }

        if let Some(val) = var("IDAT_FORGE_STORAGE_ENDPOINT") {
            config.storage_endpoint = val;
        }

        config.storage_token = var("IDAT_FORGE_STORAGE_TOKEN").filter(|v| !v.is_empty());
        config.database_url = var("DATABASE_URL").filter(|v| !v.is_empty());

        if let Some(val) = var("IDAT_FORGE_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(val);
        }

        // Calling settings
        if let Some(val) = var("IDAT_FORGE_MODE") {
            config.call_mode = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "IDAT_FORGE_MODE".to_string(),
                message,
            })?;
        }

        if let Some(val) = var("IDAT_FORGE_GENCALL_PROGRAM") {
            config.gencall_program = val;
        }

        if let Some(val) = var("IDAT_FORGE_GENCALL_THREADS") {
            config.gencall_threads = Some(parse_env_value(&val, "IDAT_FORGE_GENCALL_THREADS")?);
        }

        if let Some(val) = var("IDAT_FORGE_BEAD_ARRAY_PROGRAM") {
            config.bead_array_program = val;
        }

        // Execution settings
        if let Some(val) = var("IDAT_FORGE_POOL_MULTIPLIER") {
            config.pool_multiplier = parse_env_value(&val, "IDAT_FORGE_POOL_MULTIPLIER")?;
        }

        if let Some(val) = var("IDAT_FORGE_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "IDAT_FORGE_MAX_ATTEMPTS")?;
        }

        if let Some(val) = var("IDAT_FORGE_INITIAL_BACKOFF_MS") {
            let ms: u64 = parse_env_value(&val, "IDAT_FORGE_INITIAL_BACKOFF_MS")?;
            config.initial_backoff = Duration::from_millis(ms);
        }

        if let Some(val) = var("IDAT_FORGE_CLEANUP") {
            config.cleanup = parse_env_bool(&val, "IDAT_FORGE_CLEANUP")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "bucket cannot be empty".to_string(),
            ));
        }

        if self.storage_endpoint.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "storage_endpoint cannot be empty".to_string(),
            ));
        }

        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "output_dir cannot be empty".to_string(),
            ));
        }

        if self.gencall_program.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "gencall_program cannot be empty".to_string(),
            ));
        }

        if self.gencall_threads == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "gencall_threads must be greater than 0".to_string(),
            ));
        }

        if self.bead_array_program.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "bead_array_program cannot be empty".to_string(),
            ));
        }

        if self.pool_multiplier == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool_multiplier must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry policy for remote fetches.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts).with_initial_backoff(self.initial_backoff)
    }

    /// Builder method to set the bucket.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// Builder method to set the environment prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Builder method to set the storage endpoint.
    pub fn with_storage_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.storage_endpoint = endpoint.into();
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    /// Builder method to set the output directory.
    pub fn with_output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    /// Builder method to set the call mode.
    pub fn with_call_mode(mut self, mode: CallMode) -> Self {
        self.call_mode = mode;
        self
    }

    /// Builder method to set the caller thread count.
    pub fn with_gencall_threads(mut self, threads: Option<usize>) -> Self {
        self.gencall_threads = threads;
        self
    }

    /// Builder method to set the pool multiplier.
    pub fn with_pool_multiplier(mut self, multiplier: usize) -> Self {
        self.pool_multiplier = multiplier;
        self
    }

    /// Builder method to set the attempt budget per fetch.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Builder method to set the first retry delay.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Builder method to enable or disable cleanup.
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Builder method to allow calibration overrides.
    pub fn with_calibration_override(mut self, allow: bool) -> Self {
        self.allow_calibration_override = allow;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
