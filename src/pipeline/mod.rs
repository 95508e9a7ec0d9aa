//! Batch processing pipeline.
//!
//! This module turns resolved batches into per-sample intensity tables.
//!
//! # Architecture
//!
//! - **Orchestrator**: prepares each batch and fans its samples out over the worker pool
//! - **Workspace**: the on-disk layout of one batch
//! - **Summary**: per-sample outcomes, batch and run status
//! - **Config**: settings for all pipeline components
//!
//! # Pipeline Flow
//!
//! 1. **Preparation**: the sample report is fetched, filtered and validated,
//!    and the shared calibration and manifest files are located
//! 2. **Shared artifacts**: calibration and manifest are downloaded once per batch
//! 3. **Calling**: raw scans are retrieved and the genotype caller runs, either
//!    once over the batch or once per sample
//! 4. **Extraction**: intensities are read, converted to polar form and written
//! 5. **Reporting**: the batch summary is written and intermediates optionally removed
//!
//! # Example
//!
//! ```rust,ignore
//! use idat_forge::pipeline::{BatchOrchestrator, CallMode, PipelineConfig};
//!
//! let config = PipelineConfig::from_env()?
//!     .with_call_mode(CallMode::PerSample)
//!     .with_cleanup(true);
//!
//! let orchestrator = BatchOrchestrator::from_config(config)?;
//! let summary = orchestrator.run(&targets, &ArtifactOverrides::default()).await;
//! std::process::exit(summary.status().exit_code().into());
//! ```

pub mod config;
pub mod orchestrator;
pub mod summary;
pub mod workspace;

// Re-export main types for convenience
pub use config::{CallMode, ConfigError, PipelineConfig};
pub use orchestrator::{BatchOrchestrator, BatchRequest};
pub use summary::{
    BatchSummary, FatalBatch, RunStatus, RunSummary, SampleFailure, SampleOutcome, SampleSuccess,
};
pub use workspace::BatchWorkspace;
