//! idat-forge: genotyping delivery pipeline.
//!
//! This library downloads raw array scans from object storage, drives the
//! genotype caller, and writes per-sample normalized polar intensity tables.

// Core modules
pub mod cli;
pub mod delivery;
pub mod error;
pub mod execution;
pub mod intensity;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod storage;
pub mod utils;

// Re-export commonly used error types
pub use error::{
    ExternalToolError, FailureKind, ParseError, RetrievalError, SampleError, SetupError,
};
