//! Command-line interface for idat-forge.
//!
//! Provides the `run` and `resolve` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
