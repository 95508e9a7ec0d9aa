//! Delivery layout and sample resolution.
//!
//! A delivery (batch) is a set of scanned samples in the object store,
//! described by a sample report. This module parses those reports, builds
//! object keys, and decides which samples and shared artifacts a run uses.

pub mod keys;
pub mod report;
pub mod targets;

pub use keys::{raw_scan_file_name, Channel, KeyLayout};
pub use report::{filter_rows, parse_sample_report, SampleRecord, SampleReportRow};
pub use targets::{
    check_batch_name, parse_batch_list, parse_sample_codes, read_sample_codes,
    resolve_shared_artifacts, resolve_targets, ArtifactOverrides, BatchTargets, SharedArtifacts,
    TargetSelection,
};
