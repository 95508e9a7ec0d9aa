//! External programs the pipeline drives.
//!
//! - **Genotype caller**: raw scan pairs → call artifacts (`iaap-cli gencall`)
//! - **Readers**: manifest marker lists and per-marker normalized intensities
//!
//! # Example
//!
//! ```ignore
//! use idat_forge::execution::{BeadArrayTool, GencallRequest, GenotypeCaller, IaapCli, ManifestReader};
//!
//! let manifest = BeadArrayTool::default().read_manifest(&bpm_path).await?;
//! let request = GencallRequest::new(&bpm_path, &egt_path, "b/idats", "b/gtcs").with_threads(Some(7));
//! let response = IaapCli::default().call(&request).await?.ensure_success()?;
//! ```

pub mod gencall;
pub mod readers;

pub use gencall::{
    default_batch_threads, list_artifacts, GencallRequest, GencallResponse, GenotypeCaller,
    IaapCli, ARTIFACT_EXTENSION, DEFAULT_GENCALL_PROGRAM,
};
pub use readers::{
    check_marker_count, parse_intensity_listing, parse_manifest_listing, BeadArrayTool,
    CallReader, Manifest, ManifestReader, DEFAULT_BEAD_ARRAY_PROGRAM,
};
