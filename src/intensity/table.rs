//! Per-sample output table.
//!
//! Tab-separated, header `Name  NormR  NormTheta`, one row per marker in
//! manifest order. Undefined values are empty fields. Tables are rendered in
//! memory and moved into place with a rename, so a reader never sees a
//! partially written file.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;

use super::polar::PolarIntensity;

/// Column names of the output table.
pub const HEADER: [&str; 3] = ["Name", "NormR", "NormTheta"];

/// Suffix appended to every output file name.
pub const TABLE_SUFFIX: &str = "_normalized_intensity.tsv";

/// Facts about a table that has been written.
#[derive(Debug, Clone)]
pub struct WrittenTable {
    pub path: PathBuf,
    pub rows: usize,
    pub no_signal: usize,
    pub sha256: String,
}

/// Formats a value the way the table stores it.
///
/// Shortest round-trip form, integral values keep a trailing `.0`.
pub fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:?}", v),
        None => String::new(),
    }
}

/// Renders the table into bytes.
pub fn render(names: &[String], values: &[PolarIntensity]) -> io::Result<Vec<u8>> {
    if names.len() != values.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "{} marker names but {} intensity values",
                names.len(),
                values.len()
            ),
        ));
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::with_capacity(names.len() * 32));

    writer.write_record(HEADER)?;
    for (name, value) in names.iter().zip(values) {
        let r = format_value(value.r());
        let theta = format_value(value.theta());
        writer.write_record([name.as_str(), r.as_str(), theta.as_str()])?;
    }

    writer
        .into_inner()
        .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string()))
}

/// Writes the table to `path`, replacing any previous version.
pub async fn write_table(
    path: &Path,
    names: &[String],
    values: &[PolarIntensity],
) -> io::Result<WrittenTable> {
    let bytes = render(names, values)?;
    let sha256 = hex::encode(Sha256::digest(&bytes));

    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    fs::write(&partial, &bytes).await?;
    if let Err(e) = fs::rename(&partial, path).await {
        let _ = fs::remove_file(&partial).await;
        return Err(e);
    }

    Ok(WrittenTable {
        path: path.to_path_buf(),
        rows: values.len(),
        no_signal: values.iter().filter(|v| v.is_no_signal()).count(),
        sha256,
    })
}
