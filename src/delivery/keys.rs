//! Object key layout of the delivery bucket.
//!
//! All keys start with the environment prefix (empty in production):
//!
//! ```text
//! <env>unzipped/<batch>/<batch>-SampleReport.csv
//! <env>unzipped/<batch>/<code>/IDATs/<chip>/<chip>_<pos>_<Grn|Red>.idat
//! <env>Cluster_Files_Updated_Monthly/<calibration file>
//! <env>beadpool-manifests/<product>.bpm
//! ```

use std::fmt;

use super::report::SampleRecord;

/// Scanner color channel of a raw scan file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Grn,
    Red,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Grn, Channel::Red];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Grn => "Grn",
            Channel::Red => "Red",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds object keys under one environment prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyLayout {
    env_prefix: String,
}

impl KeyLayout {
    /// A non-empty prefix always ends with `/`.
    pub fn new(env_prefix: &str) -> Self {
        let trimmed = env_prefix.trim().trim_matches('/');
        let env_prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        Self { env_prefix }
    }

    pub fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    pub fn sample_report(&self, batch: &str) -> String {
        format!("{}unzipped/{batch}/{batch}-SampleReport.csv", self.env_prefix)
    }

    pub fn raw_scan(&self, record: &SampleRecord, channel: Channel) -> String {
        format!(
            "{}unzipped/{}/{}/IDATs/{}/{}",
            self.env_prefix,
            record.batch,
            record.sample_code,
            record.chip_id,
            raw_scan_file_name(record, channel)
        )
    }

    pub fn calibration(&self, file_name: &str) -> String {
        format!("{}Cluster_Files_Updated_Monthly/{file_name}", self.env_prefix)
    }

    pub fn manifest(&self, product: &str) -> String {
        let product = product.strip_suffix(".bpm").unwrap_or(product);
        format!("{}beadpool-manifests/{product}.bpm", self.env_prefix)
    }
}

/// `<chip>_<pos>_<channel>.idat`
pub fn raw_scan_file_name(record: &SampleRecord, channel: Channel) -> String {
    format!("{}_{}.idat", record.scan_stem(), channel)
}
