//! Object storage access for delivery files.
//!
//! Two backends implement [`ObjectStore`]:
//! - [`HttpObjectStore`]: path-style GETs against an S3-compatible endpoint
//! - [`LocalObjectStore`]: a directory holding one subdirectory per bucket
//!
//! Downloads land in a uniquely named `.partial` sibling first and are
//! renamed into place, so an interrupted transfer never leaves a truncated
//! file under the final name.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;
use uuid::Uuid;

use crate::error::RetrievalError;
use crate::utils::{retry_with_backoff, RetryPolicy};

const URI_SCHEME: &str = "s3://";

/// Bucket and key of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parses `s3://bucket/key`.
    pub fn parse(uri: &str) -> Result<Self, RetrievalError> {
        let invalid = || RetrievalError::InvalidLocation(uri.to_string());
        let rest = uri.trim().strip_prefix(URI_SCHEME).ok_or_else(invalid)?;
        let (bucket, key) = rest.split_once('/').ok_or_else(invalid)?;
        if bucket.is_empty() || key.is_empty() || key.ends_with('/') {
            return Err(invalid());
        }
        Ok(Self::new(bucket, key))
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", URI_SCHEME, self.bucket, self.key)
    }
}

impl FromStr for ObjectLocation {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Fetch-by-key access to a blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads the whole object into memory.
    async fn fetch(&self, location: &ObjectLocation) -> Result<Vec<u8>, RetrievalError>;

    /// Copies the object to `dest`, returning the number of bytes written.
    async fn download(&self, location: &ObjectLocation, dest: &Path) -> Result<u64, RetrievalError> {
        let bytes = self.fetch(location).await?;
        write_atomically(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}

async fn write_atomically(dest: &Path, bytes: &[u8]) -> Result<(), RetrievalError> {
    let io_err = |source| RetrievalError::Io {
        path: dest.to_path_buf(),
        source,
    };

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    // Unique per download: concurrent writers of the same object never share it
    let mut partial = dest.as_os_str().to_owned();
    partial.push(format!(".{}.partial", Uuid::new_v4().simple()));
    let partial = PathBuf::from(partial);

    tokio::fs::write(&partial, bytes).await.map_err(io_err)?;
    if let Err(e) = tokio::fs::rename(&partial, dest).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(io_err(e));
    }
    Ok(())
}

/// Downloads `location` to `dest`, retrying transient failures.
pub async fn download_with_retry(
    store: &dyn ObjectStore,
    policy: &RetryPolicy,
    location: &ObjectLocation,
    dest: &Path,
) -> Result<u64, RetrievalError> {
    retry_with_backoff(policy, "download", |attempt| async move {
        debug!(location = %location, attempt = attempt, "Downloading object");
        store.download(location, dest).await
    })
    .await
}

/// Fetches `location` into memory, retrying transient failures.
pub async fn fetch_with_retry(
    store: &dyn ObjectStore,
    policy: &RetryPolicy,
    location: &ObjectLocation,
) -> Result<Vec<u8>, RetrievalError> {
    retry_with_backoff(policy, "fetch", |attempt| async move {
        debug!(location = %location, attempt = attempt, "Fetching object");
        store.fetch(location).await
    })
    .await
}

/// Opens a store for `endpoint`: `http(s)://` URLs use HTTP, anything else is
/// treated as a local directory.
pub fn open_store(
    endpoint: &str,
    token: Option<String>,
) -> Result<Arc<dyn ObjectStore>, RetrievalError> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(Arc::new(HttpObjectStore::new(endpoint, token)?))
    } else {
        Ok(Arc::new(LocalObjectStore::new(endpoint)))
    }
}

/// S3-compatible store addressed path-style: `<endpoint>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    endpoint: String,
    token: Option<String>,
    client: Client,
}

impl HttpObjectStore {
    /// Fails if the HTTP client cannot be built (e.g. no TLS backend).
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self, RetrievalError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| RetrievalError::Client(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    /// Request URL for `location`, with each key segment percent-encoded.
    pub fn object_url(&self, location: &ObjectLocation) -> String {
        let key = location
            .key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/{}/{}",
            self.endpoint,
            urlencoding::encode(&location.bucket),
            key
        )
    }
}

/// Maps an unsuccessful HTTP status to a retrieval error.
pub fn classify_status(key: &str, status: StatusCode) -> RetrievalError {
    if status == StatusCode::NOT_FOUND {
        RetrievalError::NotFound {
            key: key.to_string(),
        }
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetrievalError::Transient {
            key: key.to_string(),
            reason: format!("HTTP {status}"),
        }
    } else {
        RetrievalError::Rejected {
            key: key.to_string(),
            status: status.as_u16(),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch(&self, location: &ObjectLocation) -> Result<Vec<u8>, RetrievalError> {
        let url = self.object_url(location);
        let mut request = self.client.get(&url).header("User-Agent", "idat-forge/1.0");
        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let transient = |e: reqwest::Error| RetrievalError::Transient {
            key: location.key.clone(),
            reason: e.to_string(),
        };

        let response = request.send().await.map_err(transient)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(&location.key, status));
        }

        let body = response.bytes().await.map_err(transient)?;
        Ok(body.to_vec())
    }
}

/// Store rooted at a local directory: `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for `location`; keys may not escape the bucket.
    pub fn object_path(&self, location: &ObjectLocation) -> Result<PathBuf, RetrievalError> {
        let key = Path::new(&location.key);
        let confined = key
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !confined || location.bucket.contains('/') || location.bucket.contains("..") {
            return Err(RetrievalError::InvalidLocation(location.to_string()));
        }
        Ok(self.root.join(&location.bucket).join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn fetch(&self, location: &ObjectLocation) -> Result<Vec<u8>, RetrievalError> {
        let path = self.object_path(location)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RetrievalError::NotFound {
                key: location.key.clone(),
            }),
            Err(source) => Err(RetrievalError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn seeded_store() -> (TempDir, LocalObjectStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let object = dir
            .path()
            .join("bucket")
            .join("unzipped/batch/code/IDATs/1/1_R01C01_Grn.idat");
        std::fs::create_dir_all(object.parent().expect("parent")).expect("mkdir");
        std::fs::write(&object, b"IDAT-GREEN").expect("write");
        let store = LocalObjectStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_parse_location() {
        let loc = ObjectLocation::parse("s3://illumina-embark-data/Cluster_Files/x.egt").expect("parse");
        assert_eq!(loc.bucket, "illumina-embark-data");
        assert_eq!(loc.key, "Cluster_Files/x.egt");
        assert_eq!(loc.file_name(), "x.egt");
        assert_eq!(loc.to_string(), "s3://illumina-embark-data/Cluster_Files/x.egt");

        assert!(ObjectLocation::parse("illumina-embark-data/x.egt").is_err());
        assert!(ObjectLocation::parse("s3://bucket").is_err());
        assert!(ObjectLocation::parse("s3:///key").is_err());
        assert!(ObjectLocation::parse("s3://bucket/dir/").is_err());
        assert!("s3://b/k.bpm".parse::<ObjectLocation>().is_ok());
    }

    #[test]
    fn test_object_url_encodes_segments() {
        let store = HttpObjectStore::new("http://minio:9000/", None).expect("client");
        let loc = ObjectLocation::new("bucket", "unzipped/a b/c#1.idat");
        assert_eq!(
            store.object_url(&loc),
            "http://minio:9000/bucket/unzipped/a%20b/c%231.idat"
        );
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status("k", StatusCode::NOT_FOUND),
            RetrievalError::NotFound { .. }
        ));
        assert!(classify_status("k", StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(classify_status("k", StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(matches!(
            classify_status("k", StatusCode::FORBIDDEN),
            RetrievalError::Rejected { status: 403, .. }
        ));
    }

    #[test]
    fn test_local_store_rejects_escaping_keys() {
        let store = LocalObjectStore::new("/data");
        let loc = ObjectLocation::new("bucket", "../other/secret");
        assert!(matches!(
            store.object_path(&loc),
            Err(RetrievalError::InvalidLocation(_))
        ));
    }

    #[tokio::test]
    async fn test_local_download() {
        let (dir, store) = seeded_store();
        let loc = ObjectLocation::new("bucket", "unzipped/batch/code/IDATs/1/1_R01C01_Grn.idat");
        let dest = dir.path().join("out").join("1_R01C01_Grn.idat");

        let written = store.download(&loc, &dest).await.expect("download");
        assert_eq!(written, 10);
        assert_eq!(std::fs::read(&dest).expect("read"), b"IDAT-GREEN");

        let leftovers: Vec<_> = std::fs::read_dir(dest.parent().expect("parent"))
            .expect("read_dir")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_downloads_of_same_object() {
        let (dir, store) = seeded_store();
        let store = Arc::new(store);
        let loc = ObjectLocation::new("bucket", "unzipped/batch/code/IDATs/1/1_R01C01_Grn.idat");
        let dest = dir.path().join("shared").join("1_R01C01_Grn.idat");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                let loc = loc.clone();
                let dest = dest.clone();
                tokio::spawn(async move { store.download(&loc, &dest).await })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("download");
        }

        assert_eq!(std::fs::read(&dest).expect("read"), b"IDAT-GREEN");
        let files = std::fs::read_dir(dest.parent().expect("parent"))
            .expect("read_dir")
            .count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn test_local_missing_object() {
        let (dir, store) = seeded_store();
        let loc = ObjectLocation::new("bucket", "unzipped/batch/missing.idat");
        let dest = dir.path().join("out.idat");

        let err = store.download(&loc, &dest).await.unwrap_err();
        assert!(matches!(err, RetrievalError::NotFound { .. }));
        assert!(!dest.exists());
    }

    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn fetch(&self, location: &ObjectLocation) -> Result<Vec<u8>, RetrievalError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(RetrievalError::Transient {
                    key: location.key.clone(),
                    reason: "connection reset".to_string(),
                });
            }
            Ok(b"payload".to_vec())
        }
    }

    #[tokio::test]
    async fn test_download_with_retry_recovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlakyStore {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy::new(3)
            .with_initial_backoff(Duration::ZERO)
            .with_jitter(false);
        let dest = dir.path().join("x.bin");

        let written = download_with_retry(&store, &policy, &ObjectLocation::new("b", "x.bin"), &dest)
            .await
            .expect("download");
        assert_eq!(written, 7);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_with_retry_gives_up() {
        let store = FlakyStore {
            failures: 5,
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy::new(2)
            .with_initial_backoff(Duration::ZERO)
            .with_jitter(false);

        let err = fetch_with_retry(&store, &policy, &ObjectLocation::new("b", "x.bin"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_open_store_selects_backend() {
        // Both backends are usable through the trait object
        assert!(open_store("https://s3.example.com", Some("t".to_string())).is_ok());
        assert!(open_store("/mnt/buckets", None).is_ok());
    }
}
