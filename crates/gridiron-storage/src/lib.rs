//! Object storage + HTTP fetch utilities for the gridiron bronze layer.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gridiron-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("bucket {0} does not exist")]
    BucketMissing(String),
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("object store backend: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub metadata: BTreeMap<String, String>,
}

/// Bucket/key object storage with whole-object PUT semantics.
///
/// `put_object` must never expose a partially written object under `key`:
/// readers see either the previous object, nothing, or the complete body.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Creates the bucket if absent. Returns `true` when it was created.
    async fn ensure_bucket(&self, bucket: &str) -> Result<bool, ObjectStoreError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ObjectStoreError>;

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectInfo>, ObjectStoreError>;
}

fn check_key(key: &str) -> Result<(), ObjectStoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        Err(ObjectStoreError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ObjectStoreError + '_ {
    move |source| ObjectStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Local filesystem bronze root: `{root}/{bucket}/{key}`.
///
/// Each PUT lands in a hidden temp file next to the destination and is then
/// renamed into place, which is atomic on a single filesystem.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    fn metadata_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(format!("{key}.metadata.json"))
    }

    async fn write_atomically(&self, dest: &Path, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let parent = dest
            .parent()
            .ok_or_else(|| ObjectStoreError::InvalidKey(dest.display().to_string()))?;
        fs::create_dir_all(parent).await.map_err(io_err(parent))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, dest).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ObjectStoreError::Io {
                path: dest.to_path_buf(),
                source: err,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<bool, ObjectStoreError> {
        check_key(bucket)?;
        let dir = self.root.join(bucket);
        if fs::try_exists(&dir).await.map_err(io_err(&dir))? {
            debug!(bucket, "bucket exists");
            return Ok(false);
        }
        fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        info!(bucket, path = %dir.display(), "created bucket");
        Ok(true)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ObjectStoreError> {
        check_key(key)?;
        let bucket_dir = self.root.join(bucket);
        if !fs::try_exists(&bucket_dir).await.map_err(io_err(&bucket_dir))? {
            return Err(ObjectStoreError::BucketMissing(bucket.to_string()));
        }

        let span = info_span!("object_put", bucket, key, bytes = body.len());
        async {
            self.write_atomically(&self.object_path(bucket, key), &body)
                .await?;
            if !metadata.is_empty() {
                let encoded = serde_json::to_vec_pretty(metadata)
                    .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
                self.write_atomically(&self.metadata_path(bucket, key), &encoded)
                    .await?;
            }
            Ok::<(), ObjectStoreError>(())
        }
        .instrument(span)
        .await
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectInfo>, ObjectStoreError> {
        check_key(key)?;
        let path = self.object_path(bucket, key);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ObjectStoreError::Io { path, source: err }),
        };
        let meta_path = self.metadata_path(bucket, key);
        let metadata = match fs::read(&meta_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(ObjectStoreError::Io {
                    path: meta_path,
                    source: err,
                })
            }
        };
        Ok(Some(ObjectInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: meta.len(),
            metadata,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub metadata: BTreeMap<String, String>,
    pub stored_at: DateTime<Utc>,
}

/// In-memory object store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<BTreeSet<String>>,
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    fail_puts: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent PUT fail, simulating an unavailable backend.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        lock(&self.objects)
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<bool, ObjectStoreError> {
        check_key(bucket)?;
        Ok(lock(&self.buckets).insert(bucket.to_string()))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ObjectStoreError> {
        check_key(key)?;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Backend(format!(
                "simulated PUT failure for {bucket}/{key}"
            )));
        }
        if !lock(&self.buckets).contains(bucket) {
            return Err(ObjectStoreError::BucketMissing(bucket.to_string()));
        }
        lock(&self.objects).insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                metadata: metadata.clone(),
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectInfo>, ObjectStoreError> {
        Ok(self.get(bucket, key).map(|o| ObjectInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: o.body.len() as u64,
            metadata: o.metadata,
        }))
    }
}

/// How a feed response should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Body,
    /// The upstream has nothing published for this slice yet.
    Absent,
    Error,
}

pub fn classify_status(status: StatusCode) -> ResponseDisposition {
    if status.is_success() {
        ResponseDisposition::Body
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        ResponseDisposition::Absent
    } else {
        ResponseDisposition::Error
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed upstream payload from {source_ref}: {message}")]
    Malformed { source_ref: String, message: String },
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Bytes,
}

/// Single-attempt HTTP fetcher. Failed fetches surface to the caller; reruns
/// happen at the partition level.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Fetches `url`; `Ok(None)` when the upstream reports the object absent.
    pub async fn fetch_optional(&self, url: &str) -> Result<Option<FetchedResponse>, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            match classify_status(status) {
                ResponseDisposition::Body => {
                    let body = resp.bytes().await?;
                    debug!(bytes = body.len(), "fetched");
                    Ok(Some(FetchedResponse {
                        status,
                        final_url,
                        body,
                    }))
                }
                ResponseDisposition::Absent => {
                    debug!(status = status.as_u16(), "upstream object absent");
                    Ok(None)
                }
                ResponseDisposition::Error => Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                }),
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn fs_bucket_creation_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        assert!(store.ensure_bucket("bronze").await.unwrap());
        assert!(!store.ensure_bucket("bronze").await.unwrap());
        assert!(dir.path().join("bronze").is_dir());
    }

    #[tokio::test]
    async fn fs_put_requires_bucket_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        let meta = BTreeMap::from([("_file_hash".to_string(), "abc".to_string())]);

        let err = store
            .put_object("bronze", "a/b.parquet", Bytes::from_static(b"x"), &meta)
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::BucketMissing(_)));

        store.ensure_bucket("bronze").await.unwrap();
        store
            .put_object("bronze", "a/b.parquet", Bytes::from_static(b"payload"), &meta)
            .await
            .unwrap();

        let info = store.head_object("bronze", "a/b.parquet").await.unwrap().unwrap();
        assert_eq!(info.size, 7);
        assert_eq!(info.metadata.get("_file_hash").map(String::as_str), Some("abc"));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("bronze/a"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn keys_with_traversal_are_rejected() {
        let store = MemoryObjectStore::new();
        store.ensure_bucket("bronze").await.unwrap();
        for key in ["", "/abs", "a/../b", "a//b"] {
            let err = store
                .put_object("bronze", key, Bytes::new(), &BTreeMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, ObjectStoreError::InvalidKey(_)), "{key}");
        }
    }

    #[test]
    fn not_found_is_absent_not_error() {
        assert_eq!(classify_status(StatusCode::OK), ResponseDisposition::Body);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ResponseDisposition::Absent);
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            ResponseDisposition::Error
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ResponseDisposition::Error);
    }
}
