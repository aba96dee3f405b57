//! Append-only ingestion ledger and the latest-applied manifest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridiron_core::{FileAttempt, IngestStatus, ManifestSummary, Partition};

use crate::error::StorageError;

/// Append-only attempt log plus the latest-applied manifest.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Appends one file-registry row and returns its id. Rows are never updated.
    async fn record_attempt(&self, attempt: &FileAttempt) -> Result<i64, StorageError>;

    /// Last-write-wins upsert keyed by (dataset, partition).
    async fn update_manifest(
        &self,
        dataset: &str,
        partition: &Partition,
        applied_file_id: Option<i64>,
        row_count: i64,
        hash: &str,
    ) -> Result<(), StorageError>;

    /// Most recently applied partition of every dataset.
    async fn latest_manifest(&self) -> Result<Vec<ManifestSummary>, StorageError>;
}

/// Fields shared by every ledger row of one partition run.
#[derive(Debug, Clone)]
pub struct AttemptTemplate {
    pub dataset: String,
    pub storage_path: String,
    pub snapshot_at: DateTime<Utc>,
    pub season: Option<i32>,
    pub week: Option<i32>,
    pub row_count: i64,
    pub hash: String,
}

impl AttemptTemplate {
    pub fn new(dataset: &str, partition: &Partition, snapshot_at: DateTime<Utc>) -> Self {
        Self {
            dataset: dataset.to_string(),
            storage_path: String::new(),
            snapshot_at,
            season: partition.season,
            week: partition.week,
            row_count: 0,
            hash: String::new(),
        }
    }

    pub fn attempt(&self, status: IngestStatus, message: Option<String>) -> FileAttempt {
        FileAttempt {
            dataset: self.dataset.clone(),
            storage_path: self.storage_path.clone(),
            snapshot_at: self.snapshot_at,
            season: self.season,
            week: self.week,
            row_count: self.row_count,
            hash: self.hash.clone(),
            status,
            message,
        }
    }
}
