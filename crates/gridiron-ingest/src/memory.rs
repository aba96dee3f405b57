//! In-process warehouse used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridiron_core::{
    FileAttempt, FileRegistryEntry, IngestStatus, ManifestEntry, ManifestSummary, Partition,
    RecordKey, Row,
};

use crate::error::StorageError;
use crate::ledger::Ledger;
use crate::upsert::{RawRecord, RawStore};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRaw {
    pub data: Row,
    pub hash: String,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<BTreeMap<String, BTreeMap<RecordKey, StoredRaw>>>,
    chunk_log: Mutex<Vec<(String, usize)>>,
    file_registry: Mutex<Vec<FileRegistryEntry>>,
    manifest: Mutex<BTreeMap<(String, Partition), ManifestEntry>>,
    next_id: AtomicI64,
    fail_upserts: AtomicBool,
    fail_ledger_status: Mutex<Option<IngestStatus>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent chunk upsert fail.
    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    /// Makes `record_attempt` fail for rows with the given status.
    pub fn set_fail_ledger_status(&self, status: Option<IngestStatus>) {
        *lock(&self.fail_ledger_status) = status;
    }

    pub fn raw_rows(&self, dataset: &str) -> BTreeMap<RecordKey, StoredRaw> {
        lock(&self.tables).get(dataset).cloned().unwrap_or_default()
    }

    pub fn has_table(&self, dataset: &str) -> bool {
        lock(&self.tables).contains_key(dataset)
    }

    /// Row counts of every chunk written for `dataset`, in order.
    pub fn chunk_sizes(&self, dataset: &str) -> Vec<usize> {
        lock(&self.chunk_log)
            .iter()
            .filter(|(d, _)| d == dataset)
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn file_registry(&self) -> Vec<FileRegistryEntry> {
        lock(&self.file_registry).clone()
    }

    pub fn manifest_entries(&self) -> Vec<ManifestEntry> {
        lock(&self.manifest).values().cloned().collect()
    }
}

#[async_trait]
impl RawStore for MemoryWarehouse {
    async fn ensure_raw_table(&self, dataset: &str) -> Result<bool, StorageError> {
        let mut tables = lock(&self.tables);
        if tables.contains_key(dataset) {
            return Ok(false);
        }
        tables.insert(dataset.to_string(), BTreeMap::new());
        Ok(true)
    }

    async fn upsert_chunk(&self, dataset: &str, chunk: &[RawRecord]) -> Result<u64, StorageError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!(
                "injected upsert failure for {dataset}"
            )));
        }
        let mut tables = lock(&self.tables);
        let table = tables
            .get_mut(dataset)
            .ok_or_else(|| StorageError::Backend(format!("raw table {dataset} does not exist")))?;

        let now = Utc::now();
        let mut changed = 0u64;
        for record in chunk {
            let unchanged = table
                .get(&record.key)
                .is_some_and(|stored| stored.hash == record.hash);
            if unchanged {
                continue;
            }
            table.insert(
                record.key.clone(),
                StoredRaw {
                    data: record.data.clone(),
                    hash: record.hash.clone(),
                    ingested_at: now,
                },
            );
            changed += 1;
        }
        lock(&self.chunk_log).push((dataset.to_string(), chunk.len()));
        Ok(changed)
    }
}

#[async_trait]
impl Ledger for MemoryWarehouse {
    async fn record_attempt(&self, attempt: &FileAttempt) -> Result<i64, StorageError> {
        if *lock(&self.fail_ledger_status) == Some(attempt.status) {
            return Err(StorageError::Backend(format!(
                "injected ledger failure for status {}",
                attempt.status
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.file_registry).push(FileRegistryEntry::from_attempt(id, attempt, Utc::now()));
        Ok(id)
    }

    async fn update_manifest(
        &self,
        dataset: &str,
        partition: &Partition,
        applied_file_id: Option<i64>,
        row_count: i64,
        hash: &str,
    ) -> Result<(), StorageError> {
        let entry = ManifestEntry {
            dataset: dataset.to_string(),
            partition: partition.clone(),
            applied_file_id,
            row_count,
            hash: hash.to_string(),
            applied_at: Utc::now(),
        };
        lock(&self.manifest).insert((dataset.to_string(), partition.clone()), entry);
        Ok(())
    }

    async fn latest_manifest(&self) -> Result<Vec<ManifestSummary>, StorageError> {
        let manifest = lock(&self.manifest);
        let mut latest: BTreeMap<&str, &ManifestEntry> = BTreeMap::new();
        for entry in manifest.values() {
            let newer = latest
                .get(entry.dataset.as_str())
                .map_or(true, |current| entry.applied_at >= current.applied_at);
            if newer {
                latest.insert(entry.dataset.as_str(), entry);
            }
        }
        Ok(latest.values().map(|e| ManifestSummary::from(*e)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(player: &str, yards: i64) -> RawRecord {
        let data = json!({"season": 2024, "week": 1, "player_id": player, "yards": yards})
            .as_object()
            .cloned()
            .unwrap();
        RawRecord::new(RecordKey::extract("weekly_player_stats", &data), data)
    }

    #[tokio::test]
    async fn equal_hashes_are_not_rewritten() {
        let wh = MemoryWarehouse::new();
        assert!(wh.ensure_raw_table("weekly_player_stats").await.unwrap());
        assert!(!wh.ensure_raw_table("weekly_player_stats").await.unwrap());

        let batch = vec![record("00-1", 10), record("00-2", 5)];
        assert_eq!(wh.upsert_chunk("weekly_player_stats", &batch).await.unwrap(), 2);
        assert_eq!(wh.upsert_chunk("weekly_player_stats", &batch).await.unwrap(), 0);
        assert_eq!(
            wh.upsert_chunk("weekly_player_stats", &[record("00-1", 11)])
                .await
                .unwrap(),
            1
        );
        assert_eq!(wh.raw_rows("weekly_player_stats").len(), 2);
    }

    #[tokio::test]
    async fn manifest_is_last_write_wins_per_partition() {
        let wh = MemoryWarehouse::new();
        let p = Partition::weekly(2024, 10);
        wh.update_manifest("injuries", &p, Some(1), 10, "aaa").await.unwrap();
        wh.update_manifest("injuries", &p, Some(4), 12, "bbb").await.unwrap();

        let entries = wh.manifest_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].applied_file_id, Some(4));
        assert_eq!(entries[0].row_count, 12);
        assert_eq!(entries[0].hash, "bbb");
    }

    #[tokio::test]
    async fn ledger_ids_increase_and_rows_append() {
        let wh = MemoryWarehouse::new();
        let attempt = FileAttempt {
            dataset: "rosters".into(),
            storage_path: "s3://bronze/x.parquet".into(),
            snapshot_at: Utc::now(),
            season: Some(2024),
            week: None,
            row_count: 3,
            hash: "h".into(),
            status: IngestStatus::Pending,
            message: None,
        };
        let first = wh.record_attempt(&attempt).await.unwrap();
        let second = wh
            .record_attempt(&FileAttempt {
                status: IngestStatus::Applied,
                ..attempt.clone()
            })
            .await
            .unwrap();
        assert!(second > first);
        let rows = wh.file_registry();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, IngestStatus::Pending);
        assert_eq!(rows[1].status, IngestStatus::Applied);
    }
}
