//! Hash-gated, chunked merges into per-dataset raw tables.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use gridiron_core::{RecordKey, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{IngestResult, StorageError};
use crate::registry::{DatasetDefinition, DedupPolicy};

pub const DEFAULT_CHUNK_ROWS: usize = 500;
/// Postgres caps one statement at 65 535 bind parameters.
pub const MAX_BIND_PARAMS: usize = 65_535;
/// dataset, season, week, player_id, team, game_id, data, _hash
pub const PARAMS_PER_ROW: usize = 8;

const SHORT_HASH_LEN: usize = 12;

pub fn clamp_chunk_rows(requested: usize) -> usize {
    requested.clamp(1, MAX_BIND_PARAMS / PARAMS_PER_ROW)
}

/// Serialized row with keys in sorted order (`serde_json::Map` is ordered).
pub fn canonical_json(row: &Row) -> Vec<u8> {
    serde_json::to_vec(row).unwrap_or_default()
}

/// SHA-256 over the key components and the key-sorted full record.
pub fn content_hash(key: &RecordKey, row: &Row) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.canonical().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(row));
    hex::encode(hasher.finalize())
}

pub fn short_hash(row: &Row) -> String {
    let mut digest = hex::encode(Sha256::digest(canonical_json(row)));
    digest.truncate(SHORT_HASH_LEN);
    digest
}

/// One normalized row ready for the raw table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord {
    pub key: RecordKey,
    pub data: Row,
    pub hash: String,
}

impl RawRecord {
    pub fn new(key: RecordKey, data: Row) -> Self {
        let hash = content_hash(&key, &data);
        Self { key, data, hash }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedBatch {
    pub records: Vec<RawRecord>,
    pub dropped_duplicates: usize,
    pub collapsed: usize,
}

fn pk_projection(pk: &[String], row: &Row) -> Row {
    pk.iter()
        .filter_map(|col| row.get(col).map(|v| (col.clone(), v.clone())))
        .collect()
}

/// Assigns keys per the dataset's dedup policy and collapses rows that still
/// share a key, keeping the last one.
pub fn prepare_records(def: &DatasetDefinition, rows: Vec<Row>) -> PreparedBatch {
    let mut batch = PreparedBatch::default();
    let mut seen_fingerprints: HashSet<String> = HashSet::new();
    let mut occurrences: HashMap<String, usize> = HashMap::new();
    let mut slots: HashMap<RecordKey, usize> = HashMap::new();

    for row in rows {
        let mut key = RecordKey::extract(&def.id, &row);
        match def.dedup {
            DedupPolicy::NaturalKey => {
                if key.game_id.is_empty() {
                    let projection = pk_projection(&def.pk, &row);
                    key.game_id = if projection.is_empty() {
                        short_hash(&row)
                    } else {
                        short_hash(&projection)
                    };
                }
            }
            DedupPolicy::RecordSurrogate {
                drop_exact_duplicates,
            } => {
                let fingerprint = short_hash(&row);
                if drop_exact_duplicates {
                    if !seen_fingerprints.insert(fingerprint.clone()) {
                        batch.dropped_duplicates += 1;
                        continue;
                    }
                    key.game_id = format!("r{fingerprint}");
                } else {
                    let n = occurrences.entry(fingerprint.clone()).or_insert(0);
                    *n += 1;
                    key.game_id = if *n == 1 {
                        format!("r{fingerprint}")
                    } else {
                        format!("r{fingerprint}-{n}")
                    };
                }
            }
        }

        let record = RawRecord::new(key, row);
        match slots.get(&record.key) {
            Some(&idx) => {
                batch.records[idx] = record;
                batch.collapsed += 1;
            }
            None => {
                slots.insert(record.key.clone(), batch.records.len());
                batch.records.push(record);
            }
        }
    }

    if batch.collapsed > 0 {
        warn!(
            dataset = %def.id,
            collapsed = batch.collapsed,
            "rows shared a raw-table key within one batch; kept the last of each"
        );
    }
    if batch.dropped_duplicates > 0 {
        debug!(dataset = %def.id, dropped = batch.dropped_duplicates, "dropped exact duplicate rows");
    }
    batch
}

/// Backend holding the per-dataset raw tables.
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Creates the dataset's table and indexes if absent; `true` when created.
    async fn ensure_raw_table(&self, dataset: &str) -> Result<bool, StorageError>;

    /// Merges one chunk; rows whose stored hash equals the incoming hash are
    /// left untouched. Returns the number of rows inserted or updated.
    async fn upsert_chunk(&self, dataset: &str, chunk: &[RawRecord]) -> Result<u64, StorageError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    /// Records submitted by the caller, before dedup.
    pub processed: usize,
    pub chunks: usize,
    pub changed: u64,
    pub collapsed: usize,
    pub dropped_duplicates: usize,
}

pub struct RawTableUpserter {
    store: Arc<dyn RawStore>,
    chunk_rows: usize,
}

impl RawTableUpserter {
    pub fn new(store: Arc<dyn RawStore>, chunk_rows: usize) -> Self {
        Self {
            store,
            chunk_rows: clamp_chunk_rows(chunk_rows),
        }
    }

    pub fn chunk_rows(&self) -> usize {
        self.chunk_rows
    }

    pub async fn upsert(&self, def: &DatasetDefinition, rows: Vec<Row>) -> IngestResult<UpsertReport> {
        let processed = rows.len();
        let batch = prepare_records(def, rows);

        if self.store.ensure_raw_table(&def.id).await? {
            info!(dataset = %def.id, "created raw table");
        }

        let mut report = UpsertReport {
            processed,
            collapsed: batch.collapsed,
            dropped_duplicates: batch.dropped_duplicates,
            ..UpsertReport::default()
        };
        for chunk in batch.records.chunks(self.chunk_rows) {
            let changed = self.store.upsert_chunk(&def.id, chunk).await?;
            report.chunks += 1;
            report.changed += changed;
            debug!(dataset = %def.id, rows = chunk.len(), changed, "upserted chunk");
        }
        info!(
            dataset = %def.id,
            processed = report.processed,
            chunks = report.chunks,
            changed = report.changed,
            "raw upsert complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DatasetRegistry;
    use serde_json::{json, Value as JsonValue};

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().expect("object")
    }

    fn registry() -> DatasetRegistry {
        DatasetRegistry::from_yaml_str(
            r#"
datasets:
  weekly_player_stats:
    loader_fn: import_weekly_data
    partitioning: { type: weekly, keys: [season, week] }
    pk: [season, week, player_id]
  depth_charts:
    loader_fn: import_depth_charts
    partitioning: { type: weekly, keys: [season, week] }
    pk: [season, week, player_id]
    dedup: { policy: record_surrogate }
  depth_charts_dedup:
    loader_fn: import_depth_charts
    partitioning: { type: weekly, keys: [season, week] }
    pk: [season, week, player_id]
    dedup: { policy: record_surrogate, drop_exact_duplicates: true }
"#,
        )
        .unwrap()
    }

    #[test]
    fn chunk_size_respects_bind_limit() {
        assert_eq!(clamp_chunk_rows(500), 500);
        assert_eq!(clamp_chunk_rows(0), 1);
        assert_eq!(clamp_chunk_rows(100_000), 8191);
    }

    #[test]
    fn content_hash_ignores_key_order_and_tracks_changes() {
        let a = row(json!({"player_id": "00-1", "yards": 10, "season": 2024}));
        let b = row(json!({"season": 2024, "yards": 10, "player_id": "00-1"}));
        let key = RecordKey::extract("weekly_player_stats", &a);
        assert_eq!(content_hash(&key, &a), content_hash(&key, &b));

        let c = row(json!({"player_id": "00-1", "yards": 11, "season": 2024}));
        assert_ne!(content_hash(&key, &a), content_hash(&key, &c));
    }

    #[test]
    fn natural_key_game_id_is_stable_across_changed_extracts() {
        let registry = registry();
        let def = registry.get("weekly_player_stats").unwrap();
        let first = prepare_records(
            def,
            vec![row(json!({"season": 2024, "week": 10, "player_id": "00-1", "yards": 10}))],
        );
        let second = prepare_records(
            def,
            vec![row(json!({"season": 2024, "week": 10, "player_id": "00-1", "yards": 99}))],
        );
        assert_eq!(first.records[0].key, second.records[0].key);
        assert_eq!(first.records[0].key.game_id.len(), 12);
        assert_ne!(first.records[0].hash, second.records[0].hash);
    }

    #[test]
    fn explicit_game_id_is_kept() {
        let registry = registry();
        let def = registry.get("weekly_player_stats").unwrap();
        let batch = prepare_records(
            def,
            vec![row(json!({"season": 2024, "week": 1, "game_id": "2024_01_BAL_KC"}))],
        );
        assert_eq!(batch.records[0].key.game_id, "2024_01_BAL_KC");
    }

    #[test]
    fn same_key_rows_collapse_last_wins() {
        let registry = registry();
        let def = registry.get("weekly_player_stats").unwrap();
        let batch = prepare_records(
            def,
            vec![
                row(json!({"season": 2024, "week": 1, "player_id": "00-1", "yards": 1})),
                row(json!({"season": 2024, "week": 1, "player_id": "00-1", "yards": 2})),
            ],
        );
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.collapsed, 1);
        assert_eq!(batch.records[0].data["yards"], json!(2));
    }

    #[test]
    fn record_surrogate_keeps_duplicates_with_ordinals() {
        let registry = registry();
        let def = registry.get("depth_charts").unwrap();
        let dup = row(json!({"season": 2024, "week": 1, "player_id": "00-1", "pos": "QB"}));
        let other = row(json!({"season": 2024, "week": 1, "player_id": "00-1", "pos": "H"}));
        let batch = prepare_records(def, vec![dup.clone(), other, dup]);
        assert_eq!(batch.records.len(), 3);
        assert!(batch.records[0].key.game_id.starts_with('r'));
        assert_eq!(
            batch.records[2].key.game_id,
            format!("{}-2", batch.records[0].key.game_id)
        );
        assert_ne!(batch.records[0].key.game_id, batch.records[1].key.game_id);
    }

    #[test]
    fn record_surrogate_can_drop_exact_duplicates() {
        let registry = registry();
        let def = registry.get("depth_charts_dedup").unwrap();
        let dup = row(json!({"season": 2024, "week": 1, "player_id": "00-1", "pos": "QB"}));
        let batch = prepare_records(def, vec![dup.clone(), dup]);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.dropped_duplicates, 1);
    }
}
