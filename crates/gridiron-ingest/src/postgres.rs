//! Postgres-backed raw tables, file registry and manifest.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridiron_core::{FileAttempt, ManifestSummary, Partition};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::ledger::Ledger;
use crate::registry::is_sql_identifier;
use crate::upsert::{RawRecord, RawStore};

pub const RAW_SCHEMA: &str = "raw";

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Applies the `ops` schema migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("ops migrations applied");
        Ok(())
    }
}

fn checked_table(dataset: &str) -> Result<&str, StorageError> {
    if is_sql_identifier(dataset) {
        Ok(dataset)
    } else {
        Err(StorageError::Backend(format!(
            "refusing to use {dataset:?} as a raw table name"
        )))
    }
}

/// DDL for one dataset's raw table; absent key components default to the
/// sentinels so the primary key is always total.
pub fn raw_table_ddl(dataset: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {RAW_SCHEMA}"),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {RAW_SCHEMA}."{dataset}" (
    dataset      TEXT        NOT NULL,
    season       INTEGER     NOT NULL DEFAULT -1,
    week         INTEGER     NOT NULL DEFAULT -1,
    player_id    TEXT        NOT NULL DEFAULT '',
    team         TEXT        NOT NULL DEFAULT '',
    game_id      TEXT        NOT NULL DEFAULT '',
    data         JSONB       NOT NULL,
    _ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    _hash        TEXT        NOT NULL,
    PRIMARY KEY (dataset, season, week, player_id, team, game_id)
)"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS "{dataset}_data_gin" ON {RAW_SCHEMA}."{dataset}" USING GIN (data)"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS "{dataset}_season_week_idx" ON {RAW_SCHEMA}."{dataset}" (season, week)"#
        ),
    ]
}

/// One multi-row upsert; stored rows are only rewritten when the hash differs.
pub fn build_upsert(dataset: &str, chunk: &[RawRecord]) -> QueryBuilder<'static, Postgres> {
    let mut qb: QueryBuilder<'static, Postgres> = QueryBuilder::new(format!(
        r#"INSERT INTO {RAW_SCHEMA}."{dataset}" (dataset, season, week, player_id, team, game_id, data, _hash) "#
    ));
    qb.push_values(chunk.iter(), |mut b, record| {
        b.push_bind(record.key.dataset.clone())
            .push_bind(record.key.season)
            .push_bind(record.key.week)
            .push_bind(record.key.player_id.clone())
            .push_bind(record.key.team.clone())
            .push_bind(record.key.game_id.clone())
            .push_bind(Json(record.data.clone()))
            .push_bind(record.hash.clone());
    });
    qb.push(format!(
        " ON CONFLICT (dataset, season, week, player_id, team, game_id) DO UPDATE \
         SET data = EXCLUDED.data, _hash = EXCLUDED._hash, _ingested_at = now() \
         WHERE {RAW_SCHEMA}.\"{dataset}\"._hash IS DISTINCT FROM EXCLUDED._hash"
    ));
    qb
}

#[async_trait]
impl RawStore for PgWarehouse {
    async fn ensure_raw_table(&self, dataset: &str) -> Result<bool, StorageError> {
        let table = checked_table(dataset)?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(RAW_SCHEMA)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        if exists {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;
        for statement in raw_table_ddl(table) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn upsert_chunk(&self, dataset: &str, chunk: &[RawRecord]) -> Result<u64, StorageError> {
        if chunk.is_empty() {
            return Ok(0);
        }
        let table = checked_table(dataset)?;
        let mut qb = build_upsert(table, chunk);
        let result = qb.build().execute(&self.pool).await?;
        debug!(dataset = table, rows = chunk.len(), affected = result.rows_affected(), "chunk merged");
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Ledger for PgWarehouse {
    async fn record_attempt(&self, attempt: &FileAttempt) -> Result<i64, StorageError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO ops.file_registry \
             (dataset, storage_path, snapshot_at, season, week, row_count, hash, status, message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
        )
        .bind(&attempt.dataset)
        .bind(&attempt.storage_path)
        .bind(attempt.snapshot_at)
        .bind(attempt.season)
        .bind(attempt.week)
        .bind(attempt.row_count)
        .bind(&attempt.hash)
        .bind(attempt.status.as_str())
        .bind(&attempt.message)
        .fetch_one(&self.pool)
        .await?;
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
        sqlx::query(
            "INSERT INTO ops.ingest_manifest \
             (dataset, partition, applied_file_id, row_count, hash, applied_at) \
             VALUES ($1, $2, $3, $4, $5, now()) \
             ON CONFLICT (dataset, partition) DO UPDATE SET \
             applied_file_id = EXCLUDED.applied_file_id, \
             row_count = EXCLUDED.row_count, \
             hash = EXCLUDED.hash, \
             applied_at = EXCLUDED.applied_at",
        )
        .bind(dataset)
        .bind(Json(partition.to_json()))
        .bind(applied_file_id)
        .bind(row_count)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_manifest(&self) -> Result<Vec<ManifestSummary>, StorageError> {
        let rows: Vec<(String, Json<Partition>, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT DISTINCT ON (dataset) dataset, partition, row_count, applied_at \
             FROM ops.ingest_manifest ORDER BY dataset, applied_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(dataset, Json(partition), row_count, applied_at)| ManifestSummary {
                dataset,
                partition,
                row_count,
                applied_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridiron_core::RecordKey;
    use serde_json::json;

    fn record(player: &str) -> RawRecord {
        let data = json!({"season": 2024, "week": 10, "player_id": player})
            .as_object()
            .cloned()
            .unwrap();
        RawRecord::new(RecordKey::extract("weekly_player_stats", &data), data)
    }

    #[test]
    fn upsert_statement_is_hash_gated_and_multi_row() {
        let chunk = vec![record("00-1"), record("00-2")];
        let qb = build_upsert("weekly_player_stats", &chunk);
        let sql = qb.sql();
        assert!(sql.starts_with(
            r#"INSERT INTO raw."weekly_player_stats" (dataset, season, week, player_id, team, game_id, data, _hash) VALUES ($1, $2, $3, $4, $5, $6, $7, $8), ($9, "#
        ));
        assert!(sql.contains("$16)"));
        assert!(sql.contains("ON CONFLICT (dataset, season, week, player_id, team, game_id) DO UPDATE"));
        assert!(sql.ends_with(r#"WHERE raw."weekly_player_stats"._hash IS DISTINCT FROM EXCLUDED._hash"#));
    }

    #[test]
    fn raw_table_has_total_key_with_sentinel_defaults() {
        let ddl = raw_table_ddl("injuries").join(";\n");
        assert!(ddl.contains(r#"CREATE TABLE IF NOT EXISTS raw."injuries""#));
        assert!(ddl.contains("season       INTEGER     NOT NULL DEFAULT -1"));
        assert!(ddl.contains("game_id      TEXT        NOT NULL DEFAULT ''"));
        assert!(ddl.contains("PRIMARY KEY (dataset, season, week, player_id, team, game_id)"));
        assert!(ddl.contains("USING GIN (data)"));
        assert!(ddl.contains("(season, week)"));
    }

    #[test]
    fn unsafe_table_names_are_refused() {
        assert!(checked_table("weekly_player_stats").is_ok());
        assert!(checked_table("x\"; drop table ops.file_registry; --").is_err());
    }
}
