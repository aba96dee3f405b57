//! Partition archives: deterministic object paths and parquet encoding.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use gridiron_core::{Partition, Row};
use gridiron_storage::{sha256_hex, ObjectStore};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ArchiveCodec;
use crate::error::StorageError;
use crate::upsert::canonical_json;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%SZ";

/// Process columns appended to every archived row.
pub const METADATA_COLUMNS: [&str; 8] = [
    "_dataset",
    "_season",
    "_week",
    "_snapshot_at",
    "_source",
    "_row_count",
    "_schema_version",
    "_file_hash",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivePath {
    pub bucket: String,
    pub key: String,
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Pure function of its inputs; the timestamp is the only varying part.
pub fn archive_path(
    bucket: &str,
    prefix: &str,
    dataset: &str,
    partition: &Partition,
    at: DateTime<Utc>,
) -> ArchivePath {
    let ts = at.format(TIMESTAMP_FORMAT);
    let tail = match (partition.snapshot_date, partition.season, partition.week) {
        (Some(date), _, _) => {
            format!("{dataset}/snapshot_date={date}/{dataset}-{date}-{ts}.parquet")
        }
        (None, Some(s), Some(w)) => {
            format!("{dataset}/season={s}/week={w:02}/{dataset}-s{s}-w{w:02}-{ts}.parquet")
        }
        (None, Some(s), None) => format!("{dataset}/season={s}/{dataset}-s{s}-{ts}.parquet"),
        _ => format!("{dataset}/{dataset}-{ts}.parquet"),
    };
    let prefix = prefix.trim_matches('/');
    let key = if prefix.is_empty() {
        tail
    } else {
        format!("{prefix}/{tail}")
    };
    ArchivePath {
        bucket: bucket.to_string(),
        key,
    }
}

/// SHA-256 over the sorted canonical JSON of every row; row order is ignored.
pub fn partition_content_hash(rows: &[Row]) -> String {
    let mut lines: Vec<Vec<u8>> = rows.iter().map(canonical_json).collect();
    lines.sort_unstable();
    sha256_hex(&lines.join(&b'\n'))
}

#[derive(Debug, Clone)]
pub struct ArchiveMetadata {
    pub dataset: String,
    pub season: Option<i32>,
    pub week: Option<i32>,
    pub snapshot_at: DateTime<Utc>,
    pub source: String,
    pub schema_version: u32,
    pub file_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int,
    Float,
    Text,
}

fn kind_of(value: &JsonValue) -> Option<ColumnKind> {
    match value {
        JsonValue::Null => None,
        JsonValue::Bool(_) => Some(ColumnKind::Bool),
        JsonValue::Number(n) if n.is_i64() => Some(ColumnKind::Int),
        JsonValue::Number(_) => Some(ColumnKind::Float),
        _ => Some(ColumnKind::Text),
    }
}

fn infer_kind(rows: &[Row], column: &str) -> ColumnKind {
    let mut kind: Option<ColumnKind> = None;
    for value in rows.iter().filter_map(|r| r.get(column)) {
        let Some(next) = kind_of(value) else {
            continue;
        };
        kind = Some(match (kind, next) {
            (None, k) => k,
            (Some(a), b) if a == b => a,
            (Some(ColumnKind::Int), ColumnKind::Float) | (Some(ColumnKind::Float), ColumnKind::Int) => {
                ColumnKind::Float
            }
            _ => ColumnKind::Text,
        });
        if kind == Some(ColumnKind::Text) {
            break;
        }
    }
    kind.unwrap_or(ColumnKind::Text)
}

fn text_cell(value: Option<&JsonValue>) -> Option<String> {
    match value {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn data_column(rows: &[Row], column: &str) -> (ArrowField, ArrayRef) {
    let cells = rows.iter().map(|r| r.get(column));
    match infer_kind(rows, column) {
        ColumnKind::Bool => (
            ArrowField::new(column, DataType::Boolean, true),
            Arc::new(BooleanArray::from(
                cells.map(|v| v.and_then(JsonValue::as_bool)).collect::<Vec<_>>(),
            )) as ArrayRef,
        ),
        ColumnKind::Int => (
            ArrowField::new(column, DataType::Int64, true),
            Arc::new(Int64Array::from(
                cells.map(|v| v.and_then(JsonValue::as_i64)).collect::<Vec<_>>(),
            )) as ArrayRef,
        ),
        ColumnKind::Float => (
            ArrowField::new(column, DataType::Float64, true),
            Arc::new(Float64Array::from(
                cells.map(|v| v.and_then(JsonValue::as_f64)).collect::<Vec<_>>(),
            )) as ArrayRef,
        ),
        ColumnKind::Text => (
            ArrowField::new(column, DataType::Utf8, true),
            Arc::new(StringArray::from(cells.map(text_cell).collect::<Vec<_>>())) as ArrayRef,
        ),
    }
}

/// Builds one record batch: data columns with inferred types, then the
/// process metadata columns.
pub fn build_record_batch(rows: &[Row], meta: &ArchiveMetadata) -> Result<RecordBatch, StorageError> {
    let columns: BTreeSet<&str> = rows.iter().flat_map(|r| r.keys().map(String::as_str)).collect();
    let reserved: BTreeSet<&str> = METADATA_COLUMNS.into_iter().collect();

    let mut fields = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::new();
    for column in columns.iter().copied() {
        if reserved.contains(column) {
            warn!(dataset = %meta.dataset, column, "data column shadows a metadata column; dropped");
            continue;
        }
        let (field, array) = data_column(rows, column);
        fields.push(field);
        arrays.push(array);
    }

    let n = rows.len();
    let snapshot_us = meta.snapshot_at.timestamp_micros();
    fields.extend([
        ArrowField::new("_dataset", DataType::Utf8, false),
        ArrowField::new("_season", DataType::Int32, true),
        ArrowField::new("_week", DataType::Int32, true),
        ArrowField::new(
            "_snapshot_at",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        ArrowField::new("_source", DataType::Utf8, false),
        ArrowField::new("_row_count", DataType::Int64, false),
        ArrowField::new("_schema_version", DataType::Int32, false),
        ArrowField::new("_file_hash", DataType::Utf8, false),
    ]);
    arrays.extend([
        Arc::new(StringArray::from(vec![meta.dataset.as_str(); n])) as ArrayRef,
        Arc::new(Int32Array::from(vec![meta.season; n])) as ArrayRef,
        Arc::new(Int32Array::from(vec![meta.week; n])) as ArrayRef,
        Arc::new(TimestampMicrosecondArray::from(vec![snapshot_us; n]).with_timezone("UTC")) as ArrayRef,
        Arc::new(StringArray::from(vec![meta.source.as_str(); n])) as ArrayRef,
        Arc::new(Int64Array::from(vec![n as i64; n])) as ArrayRef,
        Arc::new(Int32Array::from(vec![meta.schema_version as i32; n])) as ArrayRef,
        Arc::new(StringArray::from(vec![meta.file_hash.as_str(); n])) as ArrayRef,
    ]);

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| StorageError::Encode(format!("building record batch: {e}")))
}

fn write_parquet(path: &Path, batch: &RecordBatch, codec: ArchiveCodec) -> Result<(), StorageError> {
    let encode = |what: &str, e: &dyn fmt::Display| {
        StorageError::Encode(format!("{what} {}: {e}", path.display()))
    };
    let file = File::create(path).map_err(|e| encode("creating", &e))?;
    let props = WriterProperties::builder()
        .set_compression(codec.compression())
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|e| encode("opening parquet writer", &e))?;
    writer
        .write(batch)
        .map_err(|e| encode("writing record batch", &e))?;
    writer
        .close()
        .map_err(|e| encode("closing parquet writer", &e))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveReceipt {
    pub path: String,
    pub bytes: u64,
}

pub struct ArchiveWriter {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    codec: ArchiveCodec,
    scratch_dir: PathBuf,
}

impl ArchiveWriter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        codec: ArchiveCodec,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
            codec,
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn path_for(&self, dataset: &str, partition: &Partition, at: DateTime<Utc>) -> ArchivePath {
        archive_path(&self.bucket, &self.prefix, dataset, partition, at)
    }

    pub async fn ensure_bucket(&self) -> Result<bool, StorageError> {
        let created = self.store.ensure_bucket(&self.bucket).await?;
        if created {
            info!(bucket = %self.bucket, "created bronze bucket");
        }
        Ok(created)
    }

    /// Encodes `rows` into a local temp file, uploads it with a single PUT and
    /// removes the temp file whether or not the upload succeeded.
    pub async fn write_partition(
        &self,
        rows: &[Row],
        path: &ArchivePath,
        meta: &ArchiveMetadata,
    ) -> Result<ArchiveReceipt, StorageError> {
        let batch = build_record_batch(rows, meta)?;
        let scratch = self
            .scratch_dir
            .join(format!(".gridiron-{}.parquet", Uuid::new_v4()));

        let result = self.encode_and_put(&batch, &scratch, path, meta).await;
        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %scratch.display(), error = %e, "failed to remove archive temp file");
            }
        }
        let bytes = result?;

        info!(
            dataset = %meta.dataset,
            path = %path,
            rows = rows.len(),
            bytes,
            codec = %self.codec,
            "archived partition"
        );
        Ok(ArchiveReceipt {
            path: path.to_string(),
            bytes,
        })
    }

    async fn encode_and_put(
        &self,
        batch: &RecordBatch,
        scratch: &Path,
        path: &ArchivePath,
        meta: &ArchiveMetadata,
    ) -> Result<u64, StorageError> {
        write_parquet(scratch, batch, self.codec)?;
        let body = tokio::fs::read(scratch)
            .await
            .map_err(|e| StorageError::Encode(format!("reading {}: {e}", scratch.display())))?;
        let bytes = body.len() as u64;

        let object_meta = BTreeMap::from([
            ("content-hash".to_string(), meta.file_hash.clone()),
            ("dataset".to_string(), meta.dataset.clone()),
            ("row-count".to_string(), batch.num_rows().to_string()),
            ("schema-version".to_string(), meta.schema_version.to_string()),
            ("source".to_string(), meta.source.clone()),
        ]);
        self.store
            .put_object(&path.bucket, &path.key, Bytes::from(body), &object_meta)
            .await?;
        Ok(bytes)
    }
}
