//! Core domain model shared by the gridiron ingestion crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "gridiron-core";

/// One upstream row: column name -> JSON value. Keys iterate in sorted order.
pub type Row = Map<String, JsonValue>;

/// Sentinel stored in place of an absent season or week.
pub const INT_SENTINEL: i32 = -1;
/// Sentinel stored in place of an absent text key component.
pub const TEXT_SENTINEL: &str = "";

/// Column names the raw-table key is extracted from.
pub const KEY_COLUMNS: [&str; 5] = ["season", "week", "player_id", "team", "game_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionType {
    Snapshot,
    Seasonal,
    Weekly,
}

impl PartitionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Seasonal => "seasonal",
            Self::Weekly => "weekly",
        }
    }

    /// Partition keys a dataset of this type must declare.
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Snapshot => &["snapshot_date"],
            Self::Seasonal => &["season"],
            Self::Weekly => &["season", "week"],
        }
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named slice of a dataset. Only the keys relevant to the slice are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_date: Option<NaiveDate>,
}

impl Partition {
    pub fn weekly(season: i32, week: i32) -> Self {
        Self {
            season: Some(season),
            week: Some(week),
            snapshot_date: None,
        }
    }

    pub fn seasonal(season: i32) -> Self {
        Self {
            season: Some(season),
            ..Self::default()
        }
    }

    pub fn snapshot(date: NaiveDate) -> Self {
        Self {
            snapshot_date: Some(date),
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(date) = self.snapshot_date {
            parts.push(format!("snapshot_date={date}"));
        }
        if let Some(season) = self.season {
            parts.push(format!("season={season}"));
        }
        if let Some(week) = self.week {
            parts.push(format!("week={week}"));
        }
        if parts.is_empty() {
            f.write_str("<unpartitioned>")
        } else {
            f.write_str(&parts.join("/"))
        }
    }
}

/// Total composite key of a raw-table row; absent components hold sentinels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub dataset: String,
    pub season: i32,
    pub week: i32,
    pub player_id: String,
    pub team: String,
    pub game_id: String,
}

impl RecordKey {
    /// Extracts the key from a normalized row, substituting sentinels.
    pub fn extract(dataset: &str, row: &Row) -> Self {
        Self {
            dataset: dataset.to_string(),
            season: row.get("season").and_then(json_i32).unwrap_or(INT_SENTINEL),
            week: row.get("week").and_then(json_i32).unwrap_or(INT_SENTINEL),
            player_id: row.get("player_id").map(json_text).unwrap_or_default(),
            team: row.get("team").map(json_text).unwrap_or_default(),
            game_id: row.get("game_id").map(json_text).unwrap_or_default(),
        }
    }

    /// Pipe-joined key components, the prefix of every content hash.
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.dataset, self.season, self.week, self.player_id, self.team, self.game_id
        )
    }
}

/// Missing, null and blank text all count as an absent key component and are
/// the only values stored under a sentinel.
pub fn is_absent(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Reads an integer out of a JSON number or numeric string.
pub fn json_i32(value: &JsonValue) -> Option<i32> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .and_then(|v| i32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Renders a key component as text; null becomes the text sentinel.
pub fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => TEXT_SENTINEL.to_string(),
        JsonValue::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Ledger status of one file-registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Pending,
    Applied,
    Skipped,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown ingest status: {other}")),
        }
    }
}

/// Outcome of one orchestrated partition run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Skipped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// New file-registry row, before the ledger assigns id and `ingested_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttempt {
    pub dataset: String,
    pub storage_path: String,
    pub snapshot_at: DateTime<Utc>,
    pub season: Option<i32>,
    pub week: Option<i32>,
    pub row_count: i64,
    pub hash: String,
    pub status: IngestStatus,
    pub message: Option<String>,
}

/// Persisted, append-only file-registry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRegistryEntry {
    pub id: i64,
    pub dataset: String,
    pub storage_path: String,
    pub snapshot_at: DateTime<Utc>,
    pub season: Option<i32>,
    pub week: Option<i32>,
    pub row_count: i64,
    pub hash: String,
    pub ingested_at: DateTime<Utc>,
    pub status: IngestStatus,
    pub message: Option<String>,
}

impl FileRegistryEntry {
    pub fn from_attempt(id: i64, attempt: &FileAttempt, ingested_at: DateTime<Utc>) -> Self {
        Self {
            id,
            dataset: attempt.dataset.clone(),
            storage_path: attempt.storage_path.clone(),
            snapshot_at: attempt.snapshot_at,
            season: attempt.season,
            week: attempt.week,
            row_count: attempt.row_count,
            hash: attempt.hash.clone(),
            ingested_at,
            status: attempt.status,
            message: attempt.message.clone(),
        }
    }
}

/// Latest applied state of one (dataset, partition).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub dataset: String,
    pub partition: Partition,
    pub applied_file_id: Option<i64>,
    pub row_count: i64,
    pub hash: String,
    pub applied_at: DateTime<Utc>,
}

/// Freshness row handed to the downstream serving layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub dataset: String,
    pub partition: Partition,
    pub row_count: i64,
    pub applied_at: DateTime<Utc>,
}

impl From<&ManifestEntry> for ManifestSummary {
    fn from(entry: &ManifestEntry) -> Self {
        Self {
            dataset: entry.dataset.clone(),
            partition: entry.partition.clone(),
            row_count: entry.row_count,
            applied_at: entry.applied_at,
        }
    }
}
