//! Feed adapter contracts + nflverse and fixture-backed feed sources.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use arrow_array::cast::AsArray;
use arrow_array::types::{
    Date32Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, UInt16Type,
    UInt32Type, UInt64Type, UInt8Type,
};
use arrow_array::{Array, RecordBatch};
use arrow_schema::DataType;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use gridiron_core::{is_absent, Row};
use gridiron_storage::{FetchError, HttpFetcher};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "gridiron-adapters";

pub const NFLVERSE_RELEASES_URL: &str =
    "https://github.com/nflverse/nflverse-data/releases/download";

/// Days between 0001-01-01 and the Unix epoch.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Error)]
#[error("unknown loader function: {0}")]
pub struct UnknownLoader(pub String);

/// Closed set of upstream loaders a dataset may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoaderKind {
    #[serde(rename = "import_players")]
    Players,
    #[serde(rename = "import_rosters")]
    Rosters,
    #[serde(rename = "import_schedules")]
    Schedules,
    #[serde(rename = "import_weekly_data")]
    WeeklyData,
    #[serde(rename = "import_snap_counts")]
    SnapCounts,
    #[serde(rename = "import_injuries")]
    Injuries,
    #[serde(rename = "import_depth_charts")]
    DepthCharts,
}

impl LoaderKind {
    pub const ALL: [LoaderKind; 7] = [
        Self::Players,
        Self::Rosters,
        Self::Schedules,
        Self::WeeklyData,
        Self::SnapCounts,
        Self::Injuries,
        Self::DepthCharts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Players => "import_players",
            Self::Rosters => "import_rosters",
            Self::Schedules => "import_schedules",
            Self::WeeklyData => "import_weekly_data",
            Self::SnapCounts => "import_snap_counts",
            Self::Injuries => "import_injuries",
            Self::DepthCharts => "import_depth_charts",
        }
    }

    /// nflverse release assets covering the requested seasons.
    pub fn release_assets(&self, args: &LoaderArgs) -> Vec<String> {
        let per_year = |template: &str| -> Vec<String> {
            args.years
                .iter()
                .flatten()
                .map(|year| template.replace("{year}", &year.to_string()))
                .collect()
        };
        match self {
            Self::Players => vec!["players/players.parquet".to_string()],
            Self::Schedules => vec!["schedules/games.parquet".to_string()],
            Self::Rosters => per_year("rosters/roster_{year}.parquet"),
            Self::WeeklyData => per_year("player_stats/player_stats_{year}.parquet"),
            Self::SnapCounts => per_year("snap_counts/snap_counts_{year}.parquet"),
            Self::Injuries => per_year("injuries/injuries_{year}.parquet"),
            Self::DepthCharts => per_year("depth_charts/depth_charts_{year}.parquet"),
        }
    }

    /// Provider columns that can stand in for `player_id`, in preference order.
    pub fn entity_id_alternatives(&self) -> &'static [&'static str] {
        match self {
            Self::Schedules => &[],
            Self::SnapCounts => &["gsis_id", "pfr_player_id"],
            _ => &["gsis_id"],
        }
    }

    /// Provider columns that can stand in for `team`. `None` when the feed
    /// has no single owning team per row.
    pub fn team_aliases(&self) -> Option<&'static [&'static str]> {
        match self {
            Self::Schedules => None,
            Self::Players => Some(&["latest_team", "team_abbr"]),
            Self::WeeklyData => Some(&["recent_team", "team_abbr"]),
            Self::Rosters | Self::SnapCounts => Some(&["team_abbr", "club_code"]),
            Self::Injuries | Self::DepthCharts => Some(&["club_code", "team_abbr"]),
        }
    }
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LoaderKind {
    type Err = UnknownLoader;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| UnknownLoader(s.to_string()))
    }
}

/// Loader arguments derived from a partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub years: Option<Vec<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weeks: Option<Vec<i32>>,
}

/// Raw upstream rows for a loader; filtering and identity handling happen in
/// [`FeedAdapter`].
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(&self, kind: LoaderKind, args: &LoaderArgs) -> Result<Vec<Row>, FetchError>;
}

pub struct FeedAdapter {
    source: Box<dyn FeedSource>,
}

impl FeedAdapter {
    pub fn new(source: impl FeedSource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    pub fn source_id(&self) -> &'static str {
        self.source.source_id()
    }

    /// Loads the slice described by `args`. An empty vec means the upstream
    /// has nothing for the slice.
    pub async fn load(&self, kind: LoaderKind, args: &LoaderArgs) -> Result<Vec<Row>, FetchError> {
        let rows = self.source.fetch(kind, args).await?;
        let fetched = rows.len();
        let rows = filter_slice(rows, args);
        debug!(loader = %kind, fetched, kept = rows.len(), "filtered feed rows to slice");
        Ok(normalize_identity(kind, rows))
    }
}

fn in_filter(row: &Row, column: &str, allowed: Option<&Vec<i32>>) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    let value = row.get(column);
    if is_absent(value) {
        return true;
    }
    value
        .and_then(gridiron_core::json_i32)
        .is_some_and(|v| allowed.contains(&v))
}

/// Keeps rows inside the requested seasons/weeks. Rows without the column
/// (e.g. the players master list) are not season-scoped and are kept; rows
/// whose value is present but not an integer belong to no slice.
pub fn filter_slice(mut rows: Vec<Row>, args: &LoaderArgs) -> Vec<Row> {
    rows.retain(|row| {
        in_filter(row, "season", args.years.as_ref()) && in_filter(row, "week", args.weeks.as_ref())
    });
    rows
}

fn first_present(row: &Row, columns: &[&str]) -> Option<JsonValue> {
    columns
        .iter()
        .filter_map(|c| row.get(*c))
        .find(|v| !is_absent(Some(*v)))
        .cloned()
}

/// Derives `player_id` and `team` from provider-specific columns.
pub fn normalize_identity(kind: LoaderKind, mut rows: Vec<Row>) -> Vec<Row> {
    let alternatives = kind.entity_id_alternatives();
    let mut defaulted_team = 0usize;

    for row in &mut rows {
        if !alternatives.is_empty() && is_absent(row.get("player_id")) {
            if let Some(id) = first_present(row, alternatives) {
                row.insert("player_id".to_string(), id);
            }
        }
        if let Some(aliases) = kind.team_aliases() {
            if is_absent(row.get("team")) {
                match first_present(row, aliases) {
                    Some(team) => {
                        row.insert("team".to_string(), team);
                    }
                    None => {
                        row.insert("team".to_string(), JsonValue::String(String::new()));
                        defaulted_team += 1;
                    }
                }
            }
        }
    }

    if defaulted_team > 0 {
        warn!(
            loader = %kind,
            rows = defaulted_team,
            "no team column found; defaulting team to empty string"
        );
    }
    rows
}

/// Downloads nflverse release parquet assets.
pub struct NflverseFeed {
    http: HttpFetcher,
    base_url: String,
}

impl NflverseFeed {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn asset_url(&self, asset: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), asset)
    }
}

#[async_trait]
impl FeedSource for NflverseFeed {
    fn source_id(&self) -> &'static str {
        "nflverse"
    }

    async fn fetch(&self, kind: LoaderKind, args: &LoaderArgs) -> Result<Vec<Row>, FetchError> {
        let mut rows = Vec::new();
        for asset in kind.release_assets(args) {
            let url = self.asset_url(&asset);
            match self.http.fetch_optional(&url).await? {
                Some(resp) => {
                    let decoded = decode_parquet_rows(resp.body, &resp.final_url)?;
                    info!(loader = %kind, url = %url, rows = decoded.len(), "loaded release asset");
                    rows.extend(decoded);
                }
                None => info!(loader = %kind, url = %url, "release asset not published"),
            }
        }
        Ok(rows)
    }
}

/// Reads `{root}/{loader}.json` (a JSON array of objects) for offline runs.
#[derive(Debug, Clone)]
pub struct FixtureFeed {
    root: PathBuf,
}

impl FixtureFeed {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, kind: LoaderKind) -> PathBuf {
        self.root.join(format!("{}.json", kind.name()))
    }
}

fn read_fixture_rows(path: &Path) -> anyhow::Result<Vec<Row>> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl FeedSource for FixtureFeed {
    fn source_id(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch(&self, kind: LoaderKind, _args: &LoaderArgs) -> Result<Vec<Row>, FetchError> {
        let path = self.fixture_path(kind);
        if !path.exists() {
            debug!(path = %path.display(), "no fixture for loader");
            return Ok(Vec::new());
        }
        read_fixture_rows(&path).map_err(|e| FetchError::Malformed {
            source_ref: path.display().to_string(),
            message: format!("{e:#}"),
        })
    }
}

fn is_supported(data_type: &DataType) -> bool {
    match data_type {
        DataType::Utf8
        | DataType::LargeUtf8
        | DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Float32
        | DataType::Float64
        | DataType::Date32
        | DataType::Null => true,
        DataType::Dictionary(key, value) => {
            key.as_ref() == &DataType::Int32 && is_supported(value.as_ref())
        }
        _ => false,
    }
}

fn float_json(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn cell_to_json(array: &dyn Array, idx: usize) -> JsonValue {
    if array.is_null(idx) {
        return JsonValue::Null;
    }
    match array.data_type() {
        DataType::Utf8 => JsonValue::from(array.as_string::<i32>().value(idx)),
        DataType::LargeUtf8 => JsonValue::from(array.as_string::<i64>().value(idx)),
        DataType::Boolean => JsonValue::from(array.as_boolean().value(idx)),
        DataType::Int8 => JsonValue::from(array.as_primitive::<Int8Type>().value(idx)),
        DataType::Int16 => JsonValue::from(array.as_primitive::<Int16Type>().value(idx)),
        DataType::Int32 => JsonValue::from(array.as_primitive::<Int32Type>().value(idx)),
        DataType::Int64 => JsonValue::from(array.as_primitive::<Int64Type>().value(idx)),
        DataType::UInt8 => JsonValue::from(array.as_primitive::<UInt8Type>().value(idx)),
        DataType::UInt16 => JsonValue::from(array.as_primitive::<UInt16Type>().value(idx)),
        DataType::UInt32 => JsonValue::from(array.as_primitive::<UInt32Type>().value(idx)),
        DataType::UInt64 => JsonValue::from(array.as_primitive::<UInt64Type>().value(idx)),
        DataType::Float32 => float_json(f64::from(array.as_primitive::<Float32Type>().value(idx))),
        DataType::Float64 => float_json(array.as_primitive::<Float64Type>().value(idx)),
        DataType::Date32 => {
            let days = array.as_primitive::<Date32Type>().value(idx);
            NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
                .map(|d| JsonValue::String(d.to_string()))
                .unwrap_or(JsonValue::Null)
        }
        DataType::Dictionary(key, _) if key.as_ref() == &DataType::Int32 => {
            let dict = array.as_dictionary::<Int32Type>();
            let value_idx = dict.keys().value(idx) as usize;
            cell_to_json(dict.values().as_ref(), value_idx)
        }
        _ => JsonValue::Null,
    }
}

/// Converts one arrow batch into JSON rows keyed by column name.
pub fn record_batch_to_rows(batch: &RecordBatch) -> Vec<Row> {
    let schema = batch.schema();
    let mut rows = vec![Row::new(); batch.num_rows()];
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        for (idx, row) in rows.iter_mut().enumerate() {
            row.insert(field.name().clone(), cell_to_json(column.as_ref(), idx));
        }
    }
    rows
}

/// Decodes a parquet file body into JSON rows.
pub fn decode_parquet_rows(body: Bytes, source_ref: &str) -> Result<Vec<Row>, FetchError> {
    let malformed = |message: String| FetchError::Malformed {
        source_ref: source_ref.to_string(),
        message,
    };
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(body).map_err(|e| malformed(e.to_string()))?;
    for field in builder.schema().fields() {
        if !is_supported(field.data_type()) {
            warn!(
                source_ref,
                column = %field.name(),
                data_type = %field.data_type(),
                "unsupported column type; values will be null"
            );
        }
    }
    let reader = builder.build().map_err(|e| malformed(e.to_string()))?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| malformed(e.to_string()))?;
        rows.extend(record_batch_to_rows(&batch));
    }
    Ok(rows)
}
