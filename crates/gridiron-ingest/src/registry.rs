//! Declarative dataset definitions loaded once from YAML.

use std::collections::BTreeMap;
use std::path::Path;

use gridiron_adapters::LoaderKind;
use gridiron_core::PartitionType;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{IngestError, IngestResult};

/// How rows that share an entity identity within one partition are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Empty `game_id` is replaced by a short hash of the primary-key
    /// projection, so re-extracts of the same identity land on the same key.
    #[default]
    NaturalKey,
    /// The provider emits several legitimate rows per entity; every row gets a
    /// `game_id` derived from its full content.
    RecordSurrogate {
        #[serde(default)]
        drop_exact_duplicates: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Partitioning {
    #[serde(rename = "type")]
    pub kind: PartitionType,
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatasetSpec {
    #[serde(default)]
    description: String,
    loader_fn: String,
    partitioning: Partitioning,
    #[serde(default)]
    pk: Vec<String>,
    #[serde(default)]
    required_fields: Vec<String>,
    #[serde(default)]
    id_columns: Vec<String>,
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    #[serde(default)]
    rename_map: BTreeMap<String, String>,
    #[serde(default)]
    dedup: DedupPolicy,
}

fn default_schema_version() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryFile {
    datasets: BTreeMap<String, DatasetSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetDefinition {
    pub id: String,
    pub description: String,
    pub loader: LoaderKind,
    pub partitioning: Partitioning,
    pub pk: Vec<String>,
    pub required_fields: Vec<String>,
    pub id_columns: Vec<String>,
    pub schema_version: u32,
    pub rename_map: BTreeMap<String, String>,
    pub dedup: DedupPolicy,
}

impl DatasetDefinition {
    pub fn partition_type(&self) -> PartitionType {
        self.partitioning.kind
    }
}

/// Raw tables are named after dataset ids, so ids must be plain identifiers.
pub fn is_sql_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && id.len() <= 63
}

fn build_definition(
    id: String,
    spec: DatasetSpec,
    problems: &mut Vec<String>,
) -> Option<DatasetDefinition> {
    let start = problems.len();

    if !is_sql_identifier(&id) {
        problems.push(format!("{id}: dataset id is not a lowercase SQL identifier"));
    }
    let loader = match spec.loader_fn.parse::<LoaderKind>() {
        Ok(loader) => Some(loader),
        Err(err) => {
            problems.push(format!("{id}: {err}"));
            None
        }
    };

    let mut declared: Vec<&str> = spec.partitioning.keys.iter().map(String::as_str).collect();
    declared.sort_unstable();
    let mut expected = spec.partitioning.kind.required_keys().to_vec();
    expected.sort_unstable();
    if declared != expected {
        problems.push(format!(
            "{id}: {} partitioning requires keys {:?}, got {:?}",
            spec.partitioning.kind,
            spec.partitioning.kind.required_keys(),
            spec.partitioning.keys
        ));
    }
    if spec.pk.is_empty() {
        problems.push(format!("{id}: pk must list at least one column"));
    }

    if problems.len() > start {
        return None;
    }
    Some(DatasetDefinition {
        id,
        description: spec.description,
        loader: loader?,
        partitioning: spec.partitioning,
        pk: spec.pk,
        required_fields: spec.required_fields,
        id_columns: spec.id_columns,
        schema_version: spec.schema_version,
        rename_map: spec.rename_map,
        dedup: spec.dedup,
    })
}

/// Immutable registry of dataset definitions, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    datasets: BTreeMap<String, DatasetDefinition>,
}

impl DatasetRegistry {
    pub fn load(path: impl AsRef<Path>) -> IngestResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Configuration(format!("reading {}: {e}", path.display()))
        })?;
        let registry = Self::from_yaml_str(&text).map_err(|e| match e {
            IngestError::Configuration(msg) => {
                IngestError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?;
        info!(path = %path.display(), datasets = registry.len(), "loaded dataset registry");
        Ok(registry)
    }

    /// Parses and checks every definition; any problem fails the whole load.
    pub fn from_yaml_str(text: &str) -> IngestResult<Self> {
        let file: RegistryFile = serde_yaml::from_str(text)
            .map_err(|e| IngestError::Configuration(format!("parsing dataset registry: {e}")))?;

        let mut problems = Vec::new();
        let mut datasets = BTreeMap::new();
        for (id, spec) in file.datasets {
            if let Some(def) = build_definition(id.clone(), spec, &mut problems) {
                datasets.insert(id, def);
            }
        }
        if !problems.is_empty() {
            return Err(IngestError::Configuration(problems.join("; ")));
        }
        Ok(Self { datasets })
    }

    pub fn get(&self, id: &str) -> IngestResult<&DatasetDefinition> {
        self.datasets
            .get(id)
            .ok_or_else(|| IngestError::NotFound(format!("dataset {id:?}")))
    }

    pub fn list(&self) -> Vec<&DatasetDefinition> {
        self.datasets.values().collect()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    fn of_type(&self, kind: PartitionType) -> Vec<&DatasetDefinition> {
        self.datasets
            .values()
            .filter(|d| d.partition_type() == kind)
            .collect()
    }

    pub fn weekly(&self) -> Vec<&DatasetDefinition> {
        self.of_type(PartitionType::Weekly)
    }

    pub fn seasonal(&self) -> Vec<&DatasetDefinition> {
        self.of_type(PartitionType::Seasonal)
    }

    pub fn snapshot(&self) -> Vec<&DatasetDefinition> {
        self.of_type(PartitionType::Snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
datasets:
  players:
    description: Player master list
    loader_fn: import_players
    partitioning: { type: snapshot, keys: [snapshot_date] }
    pk: [player_id]
    required_fields: [player_id]
    id_columns: [player_id]
  rosters:
    loader_fn: import_rosters
    partitioning: { type: seasonal, keys: [season] }
    pk: [season, player_id, team]
    required_fields: [season, player_id]
    schema_version: 2
  weekly_player_stats:
    loader_fn: import_weekly_data
    partitioning: { type: weekly, keys: [week, season] }
    pk: [season, week, player_id]
    required_fields: [season, week, player_id]
    rename_map: { recent_team: team }
  depth_charts:
    loader_fn: import_depth_charts
    partitioning: { type: weekly, keys: [season, week] }
    pk: [season, week, player_id, team]
    dedup: { policy: record_surrogate, drop_exact_duplicates: true }
"#;

    #[test]
    fn loads_and_filters_by_partition_type() {
        let registry = DatasetRegistry::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(registry.len(), 4);
        let weekly: Vec<_> = registry.weekly().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(weekly, vec!["depth_charts", "weekly_player_stats"]);
        assert_eq!(registry.seasonal()[0].id, "rosters");
        assert_eq!(registry.snapshot()[0].id, "players");

        let rosters = registry.get("rosters").unwrap();
        assert_eq!(rosters.schema_version, 2);
        assert_eq!(rosters.loader, LoaderKind::Rosters);
        assert_eq!(rosters.dedup, DedupPolicy::NaturalKey);
        assert_eq!(
            registry.get("depth_charts").unwrap().dedup,
            DedupPolicy::RecordSurrogate {
                drop_exact_duplicates: true
            }
        );
    }

    #[test]
    fn unknown_dataset_is_not_found() {
        let registry = DatasetRegistry::from_yaml_str(SAMPLE).unwrap();
        assert!(matches!(
            registry.get("play_by_play"),
            Err(IngestError::NotFound(_))
        ));
    }

    #[test]
    fn every_definition_problem_is_reported_together() {
        let bad = r#"
datasets:
  pbp:
    loader_fn: import_pbp
    partitioning: { type: weekly, keys: [season, week] }
    pk: [play_id]
  Bad-Name:
    loader_fn: import_players
    partitioning: { type: seasonal, keys: [season, week] }
    pk: []
"#;
        let err = DatasetRegistry::from_yaml_str(bad).unwrap_err();
        let IngestError::Configuration(message) = err else {
            panic!("expected configuration error, got {err:?}");
        };
        assert!(message.contains("unknown loader function: import_pbp"));
        assert!(message.contains("Bad-Name: dataset id is not a lowercase SQL identifier"));
        assert!(message.contains("seasonal partitioning requires keys"));
        assert!(message.contains("pk must list at least one column"));
    }

    #[test]
    fn unknown_fields_fail_the_load() {
        let bad = r#"
datasets:
  players:
    loader_fn: import_players
    partitioning: { type: snapshot, keys: [snapshot_date] }
    pk: [player_id]
    primary_key: [player_id]
"#;
        assert!(matches!(
            DatasetRegistry::from_yaml_str(bad),
            Err(IngestError::Configuration(_))
        ));
    }

    #[test]
    fn identifiers_are_lowercase_sql_names() {
        assert!(is_sql_identifier("weekly_player_stats"));
        assert!(is_sql_identifier("pfr2"));
        assert!(!is_sql_identifier("2pfr"));
        assert!(!is_sql_identifier("player stats"));
        assert!(!is_sql_identifier("x\";drop"));
    }
}
