use std::path::PathBuf;
use std::sync::Arc;

use gridiron_adapters::{FeedAdapter, FixtureFeed};
use gridiron_core::{Partition, RunStatus, INT_SENTINEL};
use gridiron_ingest::{build_runner, DatasetRegistry, DedupPolicy, IngestSettings, MemoryWarehouse};
use gridiron_storage::FsObjectStore;
use tempfile::tempdir;

fn workspace_path(rel: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..").join(rel)
}

#[test]
fn shipped_registry_loads_every_dataset() {
    let registry = DatasetRegistry::load(workspace_path("config/datasets.yml")).unwrap();
    for id in [
        "players",
        "rosters",
        "schedules",
        "weekly_player_stats",
        "participation",
        "injuries",
        "depth_charts",
    ] {
        let def = registry.get(id).unwrap();
        assert!(!def.pk.is_empty(), "{id} has no pk");
        assert!(!def.required_fields.is_empty(), "{id} has no required fields");
        assert!(!def.id_columns.is_empty(), "{id} has no id columns");
    }
    assert_eq!(registry.snapshot().len(), 1);
    assert_eq!(registry.seasonal().len(), 2);
    assert_eq!(registry.weekly().len(), 4);
    assert!(matches!(
        registry.get("depth_charts").unwrap().dedup,
        DedupPolicy::RecordSurrogate { .. }
    ));
}

#[tokio::test]
async fn fixture_feed_loads_into_a_filesystem_bronze_root() {
    let bronze = tempdir().unwrap();
    let registry = Arc::new(DatasetRegistry::load(workspace_path("config/datasets.yml")).unwrap());
    let warehouse = Arc::new(MemoryWarehouse::new());
    let runner = build_runner(
        &IngestSettings::default(),
        registry,
        FeedAdapter::new(FixtureFeed::new(workspace_path("fixtures"))),
        Arc::new(FsObjectStore::new(bronze.path())),
        warehouse.clone(),
    );

    let weekly = runner
        .load_partition("weekly_player_stats", &Partition::weekly(2024, 10))
        .await;
    assert_eq!(weekly.status, RunStatus::Success, "{:?}", weekly.message);
    assert_eq!(weekly.row_count, 3);
    let path = weekly.path.unwrap();
    let local = bronze.path().join("bronze").join(path.trim_start_matches("s3://bronze/"));
    assert!(local.exists(), "missing {}", local.display());

    let players = runner
        .load_partition("players", &Partition::snapshot(chrono::Utc::now().date_naive()))
        .await;
    assert_eq!(players.status, RunStatus::Success, "{:?}", players.message);
    let raw = warehouse.raw_rows("players");
    assert_eq!(raw.len(), 3);
    assert!(raw.keys().all(|k| k.season == INT_SENTINEL && !k.team.is_empty()));

    let depth = runner
        .load_partition("depth_charts", &Partition::weekly(2024, 10))
        .await;
    assert_eq!(depth.status, RunStatus::Success, "{:?}", depth.message);
    let report = depth.upsert.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.dropped_duplicates, 1);
    assert_eq!(warehouse.raw_rows("depth_charts").len(), 2);
}
