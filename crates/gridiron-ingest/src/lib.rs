//! Partitioned bronze-layer ingestion: registry, normalization, archive,
//! hash-gated raw upserts, ledger and flow drivers.

pub mod archive;
pub mod config;
pub mod error;
pub mod flows;
pub mod ledger;
pub mod memory;
pub mod normalize;
pub mod pipeline;
pub mod postgres;
pub mod registry;
pub mod upsert;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gridiron_adapters::{FeedAdapter, FixtureFeed, NflverseFeed};
use gridiron_storage::{FsObjectStore, HttpClientConfig, HttpFetcher, ObjectStore};
use tracing::info;

pub use archive::{archive_path, partition_content_hash, ArchivePath, ArchiveWriter};
pub use config::{ArchiveCodec, FeedMode, IngestSettings};
pub use error::{IngestError, StorageError, ValidationError};
pub use flows::{build_scheduler, FlowRunner, FlowSummary, StatusReport};
pub use ledger::Ledger;
pub use memory::MemoryWarehouse;
pub use pipeline::{loader_args, PartitionOutcome, PartitionRunner};
pub use postgres::PgWarehouse;
pub use registry::{DatasetDefinition, DatasetRegistry, DedupPolicy};
pub use upsert::{RawRecord, RawStore, RawTableUpserter, UpsertReport};

pub const CRATE_NAME: &str = "gridiron-ingest";

pub fn feed_from_settings(settings: &IngestSettings) -> Result<FeedAdapter> {
    Ok(match settings.feed_mode {
        FeedMode::Http => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(settings.http_timeout_secs),
                user_agent: Some(settings.user_agent.clone()),
            })
            .context("building http client")?;
            FeedAdapter::new(NflverseFeed::new(http, settings.feed_base_url.clone()))
        }
        FeedMode::Fixtures => FeedAdapter::new(FixtureFeed::new(settings.fixtures_dir.clone())),
    })
}

/// Wires a runner from its parts; the warehouse serves as both raw store and
/// ledger.
pub fn build_runner<W>(
    settings: &IngestSettings,
    registry: Arc<DatasetRegistry>,
    feed: FeedAdapter,
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<W>,
) -> PartitionRunner
where
    W: RawStore + Ledger + 'static,
{
    let archive = ArchiveWriter::new(store, settings.bucket.clone(), settings.prefix.clone(), settings.codec);
    let upserter = RawTableUpserter::new(warehouse.clone(), settings.max_chunk_rows);
    PartitionRunner::new(registry, Arc::new(feed), archive, upserter, warehouse)
}

/// Production composition: YAML registry, configured feed, filesystem bronze
/// root and Postgres warehouse.
pub async fn flows_from_settings(settings: &IngestSettings) -> Result<FlowRunner> {
    let registry = Arc::new(DatasetRegistry::load(&settings.datasets_config)?);
    let feed = feed_from_settings(settings)?;
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(settings.bronze_root.clone()));
    let warehouse = Arc::new(
        PgWarehouse::connect(&settings.database_url)
            .await
            .context("connecting to warehouse")?,
    );
    info!(
        datasets = registry.len(),
        feed = feed.source_id(),
        bronze_root = %settings.bronze_root.display(),
        "ingestion wired"
    );
    let runner = build_runner(settings, registry, feed, store, warehouse);
    Ok(FlowRunner::new(Arc::new(runner), settings.default_season))
}
