//! One extract → normalize → validate → archive → upsert → record run per
//! (dataset, partition).

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use gridiron_adapters::{FeedAdapter, LoaderArgs};
use gridiron_core::{IngestStatus, Partition, PartitionType, RunStatus};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::archive::{partition_content_hash, ArchiveMetadata, ArchiveWriter};
use crate::error::{IngestError, IngestResult};
use crate::ledger::{AttemptTemplate, Ledger};
use crate::normalize::{normalize_rows, validate_batch};
use crate::registry::{DatasetDefinition, DatasetRegistry};
use crate::upsert::{RawTableUpserter, UpsertReport};

/// Structured result of one partition run; errors never escape the runner.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionOutcome {
    pub dataset: String,
    pub partition: Partition,
    pub row_count: usize,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upsert: Option<UpsertReport>,
    /// Set when the terminal ledger write itself failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_error: Option<String>,
}

/// Maps a partition onto loader arguments for the dataset's scheme.
pub fn loader_args(kind: PartitionType, partition: &Partition) -> IngestResult<LoaderArgs> {
    let season = || {
        partition.season.ok_or_else(|| {
            IngestError::Configuration(format!("{kind} partition {partition} has no season"))
        })
    };
    Ok(match kind {
        PartitionType::Weekly => LoaderArgs {
            years: Some(vec![season()?]),
            weeks: partition.week.map(|w| vec![w]),
        },
        PartitionType::Seasonal => LoaderArgs {
            years: Some(vec![season()?]),
            weeks: None,
        },
        PartitionType::Snapshot => LoaderArgs::default(),
    })
}

enum Completed {
    Skipped,
    Applied(UpsertReport),
}

pub struct PartitionRunner {
    registry: Arc<DatasetRegistry>,
    feed: Arc<FeedAdapter>,
    archive: ArchiveWriter,
    upserter: RawTableUpserter,
    ledger: Arc<dyn Ledger>,
}

impl PartitionRunner {
    pub fn new(
        registry: Arc<DatasetRegistry>,
        feed: Arc<FeedAdapter>,
        archive: ArchiveWriter,
        upserter: RawTableUpserter,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self {
            registry,
            feed,
            archive,
            upserter,
            ledger,
        }
    }

    pub fn registry(&self) -> &Arc<DatasetRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub async fn load_partition(&self, dataset: &str, partition: &Partition) -> PartitionOutcome {
        let span = info_span!("load_partition", dataset, partition = %partition);
        self.load_partition_inner(dataset, partition)
            .instrument(span)
            .await
    }

    async fn load_partition_inner(&self, dataset: &str, partition: &Partition) -> PartitionOutcome {
        let started = Instant::now();
        let snapshot_at = Utc::now();
        let mut template = AttemptTemplate::new(dataset, partition, snapshot_at);
        let mut outcome = PartitionOutcome {
            dataset: dataset.to_string(),
            partition: partition.clone(),
            row_count: 0,
            status: RunStatus::Failed,
            message: None,
            duration_ms: 0,
            path: None,
            hash: None,
            upsert: None,
            ledger_error: None,
        };

        let def = match self.registry.get(dataset) {
            Ok(def) => def,
            Err(err) => {
                error!(error = %err, "unknown dataset");
                outcome.message = Some(err.to_string());
                outcome.duration_ms = started.elapsed().as_millis() as u64;
                return outcome;
            }
        };

        match self
            .run(def, partition, snapshot_at, &mut template, &mut outcome)
            .await
        {
            Ok(Completed::Applied(report)) => {
                outcome.status = RunStatus::Success;
                outcome.upsert = Some(report);
            }
            Ok(Completed::Skipped) => {
                outcome.status = RunStatus::Skipped;
                outcome.message = Some("no rows for partition".to_string());
                info!("no rows upstream; partition skipped");
                let attempt = template.attempt(IngestStatus::Skipped, outcome.message.clone());
                if let Err(err) = self.ledger.record_attempt(&attempt).await {
                    warn!(error = %err, "could not record skipped attempt");
                    outcome.ledger_error = Some(err.to_string());
                }
            }
            Err(err) => {
                let message = format!("{} error: {err}", err.kind());
                error!(error = %err, kind = err.kind(), "partition load failed");
                let attempt = template.attempt(IngestStatus::Failed, Some(message.clone()));
                if let Err(ledger_err) = self.ledger.record_attempt(&attempt).await {
                    error!(error = %ledger_err, "could not record failed attempt");
                    outcome.ledger_error = Some(ledger_err.to_string());
                }
                outcome.status = RunStatus::Failed;
                outcome.message = Some(message);
            }
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            status = outcome.status.as_str(),
            rows = outcome.row_count,
            duration_ms = outcome.duration_ms,
            "partition run finished"
        );
        outcome
    }

    async fn run(
        &self,
        def: &DatasetDefinition,
        partition: &Partition,
        snapshot_at: DateTime<Utc>,
        template: &mut AttemptTemplate,
        outcome: &mut PartitionOutcome,
    ) -> IngestResult<Completed> {
        let args = loader_args(def.partition_type(), partition)?;
        let rows = self.feed.load(def.loader, &args).await?;
        if rows.is_empty() {
            return Ok(Completed::Skipped);
        }

        let rows = normalize_rows(rows, &def.rename_map);
        outcome.row_count = rows.len();
        template.row_count = rows.len() as i64;
        validate_batch(&def.id, &rows, &def.required_fields)?;

        let hash = partition_content_hash(&rows);
        let path = self.archive.path_for(&def.id, partition, snapshot_at);
        template.hash = hash.clone();
        template.storage_path = path.to_string();
        outcome.hash = Some(hash.clone());
        outcome.path = Some(path.to_string());

        self.archive.ensure_bucket().await?;
        let meta = ArchiveMetadata {
            dataset: def.id.clone(),
            season: partition.season,
            week: partition.week,
            snapshot_at,
            source: self.feed.source_id().to_string(),
            schema_version: def.schema_version,
            file_hash: hash.clone(),
        };
        self.archive.write_partition(&rows, &path, &meta).await?;

        self.ledger
            .record_attempt(&template.attempt(IngestStatus::Pending, None))
            .await?;

        let row_count = rows.len() as i64;
        let report = self.upserter.upsert(def, rows).await?;

        let applied_id = self
            .ledger
            .record_attempt(&template.attempt(IngestStatus::Applied, None))
            .await?;
        self.ledger
            .update_manifest(&def.id, partition, Some(applied_id), row_count, &hash)
            .await?;
        Ok(Completed::Applied(report))
    }
}
