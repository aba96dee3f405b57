//! Refresh, backfill and status drivers composed over [`PartitionRunner`].

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use gridiron_core::{ManifestSummary, Partition, RunStatus};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::{current_week, default_season, REGULAR_SEASON_WEEKS};
use crate::error::IngestResult;
use crate::pipeline::{PartitionOutcome, PartitionRunner};
use crate::registry::DatasetRegistry;

pub type PlannedRun = (String, Partition);

#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub scope: String,
    pub total_partitions: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<PartitionOutcome>,
}

impl FlowSummary {
    fn from_results(scope: String, results: Vec<PartitionOutcome>) -> Self {
        let count = |status: RunStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            total_partitions: results.len(),
            successful: count(RunStatus::Success),
            failed: count(RunStatus::Failed),
            skipped: count(RunStatus::Skipped),
            scope,
            results,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub total: usize,
    pub datasets: Vec<ManifestSummary>,
}

/// Weekly datasets for (season, week), seasonal for season, snapshots for today.
pub fn plan_daily_refresh(
    registry: &DatasetRegistry,
    season: i32,
    week: i32,
    today: NaiveDate,
) -> Vec<PlannedRun> {
    let mut plan = Vec::new();
    for def in registry.weekly() {
        plan.push((def.id.clone(), Partition::weekly(season, week)));
    }
    for def in registry.seasonal() {
        plan.push((def.id.clone(), Partition::seasonal(season)));
    }
    for def in registry.snapshot() {
        plan.push((def.id.clone(), Partition::snapshot(today)));
    }
    plan
}

/// Per season: weekly datasets over `weeks` (the regular season when `None`)
/// then seasonal datasets; snapshot datasets once at the end.
pub fn plan_backfill(
    registry: &DatasetRegistry,
    seasons: &[i32],
    weeks: Option<&[i32]>,
    today: NaiveDate,
) -> Vec<PlannedRun> {
    let weeks: Vec<i32> = match weeks {
        Some(weeks) if !weeks.is_empty() => weeks.to_vec(),
        _ => REGULAR_SEASON_WEEKS.collect(),
    };
    let mut plan = Vec::new();
    for &season in seasons {
        for def in registry.weekly() {
            for &week in &weeks {
                plan.push((def.id.clone(), Partition::weekly(season, week)));
            }
        }
        for def in registry.seasonal() {
            plan.push((def.id.clone(), Partition::seasonal(season)));
        }
    }
    for def in registry.snapshot() {
        plan.push((def.id.clone(), Partition::snapshot(today)));
    }
    plan
}

fn join_ints(values: &[i32]) -> String {
    values
        .iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub struct FlowRunner {
    runner: Arc<PartitionRunner>,
    default_season: Option<i32>,
}

impl FlowRunner {
    pub fn new(runner: Arc<PartitionRunner>, default_season: Option<i32>) -> Self {
        Self {
            runner,
            default_season,
        }
    }

    pub fn runner(&self) -> &Arc<PartitionRunner> {
        &self.runner
    }

    pub async fn daily_refresh(&self, season: Option<i32>, week: Option<i32>) -> FlowSummary {
        let today = Utc::now().date_naive();
        let season = season.unwrap_or_else(|| default_season(today, self.default_season));
        let week = week.unwrap_or_else(|| current_week(today));
        let plan = plan_daily_refresh(self.runner.registry(), season, week, today);
        self.run_plan(format!("daily_refresh season={season} week={week}"), plan)
            .await
    }

    pub async fn backfill(&self, seasons: &[i32], weeks: Option<&[i32]>) -> FlowSummary {
        let today = Utc::now().date_naive();
        let plan = plan_backfill(self.runner.registry(), seasons, weeks, today);
        let mut scope = format!("backfill seasons={}", join_ints(seasons));
        if let Some(weeks) = weeks.filter(|w| !w.is_empty()) {
            scope.push_str(&format!(" weeks={}", join_ints(weeks)));
        }
        self.run_plan(scope, plan).await
    }

    pub async fn list_status(&self) -> IngestResult<StatusReport> {
        let datasets = self.runner.ledger().latest_manifest().await?;
        Ok(StatusReport {
            total: datasets.len(),
            datasets,
        })
    }

    /// Runs every planned partition in order; a failure never stops the rest.
    pub async fn run_plan(&self, scope: String, plan: Vec<PlannedRun>) -> FlowSummary {
        info!(scope = %scope, partitions = plan.len(), "flow started");
        let mut results = Vec::with_capacity(plan.len());
        for (dataset, partition) in plan {
            let outcome = self.runner.load_partition(&dataset, &partition).await;
            if outcome.status == RunStatus::Failed {
                warn!(
                    dataset = %dataset,
                    partition = %partition,
                    reason = outcome.message.as_deref().unwrap_or_default(),
                    "partition failed; continuing"
                );
            }
            results.push(outcome);
        }
        let summary = FlowSummary::from_results(scope, results);
        info!(
            scope = %summary.scope,
            total = summary.total_partitions,
            successful = summary.successful,
            failed = summary.failed,
            skipped = summary.skipped,
            "flow finished"
        );
        summary
    }
}

/// Cron job that runs the daily refresh with default season and week.
pub async fn build_scheduler(flows: Arc<FlowRunner>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let flows = flows.clone();
        Box::pin(async move {
            let summary = flows.daily_refresh(None, None).await;
            if summary.failed > 0 {
                error!(scope = %summary.scope, failed = summary.failed, "scheduled refresh had failures");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DatasetRegistry {
        DatasetRegistry::from_yaml_str(
            r#"
datasets:
  players:
    loader_fn: import_players
    partitioning: { type: snapshot, keys: [snapshot_date] }
    pk: [player_id]
  rosters:
    loader_fn: import_rosters
    partitioning: { type: seasonal, keys: [season] }
    pk: [season, player_id]
  injuries:
    loader_fn: import_injuries
    partitioning: { type: weekly, keys: [season, week] }
    pk: [season, week, player_id]
  weekly_player_stats:
    loader_fn: import_weekly_data
    partitioning: { type: weekly, keys: [season, week] }
    pk: [season, week, player_id]
"#,
        )
        .unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 11, 12).unwrap()
    }

    #[test]
    fn daily_refresh_covers_every_partition_type_once() {
        let plan = plan_daily_refresh(&registry(), 2024, 10, today());
        assert_eq!(
            plan,
            vec![
                ("injuries".to_string(), Partition::weekly(2024, 10)),
                ("weekly_player_stats".to_string(), Partition::weekly(2024, 10)),
                ("rosters".to_string(), Partition::seasonal(2024)),
                ("players".to_string(), Partition::snapshot(today())),
            ]
        );
    }

    #[test]
    fn backfill_defaults_to_the_regular_season() {
        let plan = plan_backfill(&registry(), &[2023, 2024], None, today());
        // 2 seasons x (2 weekly x 18 weeks + 1 seasonal) + 1 snapshot
        assert_eq!(plan.len(), 2 * (2 * 18 + 1) + 1);
        assert_eq!(plan[0], ("injuries".to_string(), Partition::weekly(2023, 1)));
        assert_eq!(
            plan.last().unwrap(),
            &("players".to_string(), Partition::snapshot(today()))
        );
        let snapshots = plan.iter().filter(|(d, _)| d == "players").count();
        assert_eq!(snapshots, 1);
    }

    #[test]
    fn backfill_honours_explicit_weeks() {
        let plan = plan_backfill(&registry(), &[2024], Some(&[1, 2][..]), today());
        let weekly: Vec<_> = plan
            .iter()
            .filter(|(_, p)| p.week.is_some())
            .map(|(d, p)| format!("{d}:{}", p.week.unwrap_or_default()))
            .collect();
        assert_eq!(
            weekly,
            vec!["injuries:1", "injuries:2", "weekly_player_stats:1", "weekly_player_stats:2"]
        );
    }
}
