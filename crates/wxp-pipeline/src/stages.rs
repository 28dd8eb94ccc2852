//! Concrete pipeline stages. Each one reads its inputs from the object store, the warehouse or
//! the run context and records what it did in the run counters.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use wxp_core::Observation;
use wxp_source::{FetchOutcome, WeatherSource};
use wxp_storage::{clear_prefix, ObjectStore};

use crate::context::{RunContext, StagingState};
use crate::graph::{Stage, StageReport};
use crate::normalize::normalize;
use crate::transform::{to_csv, transform_parts};
use crate::warehouse::Warehouse;

pub const EXTRACT: &str = "extract";
pub const NORMALIZE: &str = "normalize";
pub const TRANSFORM: &str = "transform";
pub const CREATE_STAGING: &str = "create_staging";
pub const LOAD_STAGING: &str = "load_staging";
pub const MERGE: &str = "merge";
pub const DROP_STAGING: &str = "drop_staging";
pub const PRUNE: &str = "prune";

/// Name of the single bronze part written per run.
pub const BRONZE_PART: &str = "part-00000.csv";

/// Fetches every configured entity. A failed or rejected entity is logged and left out;
/// it never fails the stage.
pub struct ExtractStage {
    pub source: Arc<dyn WeatherSource>,
    pub entities: Vec<String>,
}

#[async_trait]
impl Stage for ExtractStage {
    fn name(&self) -> &'static str {
        EXTRACT
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport> {
        let mut observations = Vec::with_capacity(self.entities.len());
        for entity in &self.entities {
            match self.source.fetch(entity).await {
                Ok(FetchOutcome::Document(document)) => {
                    let observation = Observation::new(entity.as_str(), Utc::now(), document);
                    debug!(entity = %entity, descriptors = observation.descriptor_count(), "observation fetched");
                    observations.push(observation);
                }
                Ok(FetchOutcome::Rejected { status, body }) => {
                    warn!(entity = %entity, status, body = %body, "entity rejected by source; skipping");
                }
                Err(err) => {
                    warn!(entity = %entity, error = %format!("{err:#}"), "entity fetch failed; skipping");
                }
            }
        }

        let fetched = observations.len();
        ctx.update_counters(|c| {
            c.entities_requested = self.entities.len();
            c.entities_fetched = fetched;
        });
        ctx.put_observations(observations);
        info!(
            source = self.source.name(),
            requested = self.entities.len(),
            fetched,
            "extraction finished"
        );
        Ok(StageReport::rows(
            fetched as u64,
            format!("{fetched}/{} entities fetched", self.entities.len()),
        ))
    }
}

/// Flattens the observations and replaces the bronze artifact.
pub struct NormalizeStage {
    pub store: Arc<dyn ObjectStore>,
    pub bronze_dir: String,
}

#[async_trait]
impl Stage for NormalizeStage {
    fn name(&self) -> &'static str {
        NORMALIZE
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport> {
        let observations = ctx.take_observations()?;
        let table = normalize(&observations).context("flattening observations")?;
        let csv = table.to_csv()?;

        let removed = clear_prefix(self.store.as_ref(), &self.bronze_dir)
            .await
            .context("clearing previous bronze parts")?;
        let name = format!("{}{BRONZE_PART}", self.bronze_dir);
        let blob = self.store.put(&name, &csv).await?;

        let rows = table.num_rows();
        ctx.update_counters(|c| c.bronze_rows = rows);
        info!(blob = %blob.name, rows, columns = table.columns().len(), removed, "bronze written");
        Ok(StageReport::rows(rows as u64, blob.name))
    }
}

/// Projects every bronze part into the silver artifact.
pub struct TransformStage {
    pub store: Arc<dyn ObjectStore>,
    pub bronze_dir: String,
    pub silver_blob: String,
}

#[async_trait]
impl Stage for TransformStage {
    fn name(&self) -> &'static str {
        TRANSFORM
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport> {
        let mut parts = Vec::new();
        for name in self.store.list(&self.bronze_dir).await? {
            if !name.ends_with(".csv") {
                continue;
            }
            let bytes = self.store.get(&name).await?;
            parts.push((name, bytes));
        }

        let batch = transform_parts(&parts).context("building silver table")?;
        let csv = to_csv(&batch)?;
        let blob = self.store.put(&self.silver_blob, &csv).await?;

        let rows = batch.num_rows();
        ctx.update_counters(|c| {
            c.silver_rows = rows;
            c.silver_sha256 = Some(blob.content_hash.clone());
        });
        info!(blob = %blob.name, parts = parts.len(), rows, "silver written");
        Ok(StageReport::rows(rows as u64, blob.name))
    }
}

/// Creates the per-run staging table. Retries are configured on its graph node.
pub struct CreateStagingStage {
    pub warehouse: Arc<dyn Warehouse>,
}

#[async_trait]
impl Stage for CreateStagingStage {
    fn name(&self) -> &'static str {
        CREATE_STAGING
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport> {
        ctx.transition_staging(
            &[StagingState::Absent, StagingState::Creating],
            StagingState::Creating,
        )?;
        self.warehouse.create_staging().await?;
        ctx.transition_staging(&[StagingState::Creating], StagingState::Created)?;
        Ok(StageReport::detail("staging table created"))
    }
}

/// Bulk-loads the silver artifact into the staging table.
pub struct LoadStagingStage {
    pub warehouse: Arc<dyn Warehouse>,
    pub store: Arc<dyn ObjectStore>,
    pub silver_blob: String,
}

#[async_trait]
impl Stage for LoadStagingStage {
    fn name(&self) -> &'static str {
        LOAD_STAGING
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport> {
        ctx.transition_staging(&[StagingState::Created], StagingState::Loading)?;
        let csv = self
            .store
            .get(&self.silver_blob)
            .await
            .with_context(|| format!("reading silver artifact {}", self.silver_blob))?;
        let rows = self.warehouse.load_staging(&csv).await?;
        ctx.transition_staging(&[StagingState::Loading], StagingState::Loaded)?;
        ctx.update_counters(|c| c.staged_rows = rows);
        Ok(StageReport::rows(rows, "rows staged"))
    }
}

pub struct MergeStage {
    pub warehouse: Arc<dyn Warehouse>,
}

#[async_trait]
impl Stage for MergeStage {
    fn name(&self) -> &'static str {
        MERGE
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport> {
        let inserted = self.warehouse.merge_staging().await?;
        ctx.mark_merged(Utc::now());
        ctx.update_counters(|c| c.merged_rows = inserted);
        info!(inserted, "staging merged");
        Ok(StageReport::rows(inserted, "new rows inserted"))
    }
}

/// Removes the staging table. Wired to run even when upstream stages failed.
pub struct DropStagingStage {
    pub warehouse: Arc<dyn Warehouse>,
}

#[async_trait]
impl Stage for DropStagingStage {
    fn name(&self) -> &'static str {
        DROP_STAGING
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport> {
        self.warehouse.drop_staging().await?;
        ctx.reset_staging();
        Ok(StageReport::detail("staging table dropped"))
    }
}

/// Deletes permanent rows older than the retention window, measured from the merge time.
pub struct PruneStage {
    pub warehouse: Arc<dyn Warehouse>,
    pub retention: chrono::Duration,
}

#[async_trait]
impl Stage for PruneStage {
    fn name(&self) -> &'static str {
        PRUNE
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport> {
        let merged_at = ctx.merged_at().unwrap_or_else(Utc::now);
        let cutoff = (merged_at - self.retention).naive_utc();
        let deleted = self.warehouse.prune_before(cutoff).await?;
        ctx.update_counters(|c| c.pruned_rows = deleted);
        info!(deleted, %cutoff, "expired rows pruned");
        Ok(StageReport::rows(deleted, format!("rows older than {cutoff} deleted")))
    }
}
