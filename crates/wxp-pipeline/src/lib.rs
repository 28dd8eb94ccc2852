//! Hourly weather ingest: extract, bronze, silver, staging, merge, prune.

pub mod config;
pub mod context;
pub mod graph;
pub mod normalize;
pub mod stages;
pub mod transform;
pub mod warehouse;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use wxp_source::{HttpWeatherSource, UrlTemplate, WeatherSource};
use wxp_storage::{
    AzureBlobConfig, AzureBlobStore, HttpClientConfig, HttpFetcher, LocalObjectStore, ObjectStore,
};

pub use config::{ConfigError, ObjectStoreConfig, PipelineConfig};
pub use context::{RunContext, RunCounters, StagingState};
pub use graph::{
    GraphError, Node, RetryPolicy, RunError, Stage, StageGraph, StageOutcome, StageRecord,
    TriggerRule,
};
pub use warehouse::{MemoryWarehouse, PgWarehouse, Warehouse};

use stages::{
    CreateStagingStage, DropStagingStage, ExtractStage, LoadStagingStage, MergeStage,
    NormalizeStage, PruneStage, TransformStage, CREATE_STAGING, EXTRACT, LOAD_STAGING, MERGE,
    NORMALIZE, TRANSFORM,
};

pub const CRATE_NAME: &str = "wxp-pipeline";

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: RunCounters,
    pub stages: Vec<StageRecord>,
}

pub struct Pipeline {
    config: PipelineConfig,
    graph: StageGraph,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("entities", &self.config.source.entities)
            .field("graph", &self.graph)
            .finish()
    }
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn WeatherSource>,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Result<Self, GraphError> {
        let graph = build_graph(&config, source, store, warehouse)?;
        Ok(Self { config, graph })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.graph.stage_names()
    }

    /// Executes the whole graph once. Any stage failure fails the run; the cleanup stage
    /// still runs first.
    pub async fn run_once(&self) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("pipeline_run", %run_id);

        async move {
            info!(entities = self.config.source.entities.len(), "run started");
            let ctx = Arc::new(RunContext::new(run_id, started_at));
            let result = self.graph.execute(Arc::clone(&ctx)).await;
            let counters = ctx.counters();
            match result {
                Ok(stages) => {
                    let summary = RunSummary {
                        run_id,
                        started_at,
                        finished_at: Utc::now(),
                        counters,
                        stages,
                    };
                    info!(
                        fetched = summary.counters.entities_fetched,
                        silver_rows = summary.counters.silver_rows,
                        merged = summary.counters.merged_rows,
                        pruned = summary.counters.pruned_rows,
                        "run finished"
                    );
                    Ok(summary)
                }
                Err(err) => {
                    error!(error = %err, fetched = counters.entities_fetched, "run failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// extract -> normalize -> transform -> create_staging -> load_staging -> merge, then
/// drop_staging and prune in parallel.
pub fn build_graph(
    config: &PipelineConfig,
    source: Arc<dyn WeatherSource>,
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
) -> Result<StageGraph, GraphError> {
    let bronze_dir = config.bronze_dir();
    let silver_blob = config.artifacts.silver_blob.clone();

    StageGraph::new(vec![
        Node::new(Arc::new(ExtractStage {
            source,
            entities: config.source.entities.clone(),
        })),
        Node::new(Arc::new(NormalizeStage {
            store: Arc::clone(&store),
            bronze_dir: bronze_dir.clone(),
        }))
        .after(&[EXTRACT]),
        Node::new(Arc::new(TransformStage {
            store: Arc::clone(&store),
            bronze_dir,
            silver_blob: silver_blob.clone(),
        }))
        .after(&[NORMALIZE]),
        Node::new(Arc::new(CreateStagingStage {
            warehouse: Arc::clone(&warehouse),
        }))
        .after(&[TRANSFORM])
        .with_retry(config.staging_retry.policy()),
        Node::new(Arc::new(LoadStagingStage {
            warehouse: Arc::clone(&warehouse),
            store,
            silver_blob,
        }))
        .after(&[CREATE_STAGING]),
        Node::new(Arc::new(MergeStage {
            warehouse: Arc::clone(&warehouse),
        }))
        .after(&[LOAD_STAGING]),
        Node::new(Arc::new(DropStagingStage {
            warehouse: Arc::clone(&warehouse),
        }))
        .after(&[MERGE])
        .with_trigger(TriggerRule::AllDone),
        Node::new(Arc::new(PruneStage {
            warehouse,
            retention: config.retention(),
        }))
        .after(&[MERGE]),
    ])
}

pub fn object_store_from_config(config: &PipelineConfig) -> Result<Arc<dyn ObjectStore>> {
    Ok(match &config.object_store {
        ObjectStoreConfig::Local { root } => Arc::new(LocalObjectStore::new(root.clone())),
        ObjectStoreConfig::Azure {
            account,
            container,
            sas_token,
            endpoint,
        } => Arc::new(AzureBlobStore::new(AzureBlobConfig {
            account: account.clone(),
            container: container.clone(),
            sas_token: sas_token.clone(),
            endpoint: endpoint.clone(),
            timeout: Duration::from_secs(config.source.http_timeout_secs),
        })?),
    })
}

pub fn http_source_from_config(config: &PipelineConfig) -> Result<Arc<dyn WeatherSource>> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.source.http_timeout_secs),
        user_agent: Some(config.source.user_agent.clone()),
        ..Default::default()
    })?;
    let template = UrlTemplate::parse(&config.source.url_template)?;
    Ok(Arc::new(HttpWeatherSource::new(
        http,
        template,
        config.source.api_key.clone(),
    )))
}

/// Production wiring with a caller-chosen source: configured object store and Postgres.
pub fn pipeline_with_source(
    config: PipelineConfig,
    source: Arc<dyn WeatherSource>,
) -> Result<Pipeline> {
    let store = object_store_from_config(&config)?;
    let warehouse = Arc::new(PgWarehouse::connect_lazy(&config.warehouse)?);
    Ok(Pipeline::new(config, source, store, warehouse)?)
}

pub fn pipeline_from_config(config: PipelineConfig) -> Result<Pipeline> {
    let source = http_source_from_config(&config)?;
    pipeline_with_source(config, source)
}

/// Cron-driven runs. A tick that fires while the previous run is still going is skipped.
pub async fn build_scheduler(pipeline: Arc<Pipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().schedule.cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_flight = Arc::new(tokio::sync::Mutex::new(()));

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let in_flight = Arc::clone(&in_flight);
        Box::pin(async move {
            let Ok(_guard) = in_flight.try_lock_owned() else {
                warn!("previous run still in progress; skipping this tick");
                return;
            };
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled run succeeded"),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
