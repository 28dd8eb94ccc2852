use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wxp_pipeline::{PgWarehouse, PipelineConfig, RunError, RunSummary, StageRecord};
use wxp_source::FixtureWeatherSource;

#[derive(Debug, Parser)]
#[command(name = "wxp-cli")]
#[command(about = "Hourly weather ingest pipeline")]
struct Cli {
    /// Pipeline configuration file.
    #[arg(long, env = "WXP_CONFIG", default_value = "wxp.yaml", global = true)]
    config: PathBuf,
    /// Print run summaries as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Run {
        /// Read observations from a fixture file instead of the live API.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// Apply warehouse migrations.
    Migrate,
    /// Validate the configuration and print the stage graph.
    CheckConfig,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run { fixtures: None }) {
        Commands::Run { fixtures } => {
            let pipeline = match fixtures {
                Some(path) => {
                    let source = FixtureWeatherSource::from_path(&path)?;
                    wxp_pipeline::pipeline_with_source(config, Arc::new(source))?
                }
                None => wxp_pipeline::pipeline_from_config(config)?,
            };
            match pipeline.run_once().await {
                Ok(summary) => print_summary(&summary, cli.json)?,
                Err(err) => {
                    if let RunError::StageFailed { records, .. } = &err {
                        print_stages(records);
                    }
                    return Err(err.into());
                }
            }
        }
        Commands::Schedule => {
            let cron = config.schedule.cron.clone();
            let pipeline = Arc::new(wxp_pipeline::pipeline_from_config(config)?);
            let mut sched = wxp_pipeline::build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
        Commands::Migrate => {
            PgWarehouse::connect_lazy(&config.warehouse)?
                .run_migrations()
                .await?;
            println!("migrations applied");
        }
        Commands::CheckConfig => {
            let pipeline = wxp_pipeline::pipeline_from_config(config)?;
            let config = pipeline.config();
            println!("entities: {}", config.source.entities.join(", "));
            println!("bronze: {}  silver: {}", config.bronze_dir(), config.artifacts.silver_blob);
            println!(
                "staging retry: {} attempts, {}s apart",
                config.staging_retry.max_attempts, config.staging_retry.delay_secs
            );
            println!("retention: {}h  cron: {}", config.warehouse.retention_hours, config.schedule.cron);
            println!("stages: {}", pipeline.stage_names().join(" -> "));
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    let c = &summary.counters;
    println!(
        "run complete: run_id={} fetched={}/{} bronze_rows={} silver_rows={} merged={} pruned={}",
        summary.run_id,
        c.entities_fetched,
        c.entities_requested,
        c.bronze_rows,
        c.silver_rows,
        c.merged_rows,
        c.pruned_rows
    );
    print_stages(&summary.stages);
    Ok(())
}

fn print_stages(records: &[StageRecord]) {
    for r in records {
        eprintln!(
            "  {:<15} {:<10} attempts={} {}",
            r.stage,
            format!("{:?}", r.outcome),
            r.attempts,
            r.detail
        );
    }
}
