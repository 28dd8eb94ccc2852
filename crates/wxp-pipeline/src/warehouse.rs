//! Relational store: per-run staging table, anti-join merge and retention pruning.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::postgres::{PgPoolCopyExt, PgPoolOptions};
use sqlx::PgPool;
use tracing::{debug, info};
use wxp_core::{CleanedRow, ColumnKind, SILVER_COLUMNS};

use crate::config::WarehouseConfig;
use crate::transform::parse_silver_csv;

pub const PERMANENT_TABLE: &str = "open_weather_data";
pub const STAGING_TABLE: &str = "open_weather_data_staging";

/// Operations the pipeline needs from the relational store.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Creates an empty staging table, replacing any leftover from an earlier run.
    async fn create_staging(&self) -> Result<()>;

    /// Bulk-loads a silver CSV (with header) into staging; returns the rows loaded.
    async fn load_staging(&self, csv: &[u8]) -> Result<u64>;

    /// Inserts staged rows whose `(timestamp, id)` is not yet present; returns rows inserted.
    async fn merge_staging(&self) -> Result<u64>;

    async fn drop_staging(&self) -> Result<()>;

    /// Deletes permanent rows strictly older than `cutoff`.
    async fn prune_before(&self, cutoff: NaiveDateTime) -> Result<u64>;
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Timestamp => "TIMESTAMP",
        ColumnKind::Integer => "INTEGER",
        ColumnKind::Float => "DOUBLE PRECISION",
        ColumnKind::Text => "TEXT",
    }
}

/// Silver column names, double-quoted so `timestamp` is never read as a keyword.
pub fn quoted_columns(alias: Option<&str>) -> String {
    SILVER_COLUMNS
        .iter()
        .map(|c| match alias {
            Some(alias) => format!("{alias}.\"{}\"", c.name),
            None => format!("\"{}\"", c.name),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load-order column filled by `COPY`; not part of the silver contract.
pub const STAGED_ROW_COLUMN: &str = "staged_row";

pub fn staging_ddl() -> String {
    let columns = SILVER_COLUMNS
        .iter()
        .map(|c| format!("\"{}\" {}", c.name, sql_type(c.kind)))
        .collect::<Vec<_>>()
        .join(",\n    ");
    format!(
        "CREATE TABLE {STAGING_TABLE} (\n    {columns},\n    {STAGED_ROW_COLUMN} BIGINT GENERATED ALWAYS AS IDENTITY\n)"
    )
}

pub fn copy_statement() -> String {
    format!(
        "COPY {STAGING_TABLE} ({}) FROM STDIN WITH (FORMAT csv, HEADER true, DELIMITER ',', ENCODING 'UTF8')",
        quoted_columns(None)
    )
}

pub fn merge_statement() -> String {
    format!(
        r#"
        INSERT INTO {PERMANENT_TABLE} ({columns})
        SELECT DISTINCT ON (s."timestamp", s.id) {staged}
          FROM {STAGING_TABLE} s
         WHERE s."timestamp" IS NOT NULL
           AND NOT EXISTS (
               SELECT 1
                 FROM {PERMANENT_TABLE} t
                WHERE t."timestamp" = s."timestamp"
                  AND t.id IS NOT DISTINCT FROM s.id
           )
         ORDER BY s."timestamp", s.id, s.{STAGED_ROW_COLUMN}
        "#,
        columns = quoted_columns(None),
        staged = quoted_columns(Some("s")),
    )
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Builds the pool without touching the network; the first query connects.
    pub fn connect_lazy(config: &WarehouseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_lazy(&config.database_url)
            .context("invalid warehouse database_url")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying warehouse migrations")?;
        info!("warehouse migrations applied");
        Ok(())
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn create_staging(&self) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {STAGING_TABLE}"))
            .execute(&self.pool)
            .await
            .context("dropping leftover staging table")?;
        sqlx::query(&staging_ddl())
            .execute(&self.pool)
            .await
            .context("creating staging table")?;
        Ok(())
    }

    async fn load_staging(&self, csv: &[u8]) -> Result<u64> {
        let mut copy = self
            .pool
            .copy_in_raw(&copy_statement())
            .await
            .context("starting COPY into staging")?;
        let sent = copy.send(csv).await.map(|_| ());
        if let Err(err) = sent {
            copy.abort("silver upload failed").await.ok();
            return Err(err).context("streaming silver csv into staging");
        }
        let rows = copy.finish().await.context("finishing COPY into staging")?;
        debug!(rows, "staging loaded");
        Ok(rows)
    }

    async fn merge_staging(&self) -> Result<u64> {
        let result = sqlx::query(&merge_statement())
            .execute(&self.pool)
            .await
            .context("merging staging into permanent table")?;
        Ok(result.rows_affected())
    }

    async fn drop_staging(&self) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {STAGING_TABLE}"))
            .execute(&self.pool)
            .await
            .context("dropping staging table")?;
        Ok(())
    }

    async fn prune_before(&self, cutoff: NaiveDateTime) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"DELETE FROM {PERMANENT_TABLE} WHERE "timestamp" < $1"#
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("pruning expired rows")?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    staging: Option<Vec<CleanedRow>>,
    permanent: Vec<CleanedRow>,
    create_failures_left: u32,
    create_attempts: u32,
}

/// In-process warehouse with the same merge and prune semantics as the SQL statements.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `failures` calls to `create_staging` fail as if the store were unreachable.
    pub fn failing_create(self, failures: u32) -> Self {
        self.lock().create_failures_left = failures;
        self
    }

    pub fn with_rows(self, rows: Vec<CleanedRow>) -> Self {
        self.lock().permanent = rows;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("warehouse lock poisoned")
    }

    pub fn permanent_rows(&self) -> Vec<CleanedRow> {
        self.lock().permanent.clone()
    }

    pub fn staging_exists(&self) -> bool {
        self.lock().staging.is_some()
    }

    pub fn create_attempts(&self) -> u32 {
        self.lock().create_attempts
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn create_staging(&self) -> Result<()> {
        let mut state = self.lock();
        state.create_attempts += 1;
        if state.create_failures_left > 0 {
            state.create_failures_left -= 1;
            bail!("relational store unreachable");
        }
        state.staging = Some(Vec::new());
        Ok(())
    }

    async fn load_staging(&self, csv: &[u8]) -> Result<u64> {
        let rows = parse_silver_csv(csv).context("parsing silver csv for staging")?;
        let mut state = self.lock();
        let Some(staging) = state.staging.as_mut() else {
            bail!("staging table {STAGING_TABLE} does not exist");
        };
        let loaded = rows.len() as u64;
        staging.extend(rows);
        Ok(loaded)
    }

    async fn merge_staging(&self) -> Result<u64> {
        let mut state = self.lock();
        let Some(staging) = state.staging.clone() else {
            bail!("staging table {STAGING_TABLE} does not exist");
        };
        let mut existing: HashSet<_> = state.permanent.iter().filter_map(CleanedRow::key).collect();
        let mut inserted = 0;
        // First staged row per key wins, like `DISTINCT ON` ordered by load position.
        for row in staging {
            let Some(key) = row.key() else { continue };
            if !existing.insert(key) {
                continue;
            }
            state.permanent.push(row);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn drop_staging(&self) -> Result<()> {
        self.lock().staging = None;
        Ok(())
    }

    async fn prune_before(&self, cutoff: NaiveDateTime) -> Result<u64> {
        let mut state = self.lock();
        let before = state.permanent.len();
        state
            .permanent
            .retain(|row| row.timestamp.map_or(true, |ts| ts >= cutoff));
        Ok((before - state.permanent.len()) as u64)
    }
}
