use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use serde_json::{json, Value as JsonValue};
use wxp_core::CleanedRow;
use wxp_pipeline::{
    MemoryWarehouse, Pipeline, PipelineConfig, RunError, StageOutcome, StageRecord,
};
use wxp_source::FixtureWeatherSource;
use wxp_storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};

fn config() -> PipelineConfig {
    PipelineConfig::from_yaml_str("source:\n  entities: [Paris, Tokyo]\n").expect("config")
}

fn paris(dt: i64) -> JsonValue {
    json!({
        "coord": {"lon": 2.3488, "lat": 48.8534},
        "weather": [{"id": 803, "main": "Clouds", "description": "broken clouds", "icon": "04d"}],
        "base": "stations",
        "main": {"temp": 15.0, "feels_like": 14.3, "temp_min": 13.9, "temp_max": 16.1, "pressure": 1012, "humidity": 72},
        "visibility": 10000,
        "wind": {"speed": 4.12, "deg": 240},
        "clouds": {"all": 75},
        "dt": dt,
        "sys": {"type": 2, "id": 2041230, "country": "FR", "sunrise": 1727934862, "sunset": 1727976392},
        "timezone": 7200,
        "id": 2988507,
        "name": "Paris",
        "cod": 200
    })
}

fn an_hour_ago() -> i64 {
    Utc::now().timestamp() - 3600
}

fn source() -> FixtureWeatherSource {
    FixtureWeatherSource::new()
        .with_document("Paris", paris(an_hour_ago()))
        .with_rejection("Tokyo", 500, "{\"cod\":500,\"message\":\"internal error\"}")
}

fn outcome(records: &[StageRecord], stage: &str) -> StageOutcome {
    records
        .iter()
        .find(|r| r.stage == stage)
        .map(|r| r.outcome)
        .expect("stage recorded")
}

fn stored_row(timestamp: NaiveDateTime, id: i32) -> CleanedRow {
    CleanedRow {
        timestamp: Some(timestamp),
        id: Some(id),
        country: Some("FR".into()),
        city: Some("Paris".into()),
        main_temp: None,
        temp_min: None,
        temp_max: None,
        cloudiness: None,
        humidity: None,
        wind_speed: None,
        rain: None,
        condition: None,
        weather_description: None,
        longitude: None,
        latitude: None,
    }
}

#[tokio::test]
async fn hourly_run_lands_reachable_entities_and_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(LocalObjectStore::new(dir.path()));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = Pipeline::new(config(), Arc::new(source()), store.clone(), warehouse.clone())
        .expect("pipeline");

    let summary = pipeline.run_once().await.expect("first run");
    assert_eq!(summary.counters.entities_requested, 2);
    assert_eq!(summary.counters.entities_fetched, 1);
    assert_eq!(summary.counters.bronze_rows, 1);
    assert_eq!(summary.counters.silver_rows, 1);
    assert_eq!(summary.counters.staged_rows, 1);
    assert_eq!(summary.counters.merged_rows, 1);
    assert_eq!(summary.counters.pruned_rows, 0);
    assert!(summary.counters.silver_sha256.is_some());
    assert_eq!(summary.stages.len(), 8);
    assert!(summary
        .stages
        .iter()
        .all(|s| s.outcome == StageOutcome::Succeeded));

    assert!(dir.path().join("bronze_file/part-00000.csv").exists());
    let silver = store.get("Weather_Data__Silver.csv").await.expect("silver");
    let silver = String::from_utf8(silver).expect("utf8");
    let mut lines = silver.lines();
    assert_eq!(
        lines.next(),
        Some("timestamp,id,country,city,main_temp,temp_min,temp_max,cloudiness,humidity,wind_speed,rain,condition,weather_description,longitude,latitude")
    );
    assert!(lines.next().expect("paris line").contains(",Paris,"));
    assert_eq!(lines.next(), None);

    let rows = warehouse.permanent_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, Some(2_988_507));
    assert_eq!(rows[0].rain, None);
    assert_eq!(rows[0].condition.as_deref(), Some("Clouds"));
    assert!(!warehouse.staging_exists());

    let again = pipeline.run_once().await.expect("second run");
    assert_eq!(again.counters.merged_rows, 0);
    assert_eq!(warehouse.permanent_rows().len(), 1);
    assert_ne!(again.run_id, summary.run_id);
}

#[tokio::test(start_paused = true)]
async fn unreachable_staging_fails_after_five_attempts_and_still_cleans_up() {
    let warehouse = Arc::new(MemoryWarehouse::new().failing_create(5));
    let pipeline = Pipeline::new(
        config(),
        Arc::new(source()),
        Arc::new(MemoryObjectStore::new()),
        warehouse.clone(),
    )
    .expect("pipeline");

    let started = tokio::time::Instant::now();
    let err = pipeline.run_once().await.expect_err("staging never comes up");
    let elapsed = started.elapsed();

    let RunError::StageFailed {
        stage,
        attempts,
        records,
        ..
    } = err
    else {
        panic!("unexpected error kind");
    };
    assert_eq!(stage, "create_staging");
    assert_eq!(attempts, 5);
    assert_eq!(warehouse.create_attempts(), 5);
    assert!(elapsed >= Duration::from_secs(240) && elapsed < Duration::from_secs(241));

    assert_eq!(outcome(&records, "transform"), StageOutcome::Succeeded);
    assert_eq!(outcome(&records, "load_staging"), StageOutcome::Skipped);
    assert_eq!(outcome(&records, "merge"), StageOutcome::Skipped);
    assert_eq!(outcome(&records, "prune"), StageOutcome::Skipped);
    assert_eq!(outcome(&records, "drop_staging"), StageOutcome::Succeeded);
    assert!(warehouse.permanent_rows().is_empty());
}

#[tokio::test(start_paused = true)]
async fn staging_recovering_on_last_attempt_completes_the_run() {
    let warehouse = Arc::new(MemoryWarehouse::new().failing_create(4));
    let pipeline = Pipeline::new(
        config(),
        Arc::new(source()),
        Arc::new(MemoryObjectStore::new()),
        warehouse.clone(),
    )
    .expect("pipeline");

    let summary = pipeline.run_once().await.expect("fifth attempt succeeds");
    let create = summary
        .stages
        .iter()
        .find(|s| s.stage == "create_staging")
        .expect("create recorded");
    assert_eq!(create.attempts, 5);
    assert_eq!(summary.counters.merged_rows, 1);
    assert_eq!(warehouse.permanent_rows().len(), 1);
}

#[tokio::test]
async fn transform_failure_aborts_the_run() {
    let mut undated = paris(an_hour_ago());
    undated
        .as_object_mut()
        .expect("object")
        .remove("dt");
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = Pipeline::new(
        config(),
        Arc::new(FixtureWeatherSource::new().with_document("Paris", undated)),
        Arc::new(MemoryObjectStore::new()),
        warehouse.clone(),
    )
    .expect("pipeline");

    let err = pipeline.run_once().await.expect_err("dt column missing");
    let RunError::StageFailed { stage, records, .. } = err else {
        panic!("unexpected error kind");
    };
    assert_eq!(stage, "transform");
    assert_eq!(outcome(&records, "create_staging"), StageOutcome::Skipped);
    assert_eq!(outcome(&records, "drop_staging"), StageOutcome::Succeeded);
    assert_eq!(warehouse.create_attempts(), 0);
}

#[tokio::test]
async fn run_with_no_reachable_entities_succeeds_with_empty_silver() {
    let store = Arc::new(MemoryObjectStore::new());
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = Pipeline::new(
        config(),
        Arc::new(FixtureWeatherSource::new().with_unavailable("Paris", "connection refused")),
        store.clone(),
        warehouse.clone(),
    )
    .expect("pipeline");

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.counters.entities_fetched, 0);
    assert_eq!(summary.counters.silver_rows, 0);
    assert_eq!(summary.counters.merged_rows, 0);

    let silver = store.get("Weather_Data__Silver.csv").await.expect("silver");
    assert_eq!(String::from_utf8(silver).expect("utf8").lines().count(), 1);
    assert!(warehouse.permanent_rows().is_empty());
}

#[tokio::test]
async fn rows_past_retention_are_pruned_after_merge() {
    let now = Utc::now();
    let stale = (now - chrono::Duration::hours(30)).naive_utc();
    let recent = (now - chrono::Duration::hours(2)).naive_utc();
    let warehouse = Arc::new(
        MemoryWarehouse::new().with_rows(vec![stored_row(stale, 1), stored_row(recent, 2)]),
    );
    let pipeline = Pipeline::new(
        config(),
        Arc::new(source()),
        Arc::new(MemoryObjectStore::new()),
        warehouse.clone(),
    )
    .expect("pipeline");

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.counters.merged_rows, 1);
    assert_eq!(summary.counters.pruned_rows, 1);
    let mut ids: Vec<_> = warehouse
        .permanent_rows()
        .into_iter()
        .filter_map(|r| r.id)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![2, 2_988_507]);
}
