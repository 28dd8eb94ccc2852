//! Core domain model for WXP: raw observations, the silver column contract and cleaned rows.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "wxp-core";

/// Name of the list field holding condition descriptors in a raw observation.
pub const DESCRIPTOR_FIELD: &str = "weather";

/// Identifier field shared by the outer document and each descriptor.
pub const IDENTIFIER_FIELD: &str = "id";

/// Bronze column the descriptor identifier is renamed to before it is joined back.
pub const DESCRIPTOR_ID_COLUMN: &str = "weather_id";

/// Raw per-entity document as returned by the weather source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub entity: String,
    pub fetched_at: DateTime<Utc>,
    pub document: JsonValue,
}

impl Observation {
    pub fn new(entity: impl Into<String>, fetched_at: DateTime<Utc>, document: JsonValue) -> Self {
        Self {
            entity: entity.into(),
            fetched_at,
            document,
        }
    }

    /// Number of condition descriptors carried by the document.
    pub fn descriptor_count(&self) -> usize {
        self.document
            .get(DESCRIPTOR_FIELD)
            .and_then(JsonValue::as_array)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Timestamp,
    Integer,
    Float,
    Text,
}

/// One output column of the silver projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub source: &'static str,
    pub kind: ColumnKind,
    /// An absent source column yields nulls instead of failing the projection.
    pub optional: bool,
}

const fn column(
    name: &'static str,
    source: &'static str,
    kind: ColumnKind,
) -> ColumnSpec {
    ColumnSpec {
        name,
        source,
        kind,
        optional: false,
    }
}

/// Silver projection in output order.
pub const SILVER_COLUMNS: [ColumnSpec; 15] = [
    column("timestamp", "dt", ColumnKind::Timestamp),
    column("id", "id", ColumnKind::Integer),
    column("country", "sys.country", ColumnKind::Text),
    column("city", "name", ColumnKind::Text),
    column("main_temp", "main.temp", ColumnKind::Float),
    column("temp_min", "main.temp_min", ColumnKind::Float),
    column("temp_max", "main.temp_max", ColumnKind::Float),
    column("cloudiness", "clouds.all", ColumnKind::Integer),
    column("humidity", "main.humidity", ColumnKind::Float),
    column("wind_speed", "wind.speed", ColumnKind::Float),
    ColumnSpec {
        name: "rain",
        source: "rain.1h",
        kind: ColumnKind::Float,
        optional: true,
    },
    column("condition", "main", ColumnKind::Text),
    column("weather_description", "description", ColumnKind::Text),
    column("longitude", "coord.lon", ColumnKind::Float),
    column("latitude", "coord.lat", ColumnKind::Float),
];

pub const TIMESTAMP_COLUMN: usize = 0;
pub const CITY_COLUMN: usize = 3;

pub fn silver_column_names() -> Vec<&'static str> {
    SILVER_COLUMNS.iter().map(|c| c.name).collect()
}

/// Merge key of a permanent row. A null `id` is a key value of its own, so a row without an
/// entity id still lands at most once per timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub timestamp: NaiveDateTime,
    pub id: Option<i32>,
}

/// Typed silver row, the unit handed to the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedRow {
    pub timestamp: Option<NaiveDateTime>,
    pub id: Option<i32>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub main_temp: Option<f64>,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub cloudiness: Option<i32>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub rain: Option<f64>,
    pub condition: Option<String>,
    pub weather_description: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

impl CleanedRow {
    /// `None` without a timestamp; such rows are never merged.
    pub fn key(&self) -> Option<RowKey> {
        Some(RowKey {
            timestamp: self.timestamp?,
            id: self.id,
        })
    }
}
