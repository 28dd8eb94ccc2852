//! Silver projection: typed columns, null-timestamp filtering and a stable sort by city.

use std::io::Cursor;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int32Type, TimestampSecondType};
use arrow_array::{new_null_array, Array, ArrayRef, BooleanArray, RecordBatch, UInt32Array};
use arrow_cast::cast::cast;
use arrow_csv::reader::Format;
use arrow_csv::{ReaderBuilder, WriterBuilder};
use arrow_ord::sort::{lexsort_to_indices, SortColumn};
use arrow_schema::{ArrowError, DataType, Field, Schema, SchemaRef, SortOptions, TimeUnit};
use arrow_select::concat::concat_batches;
use arrow_select::filter::filter_record_batch;
use arrow_select::take::take_record_batch;
use chrono::{DateTime, NaiveDateTime};
use thiserror::Error;
use wxp_core::{CleanedRow, ColumnKind, CITY_COLUMN, SILVER_COLUMNS, TIMESTAMP_COLUMN};

/// Timestamp rendering shared by the silver artifact and the warehouse bulk load.
pub const SILVER_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("bronze part {part} has no `{column}` column")]
    MissingColumn { part: String, column: &'static str },
    #[error("silver column `{0}` has an unexpected type")]
    ColumnType(&'static str),
    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

fn arrow_type(kind: ColumnKind) -> DataType {
    match kind {
        ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Second, None),
        ColumnKind::Integer => DataType::Int32,
        ColumnKind::Float => DataType::Float64,
        ColumnKind::Text => DataType::Utf8,
    }
}

pub fn silver_schema() -> SchemaRef {
    Arc::new(Schema::new(
        SILVER_COLUMNS
            .iter()
            .map(|c| Field::new(c.name, arrow_type(c.kind), true))
            .collect::<Vec<_>>(),
    ))
}

/// Reads one bronze CSV part with inferred column types. Empty and header-only parts yield no
/// batches.
pub fn read_bronze_part(bytes: &[u8]) -> Result<Vec<RecordBatch>, TransformError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let (inferred, records) = Format::default()
        .with_header(true)
        .infer_schema(Cursor::new(bytes), None)?;
    if records == 0 {
        return Ok(Vec::new());
    }
    // All-empty columns infer as Null, which nothing downstream can cast from.
    let fields = inferred
        .fields()
        .iter()
        .map(|f| match f.data_type() {
            DataType::Null => Field::new(f.name(), DataType::Utf8, true),
            _ => f.as_ref().clone(),
        })
        .collect::<Vec<_>>();
    let reader = ReaderBuilder::new(Arc::new(Schema::new(fields)))
        .with_header(true)
        .build(Cursor::new(bytes))?;
    Ok(reader.collect::<Result<Vec<_>, _>>()?)
}

/// Selects, renames and casts the silver columns. Values that fail to cast become null.
pub fn project(batch: &RecordBatch, part: &str) -> Result<RecordBatch, TransformError> {
    let schema = silver_schema();
    let source = batch.schema();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(SILVER_COLUMNS.len());
    for (wanted, field) in SILVER_COLUMNS.iter().zip(schema.fields().iter()) {
        let column = match source.index_of(wanted.source) {
            Ok(idx) => cast(batch.column(idx).as_ref(), field.data_type())?,
            Err(_) if wanted.optional => new_null_array(field.data_type(), batch.num_rows()),
            Err(_) => {
                return Err(TransformError::MissingColumn {
                    part: part.to_string(),
                    column: wanted.source,
                })
            }
        };
        columns.push(column);
    }
    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Drops rows without a timestamp, then stable-sorts by city with nulls first.
pub fn clean(batches: &[RecordBatch]) -> Result<RecordBatch, TransformError> {
    let combined = concat_batches(&silver_schema(), batches)?;
    let timestamps = combined.column(TIMESTAMP_COLUMN);
    let keep = BooleanArray::from(
        (0..combined.num_rows())
            .map(|i| timestamps.is_valid(i))
            .collect::<Vec<_>>(),
    );
    let filtered = filter_record_batch(&combined, &keep)?;
    if filtered.num_rows() < 2 {
        return Ok(filtered);
    }

    // Original position as the last key keeps equal cities in input order.
    let positions: ArrayRef = Arc::new(UInt32Array::from_iter_values(
        (0..filtered.num_rows()).map(|i| i as u32),
    ));
    let indices = lexsort_to_indices(
        &[
            SortColumn {
                values: Arc::clone(filtered.column(CITY_COLUMN)),
                options: Some(SortOptions {
                    descending: false,
                    nulls_first: true,
                }),
            },
            SortColumn {
                values: positions,
                options: None,
            },
        ],
        None,
    )?;
    Ok(take_record_batch(&filtered, &indices)?)
}

/// Bronze parts in, cleaned silver batch out.
pub fn transform_parts(parts: &[(String, Vec<u8>)]) -> Result<RecordBatch, TransformError> {
    let mut projected = Vec::new();
    for (name, bytes) in parts {
        for batch in read_bronze_part(bytes)? {
            projected.push(project(&batch, name)?);
        }
    }
    clean(&projected)
}

/// Silver CSV with header, written even when there are no rows.
pub fn to_csv(batch: &RecordBatch) -> Result<Vec<u8>, TransformError> {
    let mut writer = WriterBuilder::new()
        .with_header(true)
        .with_timestamp_format(SILVER_TIMESTAMP_FORMAT.to_string())
        .build(Vec::new());
    writer.write(batch)?;
    Ok(writer.into_inner())
}

fn text_column<'a>(
    batch: &'a RecordBatch,
    idx: usize,
) -> Result<&'a arrow_array::StringArray, TransformError> {
    batch
        .column(idx)
        .as_string_opt::<i32>()
        .ok_or(TransformError::ColumnType(SILVER_COLUMNS[idx].name))
}

fn float_column<'a>(
    batch: &'a RecordBatch,
    idx: usize,
) -> Result<&'a arrow_array::Float64Array, TransformError> {
    batch
        .column(idx)
        .as_primitive_opt::<Float64Type>()
        .ok_or(TransformError::ColumnType(SILVER_COLUMNS[idx].name))
}

fn int_column<'a>(
    batch: &'a RecordBatch,
    idx: usize,
) -> Result<&'a arrow_array::Int32Array, TransformError> {
    batch
        .column(idx)
        .as_primitive_opt::<Int32Type>()
        .ok_or(TransformError::ColumnType(SILVER_COLUMNS[idx].name))
}

/// Converts a silver batch into typed rows for the relational store.
pub fn cleaned_rows(batch: &RecordBatch) -> Result<Vec<CleanedRow>, TransformError> {
    if batch.num_columns() != SILVER_COLUMNS.len() {
        return Err(TransformError::Arrow(ArrowError::SchemaError(format!(
            "expected {} silver columns, found {}",
            SILVER_COLUMNS.len(),
            batch.num_columns()
        ))));
    }
    let timestamp = batch
        .column(TIMESTAMP_COLUMN)
        .as_primitive_opt::<TimestampSecondType>()
        .ok_or(TransformError::ColumnType(SILVER_COLUMNS[TIMESTAMP_COLUMN].name))?;
    let id = int_column(batch, 1)?;
    let country = text_column(batch, 2)?;
    let city = text_column(batch, CITY_COLUMN)?;
    let main_temp = float_column(batch, 4)?;
    let temp_min = float_column(batch, 5)?;
    let temp_max = float_column(batch, 6)?;
    let cloudiness = int_column(batch, 7)?;
    let humidity = float_column(batch, 8)?;
    let wind_speed = float_column(batch, 9)?;
    let rain = float_column(batch, 10)?;
    let condition = text_column(batch, 11)?;
    let description = text_column(batch, 12)?;
    let longitude = float_column(batch, 13)?;
    let latitude = float_column(batch, 14)?;

    let text = |a: &arrow_array::StringArray, i: usize| a.is_valid(i).then(|| a.value(i).to_string());
    let float = |a: &arrow_array::Float64Array, i: usize| a.is_valid(i).then(|| a.value(i));
    let int = |a: &arrow_array::Int32Array, i: usize| a.is_valid(i).then(|| a.value(i));

    Ok((0..batch.num_rows())
        .map(|i| CleanedRow {
            timestamp: timestamp
                .is_valid(i)
                .then(|| timestamp_from_secs(timestamp.value(i)))
                .flatten(),
            id: int(id, i),
            country: text(country, i),
            city: text(city, i),
            main_temp: float(main_temp, i),
            temp_min: float(temp_min, i),
            temp_max: float(temp_max, i),
            cloudiness: int(cloudiness, i),
            humidity: float(humidity, i),
            wind_speed: float(wind_speed, i),
            rain: float(rain, i),
            condition: text(condition, i),
            weather_description: text(description, i),
            longitude: float(longitude, i),
            latitude: float(latitude, i),
        })
        .collect())
}

fn timestamp_from_secs(secs: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0).map(|d| d.naive_utc())
}

/// Parses a silver CSV artifact back into typed rows.
pub fn parse_silver_csv(bytes: &[u8]) -> Result<Vec<CleanedRow>, TransformError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let reader = ReaderBuilder::new(silver_schema())
        .with_header(true)
        .build(Cursor::new(bytes))?;
    let mut rows = Vec::new();
    for batch in reader {
        rows.extend(cleaned_rows(&batch?)?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use chrono::Utc;
    use serde_json::{json, Value as JsonValue};
    use wxp_core::{silver_column_names, Observation};

    const DT: i64 = 1_727_953_200;

    fn city(name: &str, id: i64, weather: JsonValue) -> JsonValue {
        json!({
            "coord": {"lon": 2.3488, "lat": 48.8534},
            "weather": weather,
            "main": {"temp": 15.0, "temp_min": 13.2, "temp_max": 16.1, "humidity": 71},
            "wind": {"speed": 4.1},
            "clouds": {"all": 75},
            "dt": DT,
            "sys": {"country": "XX"},
            "id": id,
            "name": name
        })
    }

    fn clear() -> JsonValue {
        json!([{"id": 800, "main": "Clear", "description": "clear sky"}])
    }

    fn bronze(documents: Vec<JsonValue>) -> Vec<u8> {
        let observations: Vec<Observation> = documents
            .into_iter()
            .map(|d| Observation::new("test", Utc::now(), d))
            .collect();
        normalize(&observations)
            .expect("normalize")
            .to_csv()
            .expect("bronze csv")
    }

    fn part(name: &str, bytes: Vec<u8>) -> (String, Vec<u8>) {
        (name.to_string(), bytes)
    }

    fn cities(batch: &RecordBatch) -> Vec<Option<String>> {
        cleaned_rows(batch)
            .expect("rows")
            .into_iter()
            .map(|r| r.city)
            .collect()
    }

    #[test]
    fn projection_has_exact_columns_and_types() {
        let batch = transform_parts(&[part(
            "part-00000.csv",
            bronze(vec![city("Paris", 2_988_507, clear())]),
        )])
        .expect("transform");

        let names: Vec<String> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, silver_column_names());
        assert_eq!(batch.schema(), silver_schema());

        let rows = cleaned_rows(&batch).expect("rows");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.timestamp, timestamp_from_secs(DT));
        assert_eq!(row.id, Some(2_988_507));
        assert_eq!(row.city.as_deref(), Some("Paris"));
        assert_eq!(row.country.as_deref(), Some("XX"));
        assert_eq!(row.main_temp, Some(15.0));
        assert_eq!(row.humidity, Some(71.0));
        assert_eq!(row.cloudiness, Some(75));
        assert_eq!(row.condition.as_deref(), Some("Clear"));
        assert_eq!(row.weather_description.as_deref(), Some("clear sky"));
        assert_eq!(row.rain, None);
    }

    #[test]
    fn rain_is_kept_when_present() {
        let mut wet = city("Paris", 2_988_507, clear());
        wet["rain"] = json!({"1h": 0.5});
        let dry = city("Oslo", 3_143_244, clear());
        let batch = transform_parts(&[part("p.csv", bronze(vec![wet, dry]))]).expect("transform");
        let rows = cleaned_rows(&batch).expect("rows");
        assert_eq!(rows[0].city.as_deref(), Some("Oslo"));
        assert_eq!(rows[0].rain, None);
        assert_eq!(rows[1].rain, Some(0.5));
    }

    #[test]
    fn rows_without_timestamp_are_dropped() {
        let mut undated = city("Berlin", 2_950_159, clear());
        undated["dt"] = JsonValue::Null;
        let batch = transform_parts(&[part(
            "p.csv",
            bronze(vec![undated, city("Paris", 2_988_507, clear())]),
        )])
        .expect("transform");
        assert_eq!(cities(&batch), vec![Some("Paris".to_string())]);
    }

    #[test]
    fn sort_by_city_is_stable() {
        let paris = city(
            "Paris",
            2_988_507,
            json!([
                {"id": 500, "main": "Rain", "description": "light rain"},
                {"id": 701, "main": "Mist", "description": "mist"}
            ]),
        );
        let mut nameless = city("x", 1, clear());
        nameless["name"] = JsonValue::Null;
        let batch = transform_parts(&[part(
            "p.csv",
            bronze(vec![
                nameless,
                city("Tokyo", 1_850_147, clear()),
                paris,
                city("Lima", 3_936_456, clear()),
            ]),
        )])
        .expect("transform");

        let rows = cleaned_rows(&batch).expect("rows");
        let order: Vec<(Option<&str>, Option<&str>)> = rows
            .iter()
            .map(|r| (r.city.as_deref(), r.weather_description.as_deref()))
            .collect();
        assert_eq!(
            order,
            vec![
                (None, Some("clear sky")),
                (Some("Lima"), Some("clear sky")),
                (Some("Paris"), Some("light rain")),
                (Some("Paris"), Some("mist")),
                (Some("Tokyo"), Some("clear sky")),
            ]
        );
    }

    #[test]
    fn parts_are_concatenated_and_empty_parts_skipped() {
        let batch = transform_parts(&[
            part("a.csv", bronze(vec![city("Tokyo", 1_850_147, clear())])),
            part("b.csv", Vec::new()),
            part("c.csv", bronze(vec![city("Lima", 3_936_456, clear())])),
        ])
        .expect("transform");
        assert_eq!(
            cities(&batch),
            vec![Some("Lima".to_string()), Some("Tokyo".to_string())]
        );
    }

    #[test]
    fn missing_required_column_fails() {
        let err = transform_parts(&[part("odd.csv", b"name,id\nParis,1\n".to_vec())])
            .expect_err("dt is required");
        assert!(matches!(
            err,
            TransformError::MissingColumn { column: "dt", ref part } if part == "odd.csv"
        ));
    }

    #[test]
    fn empty_input_yields_header_only_silver() {
        let batch = transform_parts(&[]).expect("transform");
        assert_eq!(batch.num_rows(), 0);
        let csv = String::from_utf8(to_csv(&batch).expect("csv")).expect("utf8");
        assert_eq!(csv.trim_end(), silver_column_names().join(","));
        assert!(parse_silver_csv(csv.as_bytes()).expect("parse").is_empty());
    }

    #[test]
    fn silver_csv_is_readable_by_the_loader() {
        let batch = transform_parts(&[part(
            "p.csv",
            bronze(vec![city("Paris", 2_988_507, clear())]),
        )])
        .expect("transform");
        let csv = to_csv(&batch).expect("csv");
        let text = String::from_utf8(csv.clone()).expect("utf8");
        assert!(text.lines().nth(1).expect("data line").starts_with("2024-10-03 11:00:00,2988507,"));

        let parsed = parse_silver_csv(&csv).expect("parse");
        assert_eq!(parsed, cleaned_rows(&batch).expect("rows"));
    }
}
