//! Bronze flattening: one row per (entity, condition descriptor).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use serde_json::Value as JsonValue;
use wxp_core::{Observation, DESCRIPTOR_FIELD, DESCRIPTOR_ID_COLUMN, IDENTIFIER_FIELD};

/// Flattened key/value pairs of one record, in first-seen order.
pub type FlatRecord = Vec<(String, Option<String>)>;

/// Descriptor columns tagged with the index of the observation they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub parent: usize,
    pub fields: FlatRecord,
}

/// Wide, all-text table written as the bronze artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BronzeTable {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl BronzeTable {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    fn from_records(records: Vec<FlatRecord>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for record in &records {
            for (key, _) in record {
                if !positions.contains_key(key) {
                    positions.insert(key.clone(), columns.len());
                    columns.push(key.clone());
                }
            }
        }
        let rows = records
            .into_iter()
            .map(|record| {
                let mut row = vec![None; columns.len()];
                for (key, value) in record {
                    row[positions[&key]] = value;
                }
                row
            })
            .collect();
        Self { columns, rows }
    }

    pub fn to_record_batch(&self) -> Result<Option<RecordBatch>> {
        if self.columns.is_empty() {
            return Ok(None);
        }
        let schema = Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|c| ArrowField::new(c.as_str(), DataType::Utf8, true))
                .collect::<Vec<_>>(),
        ));
        let arrays = (0..self.columns.len())
            .map(|i| {
                Arc::new(StringArray::from(
                    self.rows
                        .iter()
                        .map(|row| row[i].as_deref())
                        .collect::<Vec<_>>(),
                )) as ArrayRef
            })
            .collect::<Vec<_>>();
        let batch = RecordBatch::try_new(schema, arrays).context("building bronze record batch")?;
        Ok(Some(batch))
    }

    /// CSV with header; an empty table serializes to zero bytes.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let Some(batch) = self.to_record_batch()? else {
            return Ok(Vec::new());
        };
        let mut writer = arrow_csv::WriterBuilder::new()
            .with_header(true)
            .build(Vec::new());
        writer.write(&batch).context("writing bronze csv")?;
        Ok(writer.into_inner())
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(_) | JsonValue::Object(_) => Some(value.to_string()),
    }
}

fn flatten_into(prefix: &str, value: &JsonValue, out: &mut FlatRecord) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(&path, child, out);
            }
        }
        other => out.push((prefix.to_string(), scalar_text(other))),
    }
}

/// Flattens nested objects to dot-separated columns, leaving out the descriptor list.
pub fn flatten_scalars(document: &JsonValue) -> FlatRecord {
    let mut out = Vec::new();
    match document {
        JsonValue::Object(map) => {
            for (key, value) in map.iter().filter(|(k, _)| k.as_str() != DESCRIPTOR_FIELD) {
                flatten_into(key, value, &mut out);
            }
        }
        other => out.push(("value".to_string(), scalar_text(other))),
    }
    out
}

/// One entry per descriptor, remembering which observation it belongs to.
pub fn explode_descriptors(documents: &[&JsonValue]) -> Vec<Descriptor> {
    documents
        .iter()
        .enumerate()
        .flat_map(|(parent, doc)| {
            doc.get(DESCRIPTOR_FIELD)
                .and_then(JsonValue::as_array)
                .map(|items| items.as_slice())
                .unwrap_or_default()
                .iter()
                .map(move |item| {
                    let mut fields = Vec::new();
                    match item {
                        JsonValue::Object(_) => flatten_into("", item, &mut fields),
                        other => fields.push((DESCRIPTOR_FIELD.to_string(), scalar_text(other))),
                    }
                    Descriptor { parent, fields }
                })
        })
        .collect()
}

/// Descriptor `id` becomes `weather_id` so it cannot collide with the observation `id`.
pub fn rename_descriptor_id(mut descriptor: Descriptor) -> Descriptor {
    for (key, _) in descriptor.fields.iter_mut() {
        if key == IDENTIFIER_FIELD {
            *key = DESCRIPTOR_ID_COLUMN.to_string();
        }
    }
    descriptor
}

/// Joins descriptor columns onto their parent's scalar columns. Observations without
/// descriptors produce no rows.
pub fn concat_columns(scalars: &[FlatRecord], descriptors: Vec<Descriptor>) -> Result<BronzeTable> {
    let mut records = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let Some(parent) = scalars.get(descriptor.parent) else {
            bail!(
                "descriptor refers to observation {} but only {} were flattened",
                descriptor.parent,
                scalars.len()
            );
        };
        if let Some((key, _)) = descriptor
            .fields
            .iter()
            .find(|(key, _)| parent.iter().any(|(k, _)| k == key))
        {
            bail!("descriptor column `{key}` collides with an observation column");
        }
        let mut record = parent.clone();
        record.extend(descriptor.fields);
        records.push(record);
    }
    Ok(BronzeTable::from_records(records))
}

pub fn normalize(observations: &[Observation]) -> Result<BronzeTable> {
    let documents: Vec<&JsonValue> = observations.iter().map(|o| &o.document).collect();
    let scalars: Vec<FlatRecord> = documents.iter().map(|d| flatten_scalars(d)).collect();
    let descriptors = explode_descriptors(&documents)
        .into_iter()
        .map(rename_descriptor_id)
        .collect();
    concat_columns(&scalars, descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn observation(document: JsonValue) -> Observation {
        Observation::new("test", Utc::now(), document)
    }

    fn paris(weather: JsonValue) -> JsonValue {
        json!({
            "coord": {"lon": 2.3488, "lat": 48.8534},
            "weather": weather,
            "main": {"temp": 15.0, "temp_min": 13.2, "temp_max": 16.1, "humidity": 71},
            "wind": {"speed": 4.1},
            "clouds": {"all": 75},
            "dt": 1_727_953_200,
            "sys": {"country": "FR"},
            "id": 2_988_507,
            "name": "Paris"
        })
    }

    #[test]
    fn empty_input_yields_empty_table() {
        let table = normalize(&[]).expect("normalize");
        assert_eq!(table.num_rows(), 0);
        assert!(table.columns().is_empty());
        assert!(table.to_csv().expect("csv").is_empty());
    }

    #[test]
    fn k_descriptors_yield_k_rows_sharing_scalars() {
        let doc = paris(json!([
            {"id": 500, "main": "Rain", "description": "light rain", "icon": "10d"},
            {"id": 701, "main": "Mist", "description": "mist", "icon": "50d"},
            {"id": 741, "main": "Fog", "description": "fog", "icon": "50d"}
        ]));
        let table = normalize(&[observation(doc)]).expect("normalize");

        assert_eq!(table.num_rows(), 3);
        for row in 0..3 {
            assert_eq!(table.value(row, "id"), Some("2988507"));
            assert_eq!(table.value(row, "name"), Some("Paris"));
            assert_eq!(table.value(row, "main.temp"), Some("15.0"));
        }
        assert_eq!(table.value(0, "weather_id"), Some("500"));
        assert_eq!(table.value(2, "weather_id"), Some("741"));
        assert_eq!(table.value(1, "main"), Some("Mist"));
        assert_eq!(
            table.columns().iter().filter(|c| c.as_str() == "id").count(),
            1
        );
        assert!(!table.columns().iter().any(|c| c == "weather"));
    }

    #[test]
    fn zero_descriptors_contribute_no_rows() {
        let with = paris(json!([{"id": 800, "main": "Clear", "description": "clear sky"}]));
        let without = paris(json!([]));
        let missing = json!({"id": 1, "name": "Nowhere"});
        let table = normalize(&[observation(without), observation(with), observation(missing)])
            .expect("normalize");
        assert_eq!(table.num_rows(), 1);
        assert_eq!(table.value(0, "weather_id"), Some("800"));
    }

    #[test]
    fn rows_stay_aligned_with_their_parent() {
        let mut tokyo = paris(json!([{"id": 801, "main": "Clouds", "description": "few clouds"}]));
        tokyo["id"] = json!(1_850_147);
        tokyo["name"] = json!("Tokyo");
        let paris = paris(json!([
            {"id": 500, "main": "Rain", "description": "light rain"},
            {"id": 701, "main": "Mist", "description": "mist"}
        ]));
        let table = normalize(&[observation(paris), observation(tokyo)]).expect("normalize");

        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.value(1, "name"), Some("Paris"));
        assert_eq!(table.value(1, "weather_id"), Some("701"));
        assert_eq!(table.value(2, "name"), Some("Tokyo"));
        assert_eq!(table.value(2, "weather_id"), Some("801"));
    }

    #[test]
    fn rename_happens_before_concat() {
        let documents = [&json!({"id": 1, "weather": [{"id": 2}]})];
        let scalars: Vec<FlatRecord> = documents.iter().map(|d| flatten_scalars(d)).collect();

        let raw = explode_descriptors(&documents);
        let err = concat_columns(&scalars, raw.clone()).expect_err("unrenamed id collides");
        assert!(err.to_string().contains("`id`"));

        let renamed = raw.into_iter().map(rename_descriptor_id).collect();
        let table = concat_columns(&scalars, renamed).expect("renamed joins");
        assert_eq!(table.value(0, "id"), Some("1"));
        assert_eq!(table.value(0, "weather_id"), Some("2"));
    }

    #[test]
    fn optional_columns_are_null_where_absent() {
        let mut wet = paris(json!([{"id": 500, "main": "Rain", "description": "light rain"}]));
        wet["rain"] = json!({"1h": 0.25});
        let dry = paris(json!([{"id": 800, "main": "Clear", "description": "clear sky"}]));
        let table = normalize(&[observation(dry), observation(wet)]).expect("normalize");

        assert_eq!(table.value(0, "rain.1h"), None);
        assert_eq!(table.value(1, "rain.1h"), Some("0.25"));
    }

    #[test]
    fn csv_has_header_and_one_line_per_row() {
        let doc = paris(json!([{"id": 800, "main": "Clear", "description": "clear sky"}]));
        let csv = normalize(&[observation(doc)])
            .expect("normalize")
            .to_csv()
            .expect("csv");
        let text = String::from_utf8(csv).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].split(',').any(|c| c == "sys.country"));
        assert!(lines[0].split(',').any(|c| c == "weather_id"));
        assert!(lines[1].contains("Paris"));
    }
}
