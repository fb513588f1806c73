// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote record → table row.
//!
//! Mapping is tolerant: a field whose value cannot be coerced to its
//! column type is stored as NULL and the record is kept. Records without
//! a usable id are skipped.

use serde_json::Value;
use tracing::debug;

use crate::entity::record_id;
use crate::schema::types::{coerce, CellValue, CoerceError};
use crate::schema::{EntityMapping, FieldDefinition};
use crate::storage::RowData;

/// Rows produced from one page of records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedBatch {
    pub rows: Vec<RowData>,
    /// Records dropped for lacking an id
    pub skipped: usize,
    /// Field values stored as NULL because they failed to coerce
    pub failures: usize,
    pub max_id: Option<i64>,
}

/// Find a field's value, trying the exact name, a nested `fields` object,
/// then upper- and lower-case spellings.
pub fn lookup<'a>(record: &'a Value, remote_name: &str) -> Option<&'a Value> {
    let nested = record.get("fields");
    let upper = remote_name.to_uppercase();
    let lower = remote_name.to_lowercase();

    record
        .get(remote_name)
        .or_else(|| nested.and_then(|f| f.get(remote_name)))
        .or_else(|| record.get(&upper))
        .or_else(|| record.get(&lower))
        .or_else(|| nested.and_then(|f| f.get(&upper)))
        .or_else(|| nested.and_then(|f| f.get(&lower)))
}

/// Coerce one field. A missing field is NULL, not a failure.
fn map_field(field: &FieldDefinition, record: &Value) -> Result<CellValue, CoerceError> {
    match lookup(record, &field.remote_field_name) {
        Some(value) => coerce(value, field.shape()),
        None => Ok(CellValue::Null),
    }
}

/// Map one record. Returns the row and the number of failed fields.
pub fn map_record(mapping: &EntityMapping, record: &Value) -> Option<(RowData, usize)> {
    let id = record_id(record).filter(|id| *id > 0)?;
    let entity_key = &mapping.entity.entity_key;

    let mut failures = 0;
    let cells = mapping
        .fields
        .iter()
        .map(|field| {
            map_field(field, record).unwrap_or_else(|e| {
                debug!(
                    entity = %entity_key,
                    id,
                    field = %field.remote_field_name,
                    error = %e,
                    "Field value stored as NULL"
                );
                crate::metrics::record_mapping_failure(entity_key);
                failures += 1;
                CellValue::Null
            })
        })
        .collect();

    Some((
        RowData {
            id,
            raw_snapshot: record.to_string(),
            cells,
        },
        failures,
    ))
}

pub fn map_records(mapping: &EntityMapping, records: &[Value]) -> MappedBatch {
    let mut batch = MappedBatch::default();
    for record in records {
        match map_record(mapping, record) {
            Some((row, failures)) => {
                batch.failures += failures;
                batch.max_id = batch.max_id.max(Some(row.id));
                batch.rows.push(row);
            }
            None => batch.skipped += 1,
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityDefinition;
    use serde_json::json;

    fn field(remote: &str, column: &str, remote_type: &str, multiple: bool) -> FieldDefinition {
        FieldDefinition {
            entity_key: "deal".into(),
            remote_field_name: remote.into(),
            local_column_name: column.into(),
            remote_type: remote_type.into(),
            is_multiple: multiple,
            is_required: false,
            is_readonly: false,
            display_title: column.into(),
            settings: None,
            position: 0,
        }
    }

    fn deal_mapping() -> EntityMapping {
        EntityMapping {
            entity: EntityDefinition::plain("deal", "Deals"),
            fields: vec![
                field("ID", "id_2", "integer", false),
                field("TITLE", "title", "string", false),
                field("OPPORTUNITY", "opportunity", "double", false),
                field("UF_CRM_TAGS", "uf_crm_tags", "string", true),
            ],
        }
    }

    #[test]
    fn test_map_record() {
        let record = json!({"ID": "17", "TITLE": "Big deal", "OPPORTUNITY": "1500,50", "UF_CRM_TAGS": ["a", "b"]});
        let (row, failures) = map_record(&deal_mapping(), &record).unwrap();

        assert_eq!(failures, 0);
        assert_eq!(row.id, 17);
        assert_eq!(row.cells[0], CellValue::Int(17));
        assert_eq!(row.cells[1], CellValue::Text("Big deal".into()));
        assert_eq!(row.cells[2], CellValue::Float(1500.5));
        assert_eq!(row.cells[3], CellValue::Text(r#"["a","b"]"#.into()));
        assert_eq!(serde_json::from_str::<Value>(&row.raw_snapshot).unwrap(), record);
    }

    #[test]
    fn test_bad_field_becomes_null() {
        let record = json!({"ID": 3, "TITLE": "x", "OPPORTUNITY": "lots"});
        let (row, failures) = map_record(&deal_mapping(), &record).unwrap();
        assert_eq!(failures, 1);
        assert_eq!(row.cells[2], CellValue::Null);
        // absent fields are NULL without counting as failures
        assert_eq!(row.cells[3], CellValue::Null);
    }

    #[test]
    fn test_map_field_reports_coerce_error() {
        let amount = field("OPPORTUNITY", "opportunity", "double", false);
        let err = map_field(&amount, &json!({"OPPORTUNITY": "lots"})).unwrap_err();
        assert_eq!(err.expected, "float");
        assert_eq!(err.found, r#""lots""#);

        assert_eq!(map_field(&amount, &json!({})), Ok(CellValue::Null));
    }

    #[test]
    fn test_lookup_variants() {
        let record = json!({"title": "lower", "fields": {"STAGE_ID": "NEW"}});
        assert_eq!(lookup(&record, "TITLE"), Some(&json!("lower")));
        assert_eq!(lookup(&record, "stage_id"), Some(&json!("NEW")));
        assert_eq!(lookup(&record, "MISSING"), None);
    }

    #[test]
    fn test_map_records_skips_records_without_id() {
        let records = vec![json!({"ID": "5"}), json!({"TITLE": "orphan"}), json!({"id": 9}), json!({"ID": "0"})];
        let batch = map_records(&deal_mapping(), &records);
        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.skipped, 2);
        assert_eq!(batch.max_id, Some(9));
    }
}
