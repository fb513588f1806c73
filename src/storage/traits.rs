// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::entity::EntityDefinition;
use crate::schema::types::{CellValue, ColumnType};
use crate::schema::{FieldDefinition, FieldEnumValue};
use crate::webhook::{EnqueueOutcome, NewEvent, WebhookEvent, WebhookStatus};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Refusing unsafe SQL identifier '{0}'")]
    InvalidIdentifier(String),
}

/// Last processed position for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub entity_key: String,
    pub cursor_value: String,
    pub updated_at: i64,
}

impl SyncCursor {
    /// Numeric reading of the cursor; unset or unparsable counts as 0.
    pub fn position(&self) -> i64 {
        self.cursor_value.trim().parse().unwrap_or(0)
    }
}

/// One row to write into an entity table. `cells` line up with the column list.
#[derive(Debug, Clone, PartialEq)]
pub struct RowData {
    pub id: i64,
    pub raw_snapshot: String,
    pub cells: Vec<CellValue>,
}

/// A row read back from an entity table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: i64,
    pub raw_snapshot: String,
    pub created_at: i64,
    pub updated_at: i64,
    /// Every other column, by name
    pub cells: BTreeMap<String, CellValue>,
}

/// Entity catalog and field definitions.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upsert_entities(&self, entities: &[EntityDefinition], now_ms: i64) -> Result<(), StorageError>;
    async fn list_entities(&self) -> Result<Vec<EntityDefinition>, StorageError>;
    async fn upsert_fields(&self, fields: &[FieldDefinition], now_ms: i64) -> Result<(), StorageError>;
    /// Stored fields for an entity, in declaration order.
    async fn load_fields(&self, entity_key: &str) -> Result<Vec<FieldDefinition>, StorageError>;
    /// Replace the enumeration options of the given fields.
    async fn replace_field_enums(&self, entity_key: &str, values: &[FieldEnumValue]) -> Result<(), StorageError>;
    async fn load_field_enums(&self, entity_key: &str) -> Result<Vec<FieldEnumValue>, StorageError>;
}

/// Per-entity sync progress plus the catalog refresh stamp.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_cursor(&self, entity_key: &str) -> Result<Option<SyncCursor>, StorageError>;
    async fn set_cursor(&self, entity_key: &str, cursor_value: &str, now_ms: i64) -> Result<(), StorageError>;
    async fn catalog_refreshed_at(&self) -> Result<Option<i64>, StorageError>;
    async fn mark_catalog_refreshed(&self, at_ms: i64) -> Result<(), StorageError>;
}

/// Physical per-entity tables.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the table with its base columns if missing.
    async fn ensure_table(&self, table: &str) -> Result<(), StorageError>;
    async fn existing_columns(&self, table: &str) -> Result<Vec<String>, StorageError>;
    async fn add_column(&self, table: &str, column: &str, column_type: ColumnType) -> Result<(), StorageError>;
    /// Insert-or-update by id, all rows in one transaction. `created_at` is kept on conflict.
    async fn upsert_rows(&self, table: &str, columns: &[String], rows: &[RowData], now_ms: i64) -> Result<usize, StorageError>;
    async fn delete_row(&self, table: &str, id: i64) -> Result<bool, StorageError>;
    async fn max_id(&self, table: &str) -> Result<Option<i64>, StorageError>;
    async fn fetch_row(&self, table: &str, id: i64) -> Result<Option<StoredRow>, StorageError>;
}

/// Durable webhook event queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert, or fold into the pending event for the same record.
    async fn enqueue(&self, event: &NewEvent, now_ms: i64) -> Result<EnqueueOutcome, StorageError>;
    /// Move up to `limit` due events to `processing` and return them.
    async fn claim_due(&self, now_ms: i64, limit: usize) -> Result<Vec<WebhookEvent>, StorageError>;
    async fn mark_done(&self, id: i64, now_ms: i64) -> Result<(), StorageError>;
    async fn mark_retry(&self, id: i64, attempts: u32, error: &str, next_run_at: i64, now_ms: i64) -> Result<(), StorageError>;
    async fn mark_error(&self, id: i64, attempts: u32, error: &str, now_ms: i64) -> Result<(), StorageError>;
    async fn get_event(&self, id: i64) -> Result<Option<WebhookEvent>, StorageError>;
    async fn count_by_status(&self) -> Result<BTreeMap<WebhookStatus, usize>, StorageError>;
    /// Return events stuck in `processing` since before `older_than_ms` to `retry`.
    async fn requeue_stale(&self, older_than_ms: i64, now_ms: i64) -> Result<usize, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_position() {
        let cursor = SyncCursor {
            entity_key: "deal".into(),
            cursor_value: "1200".into(),
            updated_at: 0,
        };
        assert_eq!(cursor.position(), 1200);

        let blank = SyncCursor { cursor_value: String::new(), ..cursor };
        assert_eq!(blank.position(), 0);
    }
}
