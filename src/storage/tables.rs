// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-entity mirror tables.
//!
//! Every table starts with the base columns
//!
//! ```sql
//! CREATE TABLE crm_deal (
//!   id BIGINT PRIMARY KEY,   -- remote record id
//!   raw_snapshot LONGTEXT,   -- full record as received
//!   created_at BIGINT,       -- first insert (epoch ms)
//!   updated_at BIGINT        -- last write (epoch ms)
//! )
//! ```
//!
//! and grows one column per mapped remote field. Columns are only ever
//! added; a field disappearing upstream leaves its column in place.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, Row};
use tracing::{debug, info, warn};

use super::sql::{backend, int_at, text_at, Dialect, SqlStore};
use super::traits::{RecordStore, RowData, StorageError, StoredRow};
use crate::entity::EntityDefinition;
use crate::schema::naming::is_safe_ident;
use crate::schema::types::{CellValue, ColumnType};
use crate::schema::FieldDefinition;

/// Bind parameter ceiling per statement (SQLite allows 32766, MySQL 65535).
const MAX_PARAMS_PER_STATEMENT: usize = 30_000;
const MAX_ROWS_PER_STATEMENT: usize = 500;

const BASE_COLUMNS: [&str; 4] = ["id", "raw_snapshot", "created_at", "updated_at"];

fn checked(ident: &str) -> Result<&str, StorageError> {
    if is_safe_ident(ident) {
        Ok(ident)
    } else {
        Err(StorageError::InvalidIdentifier(ident.to_string()))
    }
}

fn bind_cell<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    cell: &'q CellValue,
) -> Query<'q, Any, AnyArguments<'q>> {
    match cell {
        CellValue::Null => query.bind(None::<String>),
        CellValue::Int(v) => query.bind(*v),
        CellValue::Float(v) => query.bind(*v),
        CellValue::Bool(v) => query.bind(*v),
        CellValue::Text(v) => query.bind(v.as_str()),
    }
}

/// Best-effort decode of an arbitrary column.
fn cell_at(row: &AnyRow, column: &str) -> CellValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(column) {
        return v.map_or(CellValue::Null, CellValue::Int);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(column) {
        return v.map_or(CellValue::Null, CellValue::Float);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(column) {
        return v.map_or(CellValue::Null, CellValue::Bool);
    }
    text_at(row, column).map_or(CellValue::Null, CellValue::Text)
}

impl SqlStore {
    fn rows_per_statement(column_count: usize) -> usize {
        let params_per_row = BASE_COLUMNS.len() + column_count;
        (MAX_PARAMS_PER_STATEMENT / params_per_row).clamp(1, MAX_ROWS_PER_STATEMENT)
    }

    fn upsert_sql(&self, table: &str, columns: &[String], row_count: usize) -> String {
        let d = self.dialect();
        let all: Vec<String> = BASE_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(columns.iter().cloned())
            .collect();

        let column_list = all.iter().map(|c| d.quote(c)).collect::<Vec<_>>().join(", ");
        let row_placeholder = format!("({})", vec!["?"; all.len()].join(", "));
        let values = vec![row_placeholder.as_str(); row_count].join(", ");

        // created_at is first-insert only
        let assignments = all
            .iter()
            .filter(|c| c.as_str() != "id" && c.as_str() != "created_at")
            .map(|c| d.upsert_assign(c))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "INSERT INTO {} ({}) VALUES {} {} {}",
            d.quote(table),
            column_list,
            values,
            d.upsert_clause(&["id"]),
            assignments
        )
    }
}

#[async_trait]
impl RecordStore for SqlStore {
    async fn ensure_table(&self, table: &str) -> Result<(), StorageError> {
        let table = checked(table)?;
        let snapshot_type = ColumnType::Json.sql_type(self.dialect());
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id BIGINT PRIMARY KEY, raw_snapshot {}, \
             created_at BIGINT NOT NULL, updated_at BIGINT NOT NULL)",
            self.dialect().quote(table),
            snapshot_type
        );
        sqlx::query(&sql).execute(self.pool()).await.map_err(backend)?;
        Ok(())
    }

    async fn existing_columns(&self, table: &str) -> Result<Vec<String>, StorageError> {
        let table = checked(table)?;
        let sql = match self.dialect() {
            Dialect::Sqlite => "SELECT name FROM pragma_table_info(?) ORDER BY cid",
            Dialect::MySql => {
                "SELECT COLUMN_NAME AS name FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION"
            }
        };
        let rows = sqlx::query(sql)
            .bind(table)
            .fetch_all(self.pool())
            .await
            .map_err(backend)?;
        Ok(rows.iter().filter_map(|row| text_at(row, "name")).collect())
    }

    async fn add_column(&self, table: &str, column: &str, column_type: ColumnType) -> Result<(), StorageError> {
        let table = checked(table)?;
        let column = checked(column)?;
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.dialect().quote(table),
            self.dialect().quote(column),
            column_type.sql_type(self.dialect())
        );
        match sqlx::query(&sql).execute(self.pool()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Lost a race with another writer adding the same column
                if self.existing_columns(table).await?.iter().any(|c| c == column) {
                    debug!(table, column, "Column already present");
                    Ok(())
                } else {
                    Err(backend(e))
                }
            }
        }
    }

    async fn upsert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[RowData],
        now_ms: i64,
    ) -> Result<usize, StorageError> {
        let table = checked(table)?;
        for column in columns {
            checked(column)?;
        }
        if let Some(bad) = rows.iter().find(|r| r.cells.len() != columns.len()) {
            return Err(StorageError::Backend(format!(
                "row {} has {} cells for {} columns",
                bad.id,
                bad.cells.len(),
                columns.len()
            )));
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let chunk_size = Self::rows_per_statement(columns.len());
        let mut tx = self.pool().begin().await.map_err(backend)?;

        for chunk in rows.chunks(chunk_size) {
            let sql = self.upsert_sql(table, columns, chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                query = query
                    .bind(row.id)
                    .bind(row.raw_snapshot.as_str())
                    .bind(now_ms)
                    .bind(now_ms);
                for cell in &row.cells {
                    query = bind_cell(query, cell);
                }
            }
            query.execute(&mut *tx).await.map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        debug!(table, rows = rows.len(), "Rows upserted");
        Ok(rows.len())
    }

    async fn delete_row(&self, table: &str, id: i64) -> Result<bool, StorageError> {
        let table = checked(table)?;
        let sql = format!("DELETE FROM {} WHERE id = ?", self.dialect().quote(table));
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn max_id(&self, table: &str) -> Result<Option<i64>, StorageError> {
        let table = checked(table)?;
        let sql = format!("SELECT MAX(id) AS max_id FROM {}", self.dialect().quote(table));
        let row = sqlx::query(&sql)
            .fetch_one(self.pool())
            .await
            .map_err(backend)?;
        Ok(int_at(&row, "max_id"))
    }

    async fn fetch_row(&self, table: &str, id: i64) -> Result<Option<StoredRow>, StorageError> {
        let table = checked(table)?;
        // Explicit column list: a cached `SELECT *` goes stale after ALTER TABLE
        let columns = self.existing_columns(table).await?;
        if columns.is_empty() {
            return Ok(None);
        }
        let column_list = columns
            .iter()
            .map(|c| checked(c).map(|c| self.dialect().quote(c)))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        let sql = format!("SELECT {} FROM {} WHERE id = ?", column_list, self.dialect().quote(table));
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?;

        Ok(row.map(|row| {
            let cells: BTreeMap<String, CellValue> = columns
                .iter()
                .filter(|name| !BASE_COLUMNS.contains(&name.as_str()))
                .map(|name| (name.clone(), cell_at(&row, name)))
                .collect();
            StoredRow {
                id: int_at(&row, "id").unwrap_or(id),
                raw_snapshot: text_at(&row, "raw_snapshot").unwrap_or_default(),
                created_at: int_at(&row, "created_at").unwrap_or(0),
                updated_at: int_at(&row, "updated_at").unwrap_or(0),
                cells,
            }
        }))
    }
}

/// Entity-level operations over a [`RecordStore`].
#[derive(Clone)]
pub struct TableManager {
    store: Arc<dyn RecordStore>,
}

impl TableManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Create the entity table if needed and add any missing field columns.
    ///
    /// Returns the number of columns added. Never drops or alters a column.
    #[tracing::instrument(skip(self, entity, fields), fields(entity = %entity.entity_key))]
    pub async fn ensure_columns(
        &self,
        entity: &EntityDefinition,
        fields: &[FieldDefinition],
    ) -> Result<usize, StorageError> {
        let table = entity.table_name();
        self.store.ensure_table(&table).await?;

        let existing: HashSet<String> = self.store.existing_columns(&table).await?.into_iter().collect();
        let mut added = 0;
        for field in fields {
            if existing.contains(&field.local_column_name) {
                continue;
            }
            let column_type = field.shape().column_type();
            self.store
                .add_column(&table, &field.local_column_name, column_type)
                .await
                .inspect_err(|e| {
                    warn!(table = %table, column = %field.local_column_name, error = %e, "Failed to add column")
                })?;
            added += 1;
        }

        if added > 0 {
            info!(table = %table, added, "Added mirror columns");
            crate::metrics::record_columns_added(&entity.entity_key, added);
        }
        Ok(added)
    }

    pub async fn upsert(
        &self,
        entity: &EntityDefinition,
        columns: &[String],
        rows: &[RowData],
        now_ms: i64,
    ) -> Result<usize, StorageError> {
        self.store.upsert_rows(&entity.table_name(), columns, rows, now_ms).await
    }

    /// Delete one row. A table that was never created has nothing to delete.
    pub async fn delete(&self, entity: &EntityDefinition, id: i64) -> Result<bool, StorageError> {
        let table = entity.table_name();
        self.store.ensure_table(&table).await?;
        let deleted = self.store.delete_row(&table, id).await?;
        if deleted {
            crate::metrics::record_rows_deleted(&entity.entity_key, 1);
        }
        Ok(deleted)
    }

    pub async fn max_id(&self, entity: &EntityDefinition) -> Result<Option<i64>, StorageError> {
        self.store.max_id(&entity.table_name()).await
    }

    pub async fn fetch(&self, entity: &EntityDefinition, id: i64) -> Result<Option<StoredRow>, StorageError> {
        self.store.fetch_row(&entity.table_name(), id).await
    }
}
