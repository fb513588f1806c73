// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend (SQLite or MySQL through the sqlx `Any` driver).
//!
//! Owns the metadata schema:
//!
//! ```sql
//! mirror_entities     (entity_key PK, entity_kind, title, entity_type_id, updated_at)
//! mirror_fields       (entity_key, remote_field, column_name, remote_type, is_multiple,
//!                      is_required, is_readonly, title, settings, position, updated_at)
//! mirror_field_enums  (entity_key, remote_field, value_id, value_title, position)
//! mirror_cursors      (entity_key PK, cursor_value, updated_at)
//! mirror_webhook_events (id, entity_key, entity_id, event_name, payload, status,
//!                      attempts, last_error, received_at, next_run_at, updated_at)
//! ```
//!
//! Per-entity tables live in [`super::tables`], queue operations in
//! [`super::queue`]. All timestamps are epoch milliseconds.
//!
//! ## sqlx Any Driver Quirks
//!
//! JSON is kept in TEXT/LONGTEXT columns, and MySQL hands LONGTEXT/TEXT back
//! as BLOB, so text columns are read with [`text_at`] (String first, then
//! bytes). Booleans in metadata are stored as integers.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{CursorStore, MetadataStore, StorageError, SyncCursor};
use crate::entity::{EntityDefinition, EntityKind};
use crate::resilience::retry::{retry, RetryConfig};
use crate::schema::{FieldDefinition, FieldEnumValue};

/// Cursor row holding the catalog refresh stamp instead of a position.
pub const CATALOG_CURSOR_KEY: &str = "$catalog";

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// SQL flavour of the connected database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MySql,
}

impl Dialect {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("sqlite:") {
            Self::Sqlite
        } else {
            Self::MySql
        }
    }

    /// Quote an identifier that has already been validated.
    pub(crate) fn quote(&self, ident: &str) -> String {
        match self {
            Self::Sqlite => format!("\"{ident}\""),
            Self::MySql => format!("`{ident}`"),
        }
    }

    /// `SET col = <new value>` fragment of an upsert.
    pub(crate) fn upsert_assign(&self, ident: &str) -> String {
        let quoted = self.quote(ident);
        match self {
            Self::Sqlite => format!("{quoted} = excluded.{quoted}"),
            Self::MySql => format!("{quoted} = VALUES({quoted})"),
        }
    }

    /// Conflict clause introducing the assignments.
    pub(crate) fn upsert_clause(&self, key_columns: &[&str]) -> String {
        match self {
            Self::Sqlite => {
                let keys: Vec<String> = key_columns.iter().map(|c| self.quote(c)).collect();
                format!("ON CONFLICT({}) DO UPDATE SET", keys.join(", "))
            }
            Self::MySql => "ON DUPLICATE KEY UPDATE".to_string(),
        }
    }
}

pub(crate) fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Read a text column: String first (SQLite TEXT), then bytes (MySQL LONGTEXT).
pub(crate) fn text_at(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}

pub(crate) fn int_at(row: &AnyRow, column: &str) -> Option<i64> {
    row.try_get::<Option<i64>, _>(column).ok().flatten()
}

pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and create the metadata schema.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let dialect = Dialect::from_url(connection_string);

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if dialect == Dialect::Sqlite { 5 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, dialect };

        if dialect == Dialect::Sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        info!(dialect = ?dialect, "SQL store ready");
        Ok(store)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Enable WAL mode so readers don't block the writer.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    fn schema_statements(&self) -> Vec<&'static str> {
        match self.dialect {
            Dialect::Sqlite => vec![
                r#"
                CREATE TABLE IF NOT EXISTS mirror_entities (
                    entity_key TEXT PRIMARY KEY,
                    entity_kind TEXT NOT NULL,
                    title TEXT NOT NULL,
                    entity_type_id INTEGER,
                    updated_at INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS mirror_fields (
                    entity_key TEXT NOT NULL,
                    remote_field TEXT NOT NULL,
                    column_name TEXT NOT NULL,
                    remote_type TEXT NOT NULL,
                    is_multiple INTEGER NOT NULL DEFAULT 0,
                    is_required INTEGER NOT NULL DEFAULT 0,
                    is_readonly INTEGER NOT NULL DEFAULT 0,
                    title TEXT NOT NULL,
                    settings TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (entity_key, remote_field)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS mirror_field_enums (
                    entity_key TEXT NOT NULL,
                    remote_field TEXT NOT NULL,
                    value_id TEXT NOT NULL,
                    value_title TEXT NOT NULL,
                    position INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (entity_key, remote_field, value_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS mirror_cursors (
                    entity_key TEXT PRIMARY KEY,
                    cursor_value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS mirror_webhook_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_key TEXT NOT NULL,
                    entity_id INTEGER NOT NULL,
                    event_name TEXT NOT NULL,
                    payload TEXT,
                    status TEXT NOT NULL DEFAULT 'new',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    received_at INTEGER NOT NULL,
                    next_run_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_webhook_due ON mirror_webhook_events (status, next_run_at)",
                "CREATE INDEX IF NOT EXISTS idx_webhook_record ON mirror_webhook_events (entity_key, entity_id, status)",
            ],
            // MySQL - LONGTEXT for JSON (sqlx Any driver doesn't support native JSON)
            Dialect::MySql => vec![
                r#"
                CREATE TABLE IF NOT EXISTS mirror_entities (
                    entity_key VARCHAR(64) PRIMARY KEY,
                    entity_kind VARCHAR(16) NOT NULL,
                    title VARCHAR(255) NOT NULL,
                    entity_type_id BIGINT,
                    updated_at BIGINT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS mirror_fields (
                    entity_key VARCHAR(64) NOT NULL,
                    remote_field VARCHAR(191) NOT NULL,
                    column_name VARCHAR(64) NOT NULL,
                    remote_type VARCHAR(64) NOT NULL,
                    is_multiple TINYINT NOT NULL DEFAULT 0,
                    is_required TINYINT NOT NULL DEFAULT 0,
                    is_readonly TINYINT NOT NULL DEFAULT 0,
                    title VARCHAR(512) NOT NULL,
                    settings LONGTEXT,
                    position BIGINT NOT NULL DEFAULT 0,
                    updated_at BIGINT NOT NULL,
                    PRIMARY KEY (entity_key, remote_field)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS mirror_field_enums (
                    entity_key VARCHAR(64) NOT NULL,
                    remote_field VARCHAR(191) NOT NULL,
                    value_id VARCHAR(64) NOT NULL,
                    value_title VARCHAR(512) NOT NULL,
                    position BIGINT NOT NULL DEFAULT 0,
                    PRIMARY KEY (entity_key, remote_field, value_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS mirror_cursors (
                    entity_key VARCHAR(64) PRIMARY KEY,
                    cursor_value VARCHAR(64) NOT NULL,
                    updated_at BIGINT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS mirror_webhook_events (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    entity_key VARCHAR(64) NOT NULL,
                    entity_id BIGINT NOT NULL,
                    event_name VARCHAR(128) NOT NULL,
                    payload LONGTEXT,
                    status VARCHAR(16) NOT NULL DEFAULT 'new',
                    attempts INT NOT NULL DEFAULT 0,
                    last_error TEXT,
                    received_at BIGINT NOT NULL,
                    next_run_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    INDEX idx_webhook_due (status, next_run_at),
                    INDEX idx_webhook_record (entity_key, entity_id, status)
                )
                "#,
            ],
        }
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for sql in self.schema_statements() {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    fn field_from_row(row: &AnyRow) -> FieldDefinition {
        FieldDefinition {
            entity_key: text_at(row, "entity_key").unwrap_or_default(),
            remote_field_name: text_at(row, "remote_field").unwrap_or_default(),
            local_column_name: text_at(row, "column_name").unwrap_or_default(),
            remote_type: text_at(row, "remote_type").unwrap_or_default(),
            is_multiple: int_at(row, "is_multiple").unwrap_or(0) != 0,
            is_required: int_at(row, "is_required").unwrap_or(0) != 0,
            is_readonly: int_at(row, "is_readonly").unwrap_or(0) != 0,
            display_title: text_at(row, "title").unwrap_or_default(),
            settings: text_at(row, "settings").and_then(|s| serde_json::from_str::<Value>(&s).ok()),
            position: int_at(row, "position").unwrap_or(0),
        }
    }
}

#[async_trait]
impl MetadataStore for SqlStore {
    async fn upsert_entities(&self, entities: &[EntityDefinition], now_ms: i64) -> Result<(), StorageError> {
        let assignments = ["entity_kind", "title", "entity_type_id", "updated_at"]
            .iter()
            .map(|c| self.dialect.upsert_assign(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO mirror_entities (entity_key, entity_kind, title, entity_type_id, updated_at) \
             VALUES (?, ?, ?, ?, ?) {} {}",
            self.dialect.upsert_clause(&["entity_key"]),
            assignments
        );

        let mut tx = self.pool.begin().await.map_err(backend)?;
        for entity in entities {
            sqlx::query(&sql)
                .bind(&entity.entity_key)
                .bind(entity.kind.as_str())
                .bind(&entity.display_title)
                .bind(entity.numeric_type_id)
                .bind(now_ms)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        debug!(count = entities.len(), "Entity catalog upserted");
        Ok(())
    }

    async fn list_entities(&self) -> Result<Vec<EntityDefinition>, StorageError> {
        let rows = sqlx::query(
            "SELECT entity_key, entity_kind, title, entity_type_id FROM mirror_entities ORDER BY entity_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let kind = text_at(row, "entity_kind").as_deref().and_then(EntityKind::parse)?;
                Some(EntityDefinition {
                    entity_key: text_at(row, "entity_key")?,
                    kind,
                    display_title: text_at(row, "title").unwrap_or_default(),
                    numeric_type_id: int_at(row, "entity_type_id"),
                })
            })
            .collect())
    }

    async fn upsert_fields(&self, fields: &[FieldDefinition], now_ms: i64) -> Result<(), StorageError> {
        let assignments = [
            "column_name", "remote_type", "is_multiple", "is_required", "is_readonly",
            "title", "settings", "position", "updated_at",
        ]
        .iter()
        .map(|c| self.dialect.upsert_assign(c))
        .collect::<Vec<_>>()
        .join(", ");
        let sql = format!(
            "INSERT INTO mirror_fields (entity_key, remote_field, column_name, remote_type, is_multiple, \
             is_required, is_readonly, title, settings, position, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) {} {}",
            self.dialect.upsert_clause(&["entity_key", "remote_field"]),
            assignments
        );

        let mut tx = self.pool.begin().await.map_err(backend)?;
        for field in fields {
            let settings = field.settings.as_ref().map(Value::to_string);
            sqlx::query(&sql)
                .bind(&field.entity_key)
                .bind(&field.remote_field_name)
                .bind(&field.local_column_name)
                .bind(&field.remote_type)
                .bind(i64::from(field.is_multiple))
                .bind(i64::from(field.is_required))
                .bind(i64::from(field.is_readonly))
                .bind(&field.display_title)
                .bind(settings)
                .bind(field.position)
                .bind(now_ms)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn load_fields(&self, entity_key: &str) -> Result<Vec<FieldDefinition>, StorageError> {
        let key = entity_key.to_string();
        retry("sql_load_fields", &RetryConfig::query(), || async {
            let rows = sqlx::query(
                "SELECT entity_key, remote_field, column_name, remote_type, is_multiple, is_required, \
                 is_readonly, title, settings, position FROM mirror_fields \
                 WHERE entity_key = ? ORDER BY position, remote_field",
            )
            .bind(&key)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
            Ok(rows.iter().map(Self::field_from_row).collect())
        })
        .await
    }

    async fn replace_field_enums(&self, entity_key: &str, values: &[FieldEnumValue]) -> Result<(), StorageError> {
        let mut fields: Vec<&str> = values.iter().map(|v| v.remote_field_name.as_str()).collect();
        fields.sort_unstable();
        fields.dedup();

        let mut tx = self.pool.begin().await.map_err(backend)?;
        for field in fields {
            sqlx::query("DELETE FROM mirror_field_enums WHERE entity_key = ? AND remote_field = ?")
                .bind(entity_key)
                .bind(field)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        for value in values {
            sqlx::query(
                "INSERT INTO mirror_field_enums (entity_key, remote_field, value_id, value_title, position) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(entity_key)
            .bind(&value.remote_field_name)
            .bind(&value.value_id)
            .bind(&value.value_title)
            .bind(value.position)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn load_field_enums(&self, entity_key: &str) -> Result<Vec<FieldEnumValue>, StorageError> {
        let rows = sqlx::query(
            "SELECT remote_field, value_id, value_title, position FROM mirror_field_enums \
             WHERE entity_key = ? ORDER BY remote_field, position",
        )
        .bind(entity_key)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows
            .iter()
            .map(|row| FieldEnumValue {
                entity_key: entity_key.to_string(),
                remote_field_name: text_at(row, "remote_field").unwrap_or_default(),
                value_id: text_at(row, "value_id").unwrap_or_default(),
                value_title: text_at(row, "value_title").unwrap_or_default(),
                position: int_at(row, "position").unwrap_or(0),
            })
            .collect())
    }
}

#[async_trait]
impl CursorStore for SqlStore {
    async fn get_cursor(&self, entity_key: &str) -> Result<Option<SyncCursor>, StorageError> {
        let key = entity_key.to_string();
        retry("sql_get_cursor", &RetryConfig::query(), || async {
            let row = sqlx::query("SELECT cursor_value, updated_at FROM mirror_cursors WHERE entity_key = ?")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
            Ok(row.map(|row| SyncCursor {
                entity_key: key.clone(),
                cursor_value: text_at(&row, "cursor_value").unwrap_or_default(),
                updated_at: int_at(&row, "updated_at").unwrap_or(0),
            }))
        })
        .await
    }

    async fn set_cursor(&self, entity_key: &str, cursor_value: &str, now_ms: i64) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO mirror_cursors (entity_key, cursor_value, updated_at) VALUES (?, ?, ?) {} {}, {}",
            self.dialect.upsert_clause(&["entity_key"]),
            self.dialect.upsert_assign("cursor_value"),
            self.dialect.upsert_assign("updated_at"),
        );
        retry("sql_set_cursor", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(entity_key)
                .bind(cursor_value)
                .bind(now_ms)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn catalog_refreshed_at(&self) -> Result<Option<i64>, StorageError> {
        Ok(self
            .get_cursor(CATALOG_CURSOR_KEY)
            .await?
            .and_then(|c| c.cursor_value.parse().ok()))
    }

    async fn mark_catalog_refreshed(&self, at_ms: i64) -> Result<(), StorageError> {
        self.set_cursor(CATALOG_CURSOR_KEY, &at_ms.to_string(), at_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn temp_store(dir: &TempDir) -> SqlStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("mirror.db").display());
        SqlStore::new(&url).await.unwrap()
    }

    fn field(key: &str, remote: &str, column: &str, position: i64) -> FieldDefinition {
        FieldDefinition {
            entity_key: key.into(),
            remote_field_name: remote.into(),
            local_column_name: column.into(),
            remote_type: "string".into(),
            is_multiple: false,
            is_required: position == 0,
            is_readonly: false,
            display_title: remote.to_lowercase(),
            settings: None,
            position,
        }
    }

    #[test]
    fn test_dialect_fragments() {
        assert_eq!(Dialect::from_url("sqlite://x.db"), Dialect::Sqlite);
        assert_eq!(Dialect::from_url("mysql://u:p@h/db"), Dialect::MySql);
        assert_eq!(Dialect::Sqlite.upsert_assign("title"), "\"title\" = excluded.\"title\"");
        assert_eq!(Dialect::MySql.upsert_assign("title"), "`title` = VALUES(`title`)");
        assert_eq!(Dialect::Sqlite.upsert_clause(&["a", "b"]), "ON CONFLICT(\"a\", \"b\") DO UPDATE SET");
    }

    #[tokio::test]
    async fn test_entities_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        let entities = vec![
            EntityDefinition::plain("deal", "Deals"),
            EntityDefinition::dynamic(1114, "Orders"),
        ];
        store.upsert_entities(&entities, 1).await.unwrap();
        // second refresh renames, never duplicates
        store
            .upsert_entities(&[EntityDefinition::dynamic(1114, "Purchase orders")], 2)
            .await
            .unwrap();

        let listed = store.list_entities().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].entity_key, "deal");
        assert_eq!(listed[1].display_title, "Purchase orders");
        assert_eq!(listed[1].numeric_type_id, Some(1114));
    }

    #[tokio::test]
    async fn test_fields_roundtrip_in_declaration_order() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        let mut title = field("deal", "TITLE", "title", 1);
        title.settings = Some(json!({"SIZE": 20}));
        store
            .upsert_fields(&[title, field("deal", "ID", "id_2", 0)], 10)
            .await
            .unwrap();

        let loaded = store.load_fields("deal").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].remote_field_name, "ID");
        assert!(loaded[0].is_required);
        assert_eq!(loaded[1].settings, Some(json!({"SIZE": 20})));
        assert!(store.load_fields("lead").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_field_enums_replace() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        let value = |id: &str, title: &str, position| FieldEnumValue {
            entity_key: "deal".into(),
            remote_field_name: "UF_CRM_SOURCE".into(),
            value_id: id.into(),
            value_title: title.into(),
            position,
        };
        store.replace_field_enums("deal", &[value("1", "Web", 0), value("2", "Phone", 1)]).await.unwrap();
        store.replace_field_enums("deal", &[value("2", "Phone call", 0)]).await.unwrap();

        let loaded = store.load_field_enums("deal").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].value_title, "Phone call");
    }

    #[tokio::test]
    async fn test_cursor_upsert_and_catalog_stamp() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        assert!(store.get_cursor("deal").await.unwrap().is_none());
        store.set_cursor("deal", "150", 1).await.unwrap();
        store.set_cursor("deal", "200", 2).await.unwrap();
        let cursor = store.get_cursor("deal").await.unwrap().unwrap();
        assert_eq!(cursor.position(), 200);
        assert_eq!(cursor.updated_at, 2);

        assert_eq!(store.catalog_refreshed_at().await.unwrap(), None);
        store.mark_catalog_refreshed(1_700_000_000_000).await.unwrap();
        assert_eq!(store.catalog_refreshed_at().await.unwrap(), Some(1_700_000_000_000));
    }
}
