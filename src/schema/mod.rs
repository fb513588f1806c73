// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote schema discovery and the local mapping of fields to columns.
//!
//! [`SchemaRegistry`] asks the remote for its entity catalog and for each
//! entity's field catalog, assigns every remote field a stable local
//! column, persists the result in the metadata tables, and makes sure the
//! physical table has a column for every field.
//!
//! # Design
//!
//! - **Stable columns**: a field keeps the column it was first given, even
//!   if a later refresh would sanitize differently
//! - **Additive only**: fields removed upstream keep their column and metadata
//! - **Cached mappings**: [`MappingCache`] holds loaded mappings for a TTL
//!   and is invalidated on every refresh of the entity
//! - **Serialized refresh**: one refresh at a time, so column allocation
//!   never races

pub mod cache;
pub mod naming;
pub mod titles;
pub mod types;

pub use cache::MappingCache;
pub use types::{CellValue, ColumnType, ValueShape};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::entity::EntityDefinition;
use crate::remote::{RateLimitedClient, RemoteError};
use crate::storage::{CursorStore, MetadataStore, StorageError, TableManager};
use naming::ColumnAllocator;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),
    #[error("Malformed field catalog for {entity}: {reason}")]
    Malformed { entity: String, reason: String },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A remote field and the local column it is mirrored into.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    pub entity_key: String,
    pub remote_field_name: String,
    pub local_column_name: String,
    pub remote_type: String,
    pub is_multiple: bool,
    pub is_required: bool,
    pub is_readonly: bool,
    pub display_title: String,
    pub settings: Option<Value>,
    /// Position in the remote field catalog
    pub position: i64,
}

impl FieldDefinition {
    pub fn shape(&self) -> ValueShape {
        if self.remote_type.eq_ignore_ascii_case("crm_multifield") || self.remote_type.eq_ignore_ascii_case("object") {
            return ValueShape::Json;
        }
        ValueShape::from_remote(&self.remote_type, self.is_multiple)
    }
}

/// One option of an enumeration field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEnumValue {
    pub entity_key: String,
    pub remote_field_name: String,
    pub value_id: String,
    pub value_title: String,
    pub position: i64,
}

/// Everything needed to turn a remote record into a table row.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMapping {
    pub entity: EntityDefinition,
    pub fields: Vec<FieldDefinition>,
}

impl EntityMapping {
    /// Mapped column names, in field order.
    pub fn columns(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.local_column_name.clone()).collect()
    }
}

fn meta_bool(meta: &Value, key: &str) -> bool {
    match meta.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.as_str(), "Y" | "y" | "1" | "true"),
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn enum_options(entity_key: &str, remote_name: &str, meta: &Value) -> Vec<FieldEnumValue> {
    let Some(items) = meta.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(position, item)| {
            let id = item.get("ID").or_else(|| item.get("id"))?;
            let value_id = match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let value_title = item
                .get("VALUE")
                .or_else(|| item.get("value"))
                .and_then(titles::label_to_string)
                .unwrap_or_else(|| value_id.clone());
            Some(FieldEnumValue {
                entity_key: entity_key.to_string(),
                remote_field_name: remote_name.to_string(),
                value_id,
                value_title,
                position: position as i64,
            })
        })
        .collect()
}

/// Build field definitions from a remote field catalog.
///
/// `persisted` maps remote field names to columns assigned by earlier
/// refreshes; those are reused verbatim and claimed before any new field
/// is allocated.
pub fn map_field_catalog(
    entity_key: &str,
    catalog: &Map<String, Value>,
    persisted: &HashMap<String, String>,
) -> (Vec<FieldDefinition>, Vec<FieldEnumValue>) {
    let mut allocator = ColumnAllocator::with_reserved();
    for column in persisted.values() {
        allocator.claim(column);
    }

    let mut fields = Vec::with_capacity(catalog.len());
    let mut enums = Vec::new();
    for (position, (remote_name, meta)) in catalog.iter().enumerate() {
        let column = match persisted.get(remote_name) {
            Some(column) => column.clone(),
            None => allocator.allocate(remote_name),
        };
        let remote_type = meta
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("string")
            .to_string();
        let settings = meta.get("settings").filter(|s| !s.is_null()).cloned();

        enums.extend(enum_options(entity_key, remote_name, meta));
        fields.push(FieldDefinition {
            entity_key: entity_key.to_string(),
            remote_field_name: remote_name.clone(),
            display_title: titles::display_title(remote_name, meta, &column),
            local_column_name: column,
            remote_type,
            is_multiple: meta_bool(meta, "isMultiple"),
            is_required: meta_bool(meta, "isRequired"),
            is_readonly: meta_bool(meta, "isReadOnly"),
            settings,
            position: position as i64,
        });
    }
    (fields, enums)
}

/// Entity catalog, field catalog and mapping cache.
pub struct SchemaRegistry {
    client: Arc<RateLimitedClient>,
    metadata: Arc<dyn MetadataStore>,
    cursors: Arc<dyn CursorStore>,
    tables: TableManager,
    cache: MappingCache,
    clock: SharedClock,
    refresh_lock: Mutex<()>,
}

impl SchemaRegistry {
    pub fn new(
        client: Arc<RateLimitedClient>,
        metadata: Arc<dyn MetadataStore>,
        cursors: Arc<dyn CursorStore>,
        tables: TableManager,
        clock: SharedClock,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            client,
            metadata,
            cursors,
            tables,
            cache: MappingCache::new(cache_ttl),
            clock,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn tables(&self) -> &TableManager {
        &self.tables
    }

    pub fn cache(&self) -> &MappingCache {
        &self.cache
    }

    /// Register the plain entities and every dynamic type the remote reports.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_catalog(&self) -> Result<Vec<EntityDefinition>, SchemaError> {
        let reply = self
            .client
            .call("crm.type.list", &json!({"select": ["id", "title", "entityTypeId"]}))
            .await?;

        if reply.overloaded {
            warn!("Remote overloaded, keeping the stored entity catalog");
            return self.known_entities().await;
        }

        let types = match &reply.result {
            Value::Array(list) => list.as_slice(),
            other => other.get("types").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default(),
        };

        let mut entities = EntityDefinition::plain_entities();
        for t in types {
            let type_id = ["entityTypeId", "ENTITY_TYPE_ID"]
                .iter()
                .find_map(|k| t.get(*k).and_then(crate::remote::parse_token))
                .filter(|id| *id > 0);
            let Some(type_id) = type_id else {
                debug!(entry = %t, "Skipping catalog entry without a type id");
                continue;
            };
            let title = t
                .get("title")
                .and_then(titles::label_to_string)
                .unwrap_or_else(|| format!("Dynamic {type_id}"));
            entities.push(EntityDefinition::dynamic(type_id, &title));
        }

        let now = self.clock.now_millis();
        self.metadata.upsert_entities(&entities, now).await?;
        self.cursors.mark_catalog_refreshed(now).await?;
        info!(entities = entities.len(), "Entity catalog refreshed");
        Ok(entities)
    }

    /// Entities in the stored catalog, or the plain ones before the first refresh.
    pub async fn known_entities(&self) -> Result<Vec<EntityDefinition>, SchemaError> {
        let stored = self.metadata.list_entities().await?;
        if stored.is_empty() {
            Ok(EntityDefinition::plain_entities())
        } else {
            Ok(stored)
        }
    }

    pub async fn entity(&self, entity_key: &str) -> Result<EntityDefinition, SchemaError> {
        if let Some(found) = self
            .metadata
            .list_entities()
            .await?
            .into_iter()
            .find(|e| e.entity_key == entity_key)
        {
            return Ok(found);
        }
        EntityDefinition::from_key(entity_key).ok_or_else(|| SchemaError::UnknownEntity(entity_key.to_string()))
    }

    /// True when the catalog has never been refreshed or is older than `interval`.
    pub async fn catalog_due(&self, interval: Duration) -> Result<bool, SchemaError> {
        let Some(last) = self.cursors.catalog_refreshed_at().await? else {
            return Ok(true);
        };
        let age = self.clock.now_millis().saturating_sub(last);
        Ok(age >= i64::try_from(interval.as_millis()).unwrap_or(i64::MAX))
    }

    /// Fetch the field catalog, persist field metadata and add missing columns.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_schema(&self, entity_key: &str) -> Result<Vec<FieldDefinition>, SchemaError> {
        let _guard = self.refresh_lock.lock().await;
        let result = self.refresh_schema_locked(entity_key).await;
        crate::metrics::record_schema_refresh(entity_key, result.is_ok());
        result
    }

    async fn refresh_schema_locked(&self, entity_key: &str) -> Result<Vec<FieldDefinition>, SchemaError> {
        let entity = self.entity(entity_key).await?;
        let reply = self
            .client
            .call(&entity.fields_method(), &entity.fields_params())
            .await?;

        let stored = self.metadata.load_fields(entity_key).await?;
        if reply.overloaded {
            warn!(entity = %entity_key, "Remote overloaded, keeping stored field catalog");
            return Ok(stored);
        }

        let catalog = entity.unwrap_fields(&reply.result).ok_or_else(|| SchemaError::Malformed {
            entity: entity_key.to_string(),
            reason: "field catalog is not an object".into(),
        })?;

        let persisted: HashMap<String, String> = stored
            .iter()
            .map(|f| (f.remote_field_name.clone(), f.local_column_name.clone()))
            .collect();
        let (fields, enums) = map_field_catalog(entity_key, catalog, &persisted);

        let now = self.clock.now_millis();
        self.metadata.upsert_fields(&fields, now).await?;
        if !enums.is_empty() {
            self.metadata.replace_field_enums(entity_key, &enums).await?;
        }
        let added = self.ensure_columns(&entity, &fields).await?;
        self.cache.invalidate(entity_key);

        info!(entity = %entity_key, fields = fields.len(), added, "Schema refreshed");
        Ok(fields)
    }

    /// Add a column for every field the entity table lacks.
    pub async fn ensure_columns(&self, entity: &EntityDefinition, fields: &[FieldDefinition]) -> Result<usize, SchemaError> {
        Ok(self.tables.ensure_columns(entity, fields).await?)
    }

    /// The current mapping for an entity, refreshing the schema on first use.
    pub async fn mapping(&self, entity_key: &str) -> Result<Arc<EntityMapping>, SchemaError> {
        if let Some(hit) = self.cache.get(entity_key) {
            return Ok(hit);
        }

        let entity = self.entity(entity_key).await?;
        let mut fields = self.metadata.load_fields(entity_key).await?;
        if fields.is_empty() {
            fields = self.refresh_schema(entity_key).await?;
            if fields.is_empty() {
                // Still empty (overloaded remote); don't cache a blank mapping
                self.ensure_columns(&entity, &fields).await?;
                return Ok(Arc::new(EntityMapping { entity, fields }));
            }
            fields = self.metadata.load_fields(entity_key).await?;
        } else {
            // Columns may be missing if the table was dropped out from under us
            self.ensure_columns(&entity, &fields).await?;
        }

        let mapping = Arc::new(EntityMapping { entity, fields });
        self.cache.insert(Arc::clone(&mapping));
        Ok(mapping)
    }

    /// Catalog refresh followed by a schema refresh of every entity.
    ///
    /// Per-entity failures are logged and skipped; returns the entities
    /// whose schema refreshed.
    pub async fn refresh_all(&self) -> Result<Vec<EntityDefinition>, SchemaError> {
        let entities = self.refresh_catalog().await?;
        let mut refreshed = Vec::with_capacity(entities.len());
        for entity in entities {
            match self.refresh_schema(&entity.entity_key).await {
                Ok(_) => refreshed.push(entity),
                Err(e) => warn!(entity = %entity.entity_key, error = %e, "Schema refresh failed"),
            }
        }
        Ok(refreshed)
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("cached_mappings", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_field_catalog_mapping() {
        let fields = catalog(json!({
            "ID": {"type": "integer", "isRequired": false, "isReadOnly": true, "title": "ID"},
            "TITLE": {"type": "string", "isRequired": true, "title": "Name"},
            "UF_CRM_SOURCE": {
                "type": "enumeration",
                "isMultiple": true,
                "title": "UF_CRM_SOURCE",
                "listLabel": {"en": "Source"},
                "items": [{"ID": "10", "VALUE": "Web"}, {"ID": 11, "VALUE": "Phone"}]
            },
            "title": {"type": "string"}
        }));

        let (mapped, enums) = map_field_catalog("deal", &fields, &HashMap::new());
        let columns: Vec<&str> = mapped.iter().map(|f| f.local_column_name.as_str()).collect();
        assert_eq!(columns, vec!["id_2", "title", "uf_crm_source", "title_2"]);

        assert!(mapped[0].is_readonly);
        assert!(mapped[1].is_required);
        assert_eq!(mapped[1].display_title, "Name");
        assert_eq!(mapped[2].display_title, "Source");
        assert!(matches!(mapped[2].shape(), ValueShape::List(_)));
        assert_eq!(mapped[3].position, 3);

        assert_eq!(enums.len(), 2);
        assert_eq!(enums[1].value_id, "11");
        assert_eq!(enums[1].value_title, "Phone");
    }

    #[test]
    fn test_persisted_columns_are_stable() {
        let fields = catalog(json!({
            "TITLE": {"type": "string"},
            "Title": {"type": "string"}
        }));
        // An earlier refresh gave "Title" the plain name
        let persisted = HashMap::from([("Title".to_string(), "title".to_string())]);

        let (mapped, _) = map_field_catalog("deal", &fields, &persisted);
        assert_eq!(mapped[0].local_column_name, "title_2");
        assert_eq!(mapped[1].local_column_name, "title");
    }

    #[test]
    fn test_multifield_is_json() {
        let fields = catalog(json!({"PHONE": {"type": "crm_multifield", "isMultiple": true}}));
        let (mapped, _) = map_field_catalog("contact", &fields, &HashMap::new());
        assert_eq!(mapped[0].shape(), ValueShape::Json);
        assert_eq!(mapped[0].shape().column_type(), ColumnType::Json);
    }
}
