// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity types known to the mirror and how each one is addressed remotely.
//!
//! Plain entities (`deal`, `contact`, `lead`, `company`) have their own
//! method family (`crm.deal.list`, ...) and upper-case field names.
//! Dynamic entities are user-defined process types addressed through the
//! generic `crm.item.*` family with an `entityTypeId`, camelCase system
//! fields, and the entity key `dyn:<type id>`.

use serde_json::{json, Map, Value};

use crate::remote::parse_token;

/// Plain entity keys with their default display titles.
pub const PLAIN_ENTITIES: [(&str, &str); 4] = [
    ("deal", "Deals"),
    ("contact", "Contacts"),
    ("lead", "Leads"),
    ("company", "Companies"),
];

const DYNAMIC_PREFIX: &str = "dyn:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Plain,
    Dynamic,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Dynamic => "dynamic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plain" => Some(Self::Plain),
            "dynamic" => Some(Self::Dynamic),
            _ => None,
        }
    }
}

/// How the forward pass walks an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// `filter >ID cursor`, cursor is the highest id seen
    IdOrdered,
    /// Page walk, cursor is the next page token
    OffsetOrdered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDefinition {
    pub entity_key: String,
    pub kind: EntityKind,
    pub display_title: String,
    pub numeric_type_id: Option<i64>,
}

impl EntityDefinition {
    pub fn plain(entity_key: &str, display_title: &str) -> Self {
        Self {
            entity_key: entity_key.to_string(),
            kind: EntityKind::Plain,
            display_title: display_title.to_string(),
            numeric_type_id: None,
        }
    }

    pub fn dynamic(type_id: i64, display_title: &str) -> Self {
        Self {
            entity_key: format!("{DYNAMIC_PREFIX}{type_id}"),
            kind: EntityKind::Dynamic,
            display_title: display_title.to_string(),
            numeric_type_id: Some(type_id),
        }
    }

    /// All built-in plain entities.
    pub fn plain_entities() -> Vec<Self> {
        PLAIN_ENTITIES
            .iter()
            .map(|(key, title)| Self::plain(key, title))
            .collect()
    }

    /// Rebuild a definition from its key alone (display title defaults).
    pub fn from_key(entity_key: &str) -> Option<Self> {
        if let Some(id) = entity_key.strip_prefix(DYNAMIC_PREFIX) {
            let type_id: i64 = id.parse().ok().filter(|n| *n > 0)?;
            return Some(Self::dynamic(type_id, &format!("Dynamic {type_id}")));
        }
        PLAIN_ENTITIES
            .iter()
            .find(|(key, _)| *key == entity_key)
            .map(|(key, title)| Self::plain(key, title))
    }

    /// Name of the local table mirroring this entity.
    pub fn table_name(&self) -> String {
        match (self.kind, self.numeric_type_id) {
            (EntityKind::Dynamic, Some(id)) => format!("crm_dynamic_{id}"),
            _ => format!("crm_{}", self.entity_key),
        }
    }

    pub fn pagination(&self) -> Pagination {
        match self.kind {
            EntityKind::Plain => Pagination::IdOrdered,
            EntityKind::Dynamic => Pagination::OffsetOrdered,
        }
    }

    pub fn list_method(&self) -> String {
        match self.kind {
            EntityKind::Plain => format!("crm.{}.list", self.entity_key),
            EntityKind::Dynamic => "crm.item.list".to_string(),
        }
    }

    pub fn get_method(&self) -> String {
        match self.kind {
            EntityKind::Plain => format!("crm.{}.get", self.entity_key),
            EntityKind::Dynamic => "crm.item.get".to_string(),
        }
    }

    pub fn fields_method(&self) -> String {
        match self.kind {
            EntityKind::Plain => format!("crm.{}.fields", self.entity_key),
            EntityKind::Dynamic => "crm.item.fields".to_string(),
        }
    }

    /// Remote name of the id field in filters and ordering.
    pub fn id_field(&self) -> &'static str {
        match self.kind {
            EntityKind::Plain => "ID",
            EntityKind::Dynamic => "id",
        }
    }

    /// Remote name of the last-modified field.
    pub fn modified_field(&self) -> &'static str {
        match self.kind {
            EntityKind::Plain => "DATE_MODIFY",
            EntityKind::Dynamic => "updatedTime",
        }
    }

    fn base_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        if let Some(type_id) = self.numeric_type_id {
            params.insert("entityTypeId".to_string(), json!(type_id));
        }
        params
    }

    /// Parameters for a list call ordered by id ascending.
    pub fn list_params(&self, filter: Value, start: i64) -> Value {
        let mut params = self.base_params();
        params.insert("filter".to_string(), filter);
        params.insert("order".to_string(), json!({ self.id_field(): "ASC" }));
        params.insert("select".to_string(), json!(["*", "UF_*"]));
        params.insert("start".to_string(), json!(start));
        Value::Object(params)
    }

    pub fn get_params(&self, id: i64) -> Value {
        let mut params = self.base_params();
        params.insert("id".to_string(), json!(id));
        Value::Object(params)
    }

    pub fn fields_params(&self) -> Value {
        Value::Object(self.base_params())
    }

    /// Extract the record from a single-record `get` result.
    pub fn unwrap_single(&self, result: &Value) -> Option<Value> {
        let record = match self.kind {
            EntityKind::Plain => result,
            EntityKind::Dynamic => result.get("item").unwrap_or(result),
        };
        record.is_object().then(|| record.clone())
    }

    /// Extract the field catalog object from a `fields` result.
    pub fn unwrap_fields<'a>(&self, result: &'a Value) -> Option<&'a Map<String, Value>> {
        let fields = match self.kind {
            EntityKind::Plain => result,
            EntityKind::Dynamic => result.get("fields").unwrap_or(result),
        };
        fields.as_object()
    }
}

/// Remote id of a record, from `ID` or `id`.
pub fn record_id(record: &Value) -> Option<i64> {
    record
        .get("ID")
        .or_else(|| record.get("id"))
        .and_then(parse_token)
}
