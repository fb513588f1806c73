// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound change notifications.
//!
//! The remote posts notifications either as JSON or as a form body with
//! flattened keys:
//!
//! ```text
//! event=ONCRMDEALUPDATE&data[FIELDS][ID]=123
//! event=ONCRMDYNAMICITEMADD&data[FIELDS][ID]=5&data[FIELDS][ENTITY_TYPE_ID]=1114
//! ```
//!
//! Both are parsed once, here, into a [`Notification`].

use serde_json::{Map, Value};
use thiserror::Error;

use crate::entity::EntityDefinition;
use crate::remote::parse_token;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("notification has no event name")]
    MissingEvent,
    #[error("unsupported event '{0}'")]
    UnknownEvent(String),
    #[error("notification has no record id")]
    MissingId,
    #[error("dynamic item notification has no entity type id")]
    MissingEntityType,
    #[error("notification body is not an object")]
    NotAnObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Deal,
    Contact,
    Lead,
    Company,
    DynamicItem { entity_type_id: i64 },
}

impl EventCategory {
    /// Entity key of the records this category refers to.
    pub fn entity_key(&self) -> String {
        match self {
            Self::Deal => "deal".to_string(),
            Self::Contact => "contact".to_string(),
            Self::Lead => "lead".to_string(),
            Self::Company => "company".to_string(),
            Self::DynamicItem { entity_type_id } => EntityDefinition::dynamic(*entity_type_id, "").entity_key,
        }
    }

    fn from_event(event: &str) -> Option<EventCategoryHint> {
        if event.contains("DYNAMICITEM") {
            return Some(EventCategoryHint::Dynamic);
        }
        [
            ("CRMDEAL", Self::Deal),
            ("CRMCONTACT", Self::Contact),
            ("CRMLEAD", Self::Lead),
            ("CRMCOMPANY", Self::Company),
        ]
        .into_iter()
        .find(|(marker, _)| event.contains(marker))
        .map(|(_, category)| EventCategoryHint::Plain(category))
    }
}

enum EventCategoryHint {
    Plain(EventCategory),
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Add,
    Update,
    Delete,
}

impl EventAction {
    /// Action encoded in an event name suffix (`...ADD`, `...UPDATE`, `...DELETE`).
    pub fn from_event(event: &str) -> Option<Self> {
        let event = event.trim().to_uppercase();
        if event.ends_with("DELETE") {
            Some(Self::Delete)
        } else if event.ends_with("UPDATE") {
            Some(Self::Update)
        } else if event.ends_with("ADD") {
            Some(Self::Add)
        } else {
            None
        }
    }
}

/// A parsed, validated change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Event name as sent, upper-cased
    pub event_name: String,
    pub category: EventCategory,
    pub action: EventAction,
    pub entity_id: i64,
    /// The notification body, kept for diagnostics
    pub payload: Value,
}

impl Notification {
    pub fn entity_key(&self) -> String {
        self.category.entity_key()
    }

    /// Parse a JSON notification, nested (`data.FIELDS.ID`) or flat (`data[FIELDS][ID]`).
    pub fn from_json(body: &Value) -> Result<Self, ParseError> {
        let object = body.as_object().ok_or(ParseError::NotAnObject)?;

        let event = ["event", "EVENT", "event_name", "EVENT_NAME"]
            .iter()
            .find_map(|k| object.get(*k).and_then(Value::as_str))
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .ok_or(ParseError::MissingEvent)?;

        let action = EventAction::from_event(&event).ok_or_else(|| ParseError::UnknownEvent(event.clone()))?;
        let hint = EventCategory::from_event(&event).ok_or_else(|| ParseError::UnknownEvent(event.clone()))?;

        let (id, entity_type) = match nested_fields(object) {
            Some(fields) => (
                ["ID", "id"].iter().find_map(|k| fields.get(*k)).and_then(parse_token),
                ["ENTITY_TYPE_ID", "ENTITYTYPEID", "entityTypeId"]
                    .iter()
                    .find_map(|k| fields.get(*k))
                    .and_then(parse_token),
            ),
            None => flat_fields(object),
        };
        let entity_type = entity_type.or_else(|| {
            ["entityTypeId", "ENTITY_TYPE_ID"]
                .iter()
                .find_map(|k| object.get(*k))
                .and_then(parse_token)
        });

        let entity_id = id
            .or_else(|| record_id_fallback(object))
            .filter(|id| *id > 0)
            .ok_or(ParseError::MissingId)?;
        let category = match hint {
            EventCategoryHint::Plain(category) => category,
            EventCategoryHint::Dynamic => EventCategory::DynamicItem {
                entity_type_id: entity_type.filter(|t| *t > 0).ok_or(ParseError::MissingEntityType)?,
            },
        };

        Ok(Self {
            event_name: event,
            category,
            action,
            entity_id,
            payload: body.clone(),
        })
    }

    /// Parse an `application/x-www-form-urlencoded` notification body.
    pub fn from_form(body: &str) -> Result<Self, ParseError> {
        let pairs: Map<String, Value> = url::form_urlencoded::parse(body.as_bytes())
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect();
        Self::from_json(&Value::Object(pairs))
    }
}

fn nested_fields(object: &Map<String, Value>) -> Option<&Map<String, Value>> {
    let data = object.get("data").or_else(|| object.get("DATA"))?.as_object()?;
    data.get("FIELDS").or_else(|| data.get("fields"))?.as_object()
}

/// Id outside `FIELDS`: `data.ID`, a flat `data[ID]` key, or a top-level `ID`.
fn record_id_fallback(object: &Map<String, Value>) -> Option<i64> {
    let data = object.get("data").or_else(|| object.get("DATA")).and_then(Value::as_object);
    data.and_then(|data| ["ID", "id"].iter().find_map(|k| data.get(*k)).and_then(parse_token))
        .or_else(|| {
            object
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("data[id]"))
                .and_then(|(_, value)| parse_token(value))
        })
        .or_else(|| ["ID", "id"].iter().find_map(|k| object.get(*k)).and_then(parse_token))
}

/// `(id, entity type id)` from flattened `data[FIELDS][...]` keys.
fn flat_fields(object: &Map<String, Value>) -> (Option<i64>, Option<i64>) {
    let mut id = None;
    let mut entity_type = None;
    for (key, value) in object {
        let key = key.to_lowercase();
        if !key.contains("[fields]") {
            continue;
        }
        if key.ends_with("[id]") {
            id = id.or_else(|| parse_token(value));
        } else if key.ends_with("[entity_type_id]") || key.ends_with("[entitytypeid]") {
            entity_type = entity_type.or_else(|| parse_token(value));
        }
    }
    (id, entity_type)
}
