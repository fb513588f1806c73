//! Shared fixtures: an in-memory fake of the remote CRM API and a
//! temporary SQLite mirror wired to it.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use crm_mirror::config::{SyncConfig, WebhookConfig};
use crm_mirror::remote::{TransportError, TransportResponse};
use crm_mirror::storage::{RecordStore, SqlStore, TableManager};
use crm_mirror::{
    EntityDefinition, IncrementalSyncer, ManualClock, RateLimitedClient, RetryConfig, SchemaRegistry,
    SharedClock, Transport, WebhookQueue,
};

/// Records per list page, as the real API.
pub const PAGE: usize = 50;

/// 2024-05-14 09:00:00 UTC
pub const T0: i64 = 1_715_677_200_000;

#[derive(Default)]
struct FakeState {
    catalogs: HashMap<String, Map<String, Value>>,
    records: HashMap<String, BTreeMap<i64, Value>>,
    dynamic_types: Vec<Value>,
    calls: Vec<(String, Value)>,
    overload_next: usize,
    throttle_next: usize,
    transport_fail_next: usize,
    latency: Duration,
}

/// In-memory stand-in for the remote API.
///
/// Supports the list (`>ID` filter, `>=` modified filter, `start` offset,
/// pages of 50 with `next`), get, fields and type-list methods, plus
/// injected overload, throttling and transport failures.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

fn entity_key(method: &str, params: &Value) -> Option<String> {
    let parts: Vec<&str> = method.split('.').collect();
    match parts.as_slice() {
        ["crm", "item", _] => {
            let type_id = params.get("entityTypeId").and_then(Value::as_i64)?;
            Some(format!("dyn:{type_id}"))
        }
        ["crm", kind, _] => Some((*kind).to_string()),
        _ => None,
    }
}

fn record_id(record: &Value) -> Option<i64> {
    let id = record.get("ID").or_else(|| record.get("id"))?;
    match id {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn modified_at(record: &Value) -> Option<DateTime<FixedOffset>> {
    let raw = record
        .get("DATE_MODIFY")
        .or_else(|| record.get("updatedTime"))
        .and_then(Value::as_str)?;
    DateTime::parse_from_rfc3339(raw).ok()
}

fn not_found() -> TransportResponse {
    TransportResponse::with_status(400, Some(json!({"error": "NOT_FOUND", "error_description": "Not found"})))
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace an entity's field catalog.
    pub fn set_fields(&self, entity_key: &str, catalog: Value) {
        let catalog = catalog.as_object().cloned().unwrap_or_default();
        self.state.lock().catalogs.insert(entity_key.to_string(), catalog);
    }

    pub fn add_field(&self, entity_key: &str, name: &str, meta: Value) {
        self.state
            .lock()
            .catalogs
            .entry(entity_key.to_string())
            .or_default()
            .insert(name.to_string(), meta);
    }

    pub fn put_record(&self, entity_key: &str, record: Value) {
        let id = record_id(&record).expect("fake records need an id");
        self.state
            .lock()
            .records
            .entry(entity_key.to_string())
            .or_default()
            .insert(id, record);
    }

    pub fn remove_record(&self, entity_key: &str, id: i64) {
        if let Some(records) = self.state.lock().records.get_mut(entity_key) {
            records.remove(&id);
        }
    }

    pub fn add_dynamic_type(&self, type_id: i64, title: &str) {
        self.state
            .lock()
            .dynamic_types
            .push(json!({"id": type_id, "entityTypeId": type_id, "title": title}));
    }

    /// Answer the next `n` calls with the overload signal.
    pub fn overload_next(&self, n: usize) {
        self.state.lock().overload_next = n;
    }

    /// Answer the next `n` calls with HTTP 429.
    pub fn throttle_next(&self, n: usize) {
        self.state.lock().throttle_next = n;
    }

    /// Fail the next `n` calls without a response.
    pub fn transport_fail_next(&self, n: usize) {
        self.state.lock().transport_fail_next = n;
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.state.lock().calls.iter().filter(|(m, _)| m == method).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn list(state: &FakeState, key: &str, params: &Value) -> TransportResponse {
        let filter = params.get("filter").and_then(Value::as_object).cloned().unwrap_or_default();
        let by_modified = params
            .get("order")
            .and_then(Value::as_object)
            .is_some_and(|o| o.contains_key("DATE_MODIFY") || o.contains_key("updatedTime"));

        let mut matched: Vec<&Value> = state
            .records
            .get(key)
            .map(|r| r.values().collect())
            .unwrap_or_default();
        for (condition, bound) in &filter {
            if let Some(field) = condition.strip_prefix(">=") {
                let Some(since) = bound.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()) else {
                    continue;
                };
                if field == "DATE_MODIFY" || field == "updatedTime" {
                    matched.retain(|r| modified_at(r).is_some_and(|m| m >= since));
                }
            } else if let Some(field) = condition.strip_prefix('>') {
                if field.eq_ignore_ascii_case("id") {
                    let bound = bound.as_i64().unwrap_or(0);
                    matched.retain(|r| record_id(r).is_some_and(|id| id > bound));
                }
            }
        }
        if by_modified {
            matched.sort_by_key(|r| (modified_at(r), record_id(r)));
        }

        let start = params.get("start").and_then(Value::as_i64).unwrap_or(0).max(0) as usize;
        let page: Vec<Value> = matched.iter().skip(start).take(PAGE).map(|r| (*r).clone()).collect();
        let next = (start + PAGE < matched.len()).then_some(start + PAGE);

        let result = if key.starts_with("dyn:") {
            json!({"items": page})
        } else {
            Value::Array(page)
        };
        let mut body = json!({"result": result, "total": matched.len()});
        if let Some(next) = next {
            body["next"] = json!(next);
        }
        TransportResponse::ok(body)
    }

    fn respond(state: &mut FakeState, method: &str, params: &Value) -> TransportResponse {
        if method == "crm.type.list" {
            return TransportResponse::ok(json!({"result": {"types": state.dynamic_types}}));
        }
        let Some(key) = entity_key(method, params) else {
            return TransportResponse::with_status(
                400,
                Some(json!({"error": "ERROR_METHOD_NOT_FOUND", "error_description": "Method not found"})),
            );
        };
        let dynamic = key.starts_with("dyn:");

        match method.rsplit('.').next() {
            Some("fields") => {
                let catalog = Value::Object(state.catalogs.get(&key).cloned().unwrap_or_default());
                let result = if dynamic { json!({"fields": catalog}) } else { catalog };
                TransportResponse::ok(json!({"result": result}))
            }
            Some("get") => {
                let id = params.get("id").and_then(Value::as_i64).unwrap_or(0);
                match state.records.get(&key).and_then(|r| r.get(&id)) {
                    Some(record) if dynamic => TransportResponse::ok(json!({"result": {"item": record}})),
                    Some(record) => TransportResponse::ok(json!({"result": record})),
                    None => not_found(),
                }
            }
            Some("list") => Self::list(state, &key, params),
            _ => TransportResponse::with_status(400, Some(json!({"error": "ERROR_METHOD_NOT_FOUND"}))),
        }
    }
}

#[async_trait]
impl Transport for FakeRemote {
    async fn send(&self, method: &str, params: &Value) -> Result<TransportResponse, TransportError> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.calls.push((method.to_string(), params.clone()));

        if state.transport_fail_next > 0 {
            state.transport_fail_next -= 1;
            return Err(TransportError("connection reset".into()));
        }
        if state.overload_next > 0 {
            state.overload_next -= 1;
            return Ok(TransportResponse::with_status(
                401,
                Some(json!({"error": "OVERLOAD_LIMIT", "error_description": "Portal blocked"})),
            ));
        }
        if state.throttle_next > 0 {
            state.throttle_next -= 1;
            return Ok(TransportResponse::with_status(429, None));
        }
        Ok(Self::respond(&mut state, method, params))
    }
}

/// A deal record with the standard system fields.
pub fn deal(id: i64, title: &str, modified: &str) -> Value {
    json!({
        "ID": id.to_string(),
        "TITLE": title,
        "OPPORTUNITY": "1000.00",
        "STAGE_ID": "NEW",
        "DATE_MODIFY": modified,
    })
}

pub fn deal_catalog() -> Value {
    json!({
        "ID": {"type": "integer", "isRequired": false, "isReadOnly": true, "title": "ID"},
        "TITLE": {"type": "string", "isRequired": true, "title": "Name"},
        "OPPORTUNITY": {"type": "double", "title": "Amount"},
        "STAGE_ID": {"type": "crm_status", "title": "Stage"},
        "DATE_MODIFY": {"type": "datetime", "isReadOnly": true, "title": "Modified on"},
    })
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: Some(3),
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        factor: 2.0,
        jitter: 0.0,
    }
}

/// Route engine logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_test_writer()
        .try_init();
}

/// A mirror over a fresh SQLite file and a [`FakeRemote`].
pub struct Harness {
    pub remote: Arc<FakeRemote>,
    pub store: Arc<SqlStore>,
    pub clock: ManualClock,
    pub schema: Arc<SchemaRegistry>,
    pub syncer: Arc<IncrementalSyncer>,
    pub queue: Arc<WebhookQueue>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new(remote: Arc<FakeRemote>) -> Self {
        Self::with_records(remote, None).await
    }

    /// Build the mirror, optionally wrapping the record store.
    pub async fn with_records(
        remote: Arc<FakeRemote>,
        wrap: Option<Box<dyn FnOnce(Arc<SqlStore>) -> Arc<dyn RecordStore>>>,
    ) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("mirror.db").display());
        let store = Arc::new(SqlStore::new(&url).await.expect("sqlite store"));

        let clock = ManualClock::new(T0);
        let shared: SharedClock = Arc::new(clock.clone());
        let client = Arc::new(RateLimitedClient::new(remote.clone(), Duration::ZERO, fast_retry()));

        let records: Arc<dyn RecordStore> = match wrap {
            Some(wrap) => wrap(store.clone()),
            None => store.clone(),
        };
        let schema = Arc::new(SchemaRegistry::new(
            client.clone(),
            store.clone(),
            store.clone(),
            TableManager::new(records),
            shared.clone(),
            Duration::from_secs(300),
        ));
        let syncer = Arc::new(IncrementalSyncer::new(
            client,
            schema.clone(),
            store.clone(),
            shared.clone(),
            SyncConfig::default(),
        ));
        let queue = Arc::new(WebhookQueue::new(
            store.clone(),
            syncer.clone(),
            shared,
            WebhookConfig::default(),
        ));

        Self {
            remote,
            store,
            clock,
            schema,
            syncer,
            queue,
            _dir: dir,
        }
    }

    pub fn deal_entity() -> EntityDefinition {
        EntityDefinition::plain("deal", "Deals")
    }
}
