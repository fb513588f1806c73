// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental data sync.
//!
//! Each run of [`IncrementalSyncer::sync_entity`] makes two passes:
//!
//! ```text
//! forward    cursor ──▶ pages of new records ──▶ upsert ──▶ cursor = max id
//!            (id-ordered: filter >ID cursor; offset-ordered: page token walk)
//!
//! freshness  records modified since local midnight ──▶ upsert
//!            (bounded by freshness_max_pages)
//! ```
//!
//! Rows are upserted before the cursor is written, so a crash between the
//! two replays a page instead of skipping it. Both passes stop at the
//! deadline derived from the time budget.

pub mod cursor;
pub mod mapper;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::entity::{EntityDefinition, Pagination};
use crate::remote::{RateLimitedClient, RemoteError};
use crate::schema::{EntityMapping, SchemaError, SchemaRegistry};
use crate::storage::{CursorStore, StorageError};
use cursor::{check_cursor, start_of_local_day};
use mapper::map_records;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),
    #[error("Remote overloaded while syncing {entity}")]
    Overloaded { entity: String },
    #[error("Malformed schema for {entity}: {reason}")]
    MalformedSchema { entity: String, reason: String },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<SchemaError> for SyncError {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::UnknownEntity(key) => Self::UnknownEntity(key),
            SchemaError::Malformed { entity, reason } => Self::MalformedSchema { entity, reason },
            SchemaError::Remote(e) => Self::Remote(e),
            SchemaError::Storage(e) => Self::Storage(e),
        }
    }
}

/// Why a forward pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// Empty or short page: caught up
    #[default]
    CaughtUp,
    Deadline,
    RecordLimit,
    Overloaded,
}

/// Outcome of one `sync_entity` run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub entity_key: String,
    pub rows_upserted: usize,
    pub forward_rows: usize,
    pub freshness_rows: usize,
    pub cursor_before: i64,
    pub cursor_now: i64,
    pub cursor_reset: bool,
    pub mapping_failures: usize,
    pub stopped: StopReason,
}

pub struct IncrementalSyncer {
    client: Arc<RateLimitedClient>,
    schema: Arc<SchemaRegistry>,
    cursors: Arc<dyn CursorStore>,
    clock: SharedClock,
    config: SyncConfig,
}

impl IncrementalSyncer {
    pub fn new(
        client: Arc<RateLimitedClient>,
        schema: Arc<SchemaRegistry>,
        cursors: Arc<dyn CursorStore>,
        clock: SharedClock,
        config: SyncConfig,
    ) -> Self {
        Self {
            client,
            schema,
            cursors,
            clock,
            config,
        }
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    /// Run the forward pass and (if enabled) the freshness pass for one entity.
    ///
    /// `limit` caps the records taken by the forward pass; `budget` bounds
    /// the whole run.
    #[tracing::instrument(skip(self))]
    pub async fn sync_entity(
        &self,
        entity_key: &str,
        limit: Option<usize>,
        budget: Duration,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let deadline = started + budget;
        let mapping = self.schema.mapping(entity_key).await?;
        let entity = &mapping.entity;

        let mut report = SyncReport {
            entity_key: entity_key.to_string(),
            ..Default::default()
        };

        let result = self.forward_pass(&mapping, limit, deadline, &mut report).await;
        if let Err(e) = result {
            crate::metrics::record_error("sync", "forward_pass", error_label(&e));
            return Err(e);
        }

        if self.config.freshness_pass && report.stopped != StopReason::Overloaded && Instant::now() < deadline {
            if let Err(e) = self.freshness_pass(&mapping, deadline, &mut report).await {
                crate::metrics::record_error("sync", "freshness_pass", error_label(&e));
                return Err(e);
            }
        }

        report.rows_upserted = report.forward_rows + report.freshness_rows;
        crate::metrics::record_sync_duration(entity_key, started.elapsed());
        info!(
            entity = %entity.entity_key,
            rows = report.rows_upserted,
            forward = report.forward_rows,
            freshness = report.freshness_rows,
            cursor = report.cursor_now,
            stopped = ?report.stopped,
            "Entity sync finished"
        );
        Ok(report)
    }

    async fn starting_position(
        &self,
        entity: &EntityDefinition,
        report: &mut SyncReport,
    ) -> Result<i64, SyncError> {
        let stored = self
            .cursors
            .get_cursor(&entity.entity_key)
            .await?
            .map(|c| c.position())
            .unwrap_or(0);
        let max_local = self.schema.tables().max_id(entity).await?;
        let check = check_cursor(stored, max_local, self.config.stale_cursor_margin);

        report.cursor_before = stored;
        if check.is_stale() {
            warn!(
                entity = %entity.entity_key,
                stored,
                max_local = ?max_local,
                margin = self.config.stale_cursor_margin,
                "Stale cursor, restarting from zero"
            );
            crate::metrics::record_cursor_reset(&entity.entity_key);
            report.cursor_reset = true;
            self.save_cursor(entity, 0).await?;
        }
        Ok(check.position())
    }

    async fn save_cursor(&self, entity: &EntityDefinition, position: i64) -> Result<(), SyncError> {
        self.cursors
            .set_cursor(&entity.entity_key, &position.to_string(), self.clock.now_millis())
            .await?;
        crate::metrics::set_cursor_position(&entity.entity_key, position);
        Ok(())
    }

    /// Map and upsert one page; returns the number of rows written.
    async fn store_page(
        &self,
        mapping: &EntityMapping,
        items: &[Value],
        pass: &str,
        report: &mut SyncReport,
    ) -> Result<(usize, Option<i64>), SyncError> {
        let batch = map_records(mapping, items);
        report.mapping_failures += batch.failures;
        if batch.skipped > 0 {
            debug!(entity = %mapping.entity.entity_key, skipped = batch.skipped, "Records without id skipped");
        }
        if batch.rows.is_empty() {
            return Ok((0, batch.max_id));
        }

        let written = self
            .schema
            .tables()
            .upsert(&mapping.entity, &mapping.columns(), &batch.rows, self.clock.now_millis())
            .await?;
        crate::metrics::record_rows_upserted(&mapping.entity.entity_key, pass, written);
        Ok((written, batch.max_id))
    }

    async fn forward_pass(
        &self,
        mapping: &EntityMapping,
        limit: Option<usize>,
        deadline: Instant,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let entity = &mapping.entity;
        let mut position = self.starting_position(entity, report).await?;
        report.cursor_now = position;
        let page_size = self.config.page_size;

        loop {
            if Instant::now() >= deadline {
                report.stopped = StopReason::Deadline;
                break;
            }
            if limit.is_some_and(|limit| report.forward_rows >= limit) {
                report.stopped = StopReason::RecordLimit;
                break;
            }

            let params = match entity.pagination() {
                Pagination::IdOrdered => {
                    let filter = if position > 0 {
                        json!({ format!(">{}", entity.id_field()): position })
                    } else {
                        json!({})
                    };
                    entity.list_params(filter, -1)
                }
                Pagination::OffsetOrdered => entity.list_params(json!({}), position),
            };

            let reply = self.client.call(&entity.list_method(), &params).await?;
            if reply.overloaded {
                report.stopped = StopReason::Overloaded;
                break;
            }
            let page = reply.page();
            if page.items.is_empty() {
                report.stopped = StopReason::CaughtUp;
                break;
            }

            let (written, max_id) = self.store_page(mapping, &page.items, "forward", report).await?;
            report.forward_rows += written;

            let (next_position, more) = match entity.pagination() {
                Pagination::IdOrdered => (
                    max_id.map_or(position, |id| id.max(position)),
                    page.items.len() >= page_size,
                ),
                Pagination::OffsetOrdered => match page.next {
                    Some(next) if next > position => (next, true),
                    _ => (position + page.items.len() as i64, false),
                },
            };

            // Persisted only after the rows are in
            let advanced = next_position > position;
            if advanced {
                position = next_position;
                self.save_cursor(entity, position).await?;
            }
            report.cursor_now = position;

            if !more || !advanced {
                report.stopped = StopReason::CaughtUp;
                break;
            }
        }
        Ok(())
    }

    async fn freshness_pass(
        &self,
        mapping: &EntityMapping,
        deadline: Instant,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let entity = &mapping.entity;
        let since = start_of_local_day(self.clock.now_utc(), self.config.day_boundary_offset_minutes);
        let filter = json!({ format!(">={}", entity.modified_field()): since.to_rfc3339() });

        let mut offset = 0;
        for _ in 0..self.config.freshness_max_pages {
            if Instant::now() >= deadline {
                break;
            }

            let mut params = entity.list_params(filter.clone(), offset);
            params["order"] = json!({ entity.modified_field(): "ASC", entity.id_field(): "ASC" });

            let reply = self.client.call(&entity.list_method(), &params).await?;
            if reply.overloaded {
                break;
            }
            let page = reply.page();
            if page.items.is_empty() {
                break;
            }

            let (written, _) = self.store_page(mapping, &page.items, "freshness", report).await?;
            report.freshness_rows += written;

            match page.next {
                Some(next) if next > offset => offset = next,
                _ => break,
            }
        }
        Ok(())
    }

    /// Fetch a single record; `None` if the remote says it no longer exists.
    pub async fn fetch_record(&self, entity_key: &str, id: i64) -> Result<Option<Value>, SyncError> {
        let entity = self.schema.entity(entity_key).await?;
        let reply = match self.client.call(&entity.get_method(), &entity.get_params(id)).await {
            Ok(reply) => reply,
            Err(RemoteError::Rejected { code, description, .. }) if is_not_found(&code, &description) => {
                debug!(entity = %entity_key, id, "Record gone upstream");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if reply.overloaded {
            return Err(SyncError::Overloaded {
                entity: entity_key.to_string(),
            });
        }
        Ok(entity.unwrap_single(&reply.result))
    }

    /// Map and upsert records through the same path as the sync passes.
    pub async fn apply_records(&self, entity_key: &str, items: &[Value]) -> Result<usize, SyncError> {
        let mapping = self.schema.mapping(entity_key).await?;
        let mut report = SyncReport::default();
        let (written, _) = self.store_page(&mapping, items, "webhook", &mut report).await?;
        Ok(written)
    }
}

fn is_not_found(code: &str, description: &str) -> bool {
    code.to_uppercase().contains("NOT_FOUND") || description.trim().eq_ignore_ascii_case("not found")
}

fn error_label(e: &SyncError) -> &'static str {
    match e {
        SyncError::UnknownEntity(_) => "unknown_entity",
        SyncError::Overloaded { .. } => "overloaded",
        SyncError::MalformedSchema { .. } => "malformed_schema",
        SyncError::Remote(_) => "remote",
        SyncError::Storage(_) => "storage",
    }
}
