// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Webhook event queue persisted in `mirror_webhook_events`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::Row;
use tracing::debug;

use super::sql::{backend, int_at, text_at, Dialect, SqlStore};
use super::traits::{QueueStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};
use crate::webhook::{EnqueueOutcome, NewEvent, WebhookEvent, WebhookStatus};

const EVENT_COLUMNS: &str = "id, entity_key, entity_id, event_name, payload, status, attempts, \
                             last_error, received_at, next_run_at, updated_at";

fn event_from_row(row: &AnyRow) -> WebhookEvent {
    WebhookEvent {
        id: int_at(row, "id").unwrap_or(0),
        entity_key: text_at(row, "entity_key").unwrap_or_default(),
        entity_id: int_at(row, "entity_id").unwrap_or(0),
        event_name: text_at(row, "event_name").unwrap_or_default(),
        payload: text_at(row, "payload")
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(Value::Null),
        status: text_at(row, "status")
            .as_deref()
            .and_then(WebhookStatus::parse)
            .unwrap_or(WebhookStatus::Error),
        attempts: row
            .try_get::<i64, _>("attempts")
            .or_else(|_| row.try_get::<i32, _>("attempts").map(i64::from))
            .ok()
            .and_then(|a| u32::try_from(a).ok())
            .unwrap_or(0),
        last_error: text_at(row, "last_error"),
        received_at: int_at(row, "received_at").unwrap_or(0),
        next_run_at: int_at(row, "next_run_at").unwrap_or(0),
        updated_at: int_at(row, "updated_at").unwrap_or(0),
    }
}

impl SqlStore {
    /// One dedup-or-insert attempt.
    ///
    /// The transaction opens with a write, so SQLite takes the write lock up
    /// front (waiting on `busy_timeout`) and MySQL locks the record's index
    /// range. Concurrent callers for the same record serialize instead of
    /// both inserting.
    async fn enqueue_once(&self, event: &NewEvent, now_ms: i64) -> Result<EnqueueOutcome, StorageError> {
        let payload = event.payload.to_string();
        let mut tx = self.pool().begin().await.map_err(backend)?;

        sqlx::query(
            "UPDATE mirror_webhook_events SET event_name = ?, payload = ?, updated_at = ? \
             WHERE entity_key = ? AND entity_id = ? AND status IN ('new', 'retry')",
        )
        .bind(&event.event_name)
        .bind(&payload)
        .bind(now_ms)
        .bind(&event.entity_key)
        .bind(event.entity_id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        // MySQL reports changed rows, not matched ones, so look the row up
        let pending = sqlx::query(
            "SELECT id FROM mirror_webhook_events \
             WHERE entity_key = ? AND entity_id = ? AND status IN ('new', 'retry') \
             ORDER BY id LIMIT 1",
        )
        .bind(&event.entity_key)
        .bind(event.entity_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let outcome = match pending.as_ref().and_then(|row| int_at(row, "id")) {
            Some(id) => EnqueueOutcome::Merged(id),
            None => {
                let insert = "INSERT INTO mirror_webhook_events \
                     (entity_key, entity_id, event_name, payload, status, attempts, received_at, next_run_at, updated_at) \
                     VALUES (?, ?, ?, ?, 'new', 0, ?, ?, ?)";
                let sql = match self.dialect() {
                    Dialect::Sqlite => format!("{insert} RETURNING id"),
                    Dialect::MySql => insert.to_string(),
                };
                let query = sqlx::query(&sql)
                    .bind(&event.entity_key)
                    .bind(event.entity_id)
                    .bind(&event.event_name)
                    .bind(&payload)
                    .bind(now_ms)
                    .bind(now_ms)
                    .bind(now_ms);

                let row = match self.dialect() {
                    Dialect::Sqlite => query.fetch_one(&mut *tx).await.map_err(backend)?,
                    Dialect::MySql => {
                        query.execute(&mut *tx).await.map_err(backend)?;
                        sqlx::query("SELECT CAST(LAST_INSERT_ID() AS SIGNED) AS id")
                            .fetch_one(&mut *tx)
                            .await
                            .map_err(backend)?
                    }
                };
                let id = int_at(&row, "id")
                    .ok_or_else(|| StorageError::Backend("insert returned no id".into()))?;
                EnqueueOutcome::Queued(id)
            }
        };

        tx.commit().await.map_err(backend)?;
        Ok(outcome)
    }
}

#[async_trait]
impl QueueStore for SqlStore {
    async fn enqueue(&self, event: &NewEvent, now_ms: i64) -> Result<EnqueueOutcome, StorageError> {
        let outcome = retry("sql_enqueue", &RetryConfig::query(), || self.enqueue_once(event, now_ms)).await?;
        debug!(entity = %event.entity_key, entity_id = event.entity_id, ?outcome, "Webhook event stored");
        Ok(outcome)
    }

    async fn claim_due(&self, now_ms: i64, limit: usize) -> Result<Vec<WebhookEvent>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM mirror_webhook_events \
             WHERE status IN ('new', 'retry') AND next_run_at <= ? \
             ORDER BY next_run_at, id LIMIT ?"
        ))
        .bind(now_ms)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(backend)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut event = event_from_row(row);
            // Conditional so two drainers never claim the same row
            let result = sqlx::query(
                "UPDATE mirror_webhook_events SET status = 'processing', updated_at = ? \
                 WHERE id = ? AND status IN ('new', 'retry')",
            )
            .bind(now_ms)
            .bind(event.id)
            .execute(self.pool())
            .await
            .map_err(backend)?;
            if result.rows_affected() == 1 {
                event.status = WebhookStatus::Processing;
                event.updated_at = now_ms;
                claimed.push(event);
            }
        }
        Ok(claimed)
    }

    async fn mark_done(&self, id: i64, now_ms: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE mirror_webhook_events SET status = 'done', last_error = NULL, updated_at = ? WHERE id = ?")
            .bind(now_ms)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: i64,
        attempts: u32,
        error: &str,
        next_run_at: i64,
        now_ms: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE mirror_webhook_events SET status = 'retry', attempts = ?, last_error = ?, \
             next_run_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(i64::from(attempts))
        .bind(error)
        .bind(next_run_at)
        .bind(now_ms)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn mark_error(&self, id: i64, attempts: u32, error: &str, now_ms: i64) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE mirror_webhook_events SET status = 'error', attempts = ?, last_error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(i64::from(attempts))
        .bind(error)
        .bind(now_ms)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_event(&self, id: i64) -> Result<Option<WebhookEvent>, StorageError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM mirror_webhook_events WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?;
        Ok(row.as_ref().map(event_from_row))
    }

    async fn count_by_status(&self) -> Result<BTreeMap<WebhookStatus, usize>, StorageError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM mirror_webhook_events GROUP BY status")
            .fetch_all(self.pool())
            .await
            .map_err(backend)?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let status = text_at(row, "status").as_deref().and_then(WebhookStatus::parse)?;
                let total = usize::try_from(int_at(row, "total")?).ok()?;
                Some((status, total))
            })
            .collect())
    }

    async fn requeue_stale(&self, older_than_ms: i64, now_ms: i64) -> Result<usize, StorageError> {
        let result = sqlx::query(
            "UPDATE mirror_webhook_events SET status = 'retry', next_run_at = ?, updated_at = ? \
             WHERE status = 'processing' AND updated_at < ?",
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(older_than_ms)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn temp_store(dir: &TempDir) -> SqlStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display());
        SqlStore::new(&url).await.unwrap()
    }

    fn update(entity_id: i64, marker: i64) -> NewEvent {
        NewEvent {
            entity_key: "deal".into(),
            entity_id,
            event_name: "ONCRMDEALUPDATE".into(),
            payload: json!({"marker": marker}),
        }
    }

    #[tokio::test]
    async fn test_repeat_notifications_merge() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        let first = store.enqueue(&update(42, 1), 10).await.unwrap();
        let EnqueueOutcome::Queued(id) = first else { panic!("expected insert, got {first:?}") };

        let mut delete = update(42, 2);
        delete.event_name = "ONCRMDEALDELETE".into();
        assert_eq!(store.enqueue(&delete, 20).await.unwrap(), EnqueueOutcome::Merged(id));
        assert!(matches!(store.enqueue(&update(43, 1), 30).await.unwrap(), EnqueueOutcome::Queued(_)));

        let event = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.event_name, "ONCRMDEALDELETE");
        assert_eq!(event.payload, json!({"marker": 2}));
        assert_eq!(event.received_at, 10);

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&WebhookStatus::New), Some(&2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueue_keeps_one_pending_row() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(temp_store(&dir).await);

        let mut handles = Vec::new();
        for marker in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.enqueue(&update(42, marker), marker).await }));
        }

        let mut queued = Vec::new();
        let mut merged = Vec::new();
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                EnqueueOutcome::Queued(id) => queued.push(id),
                EnqueueOutcome::Merged(id) => merged.push(id),
            }
        }

        assert_eq!(queued.len(), 1, "exactly one insert");
        assert_eq!(merged.len(), 15);
        assert!(merged.iter().all(|id| *id == queued[0]));

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&WebhookStatus::New), Some(&1));
        assert_eq!(counts.values().sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_processing_row_is_not_pending() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        store.enqueue(&update(5, 1), 0).await.unwrap();
        let claimed = store.claim_due(0, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, WebhookStatus::Processing);

        assert!(matches!(store.enqueue(&update(5, 2), 1).await.unwrap(), EnqueueOutcome::Queued(_)));
    }

    #[tokio::test]
    async fn test_claim_respects_due_time_and_limit() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        for id in 1..=3 {
            store.enqueue(&update(id, 0), 100).await.unwrap();
        }
        assert!(store.claim_due(99, 10).await.unwrap().is_empty());

        let first = store.claim_due(100, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        // claimed rows are not handed out twice
        let rest = store.claim_due(100, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(store.claim_due(100, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_error_and_done_transitions() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        let EnqueueOutcome::Queued(id) = store.enqueue(&update(9, 0), 0).await.unwrap() else {
            panic!("expected insert")
        };
        store.claim_due(0, 1).await.unwrap();
        store.mark_retry(id, 1, "remote overloaded", 5_000, 1).await.unwrap();

        let event = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Retry);
        assert_eq!(event.attempts, 1);
        assert_eq!(event.last_error.as_deref(), Some("remote overloaded"));
        assert!(store.claim_due(4_999, 10).await.unwrap().is_empty());
        assert_eq!(store.claim_due(5_000, 10).await.unwrap().len(), 1);

        store.mark_error(id, 10, "gave up", 6_000).await.unwrap();
        assert_eq!(store.get_event(id).await.unwrap().unwrap().status, WebhookStatus::Error);

        let EnqueueOutcome::Queued(other) = store.enqueue(&update(10, 0), 0).await.unwrap() else {
            panic!("expected insert")
        };
        store.mark_done(other, 1).await.unwrap();
        let done = store.get_event(other).await.unwrap().unwrap();
        assert_eq!(done.status, WebhookStatus::Done);
        assert_eq!(done.last_error, None);
    }

    #[tokio::test]
    async fn test_requeue_stale_processing() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        store.enqueue(&update(1, 0), 0).await.unwrap();
        store.claim_due(0, 10).await.unwrap();

        assert_eq!(store.requeue_stale(0, 1_000).await.unwrap(), 0);
        assert_eq!(store.requeue_stale(1, 1_000).await.unwrap(), 1);
        assert_eq!(store.claim_due(1_000, 10).await.unwrap().len(), 1);
    }
}
