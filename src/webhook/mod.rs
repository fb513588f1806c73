// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Webhook-driven reconciliation queue.
//!
//! # State machine
//!
//! ```text
//!   new ──▶ processing ──▶ done
//!              │   ▲
//!              ▼   │ (next_run_at reached)
//!             retry ───▶ ... ───▶ error   (after max_attempts)
//!
//!   new ──▶ done                          (delete: local row removed, no fetch)
//! ```
//!
//! At most one pending (`new`/`retry`) event exists per record; a repeat
//! notification refreshes it in place. Events are kept after completion.

pub mod event;

pub use event::{EventAction, EventCategory, Notification, ParseError};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::WebhookConfig;
use crate::resilience::retry::RetryConfig;
use crate::storage::{QueueStore, StorageError};
use crate::sync::{IncrementalSyncer, SyncError};

/// Processing events untouched for this long are assumed abandoned.
const STALE_PROCESSING_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WebhookStatus {
    New,
    Processing,
    Done,
    Retry,
    Error,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Retry => "retry",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "retry" => Some(Self::Retry),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Waiting to be (re)processed; the dedup scope.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::New | Self::Retry)
    }
}

/// An event to insert into the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub entity_key: String,
    pub entity_id: i64,
    pub event_name: String,
    pub payload: Value,
}

impl From<&Notification> for NewEvent {
    fn from(n: &Notification) -> Self {
        Self {
            entity_key: n.entity_key(),
            entity_id: n.entity_id,
            event_name: n.event_name.clone(),
            payload: n.payload.clone(),
        }
    }
}

/// A stored queue row.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: i64,
    pub entity_key: String,
    pub entity_id: i64,
    pub event_name: String,
    pub payload: Value,
    pub status: WebhookStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub received_at: i64,
    pub next_run_at: i64,
    pub updated_at: i64,
}

impl WebhookEvent {
    pub fn action(&self) -> Option<EventAction> {
        EventAction::from_event(&self.event_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was inserted
    Queued(i64),
    /// Folded into the pending row with this id
    Merged(i64),
}

impl EnqueueOutcome {
    pub fn id(&self) -> i64 {
        match self {
            Self::Queued(id) | Self::Merged(id) => *id,
        }
    }
}

/// What happened to an inbound notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Queued(i64),
    Merged(i64),
    /// Acknowledged but not queued
    Dropped(ParseError),
}

impl From<EnqueueOutcome> for AcceptOutcome {
    fn from(outcome: EnqueueOutcome) -> Self {
        match outcome {
            EnqueueOutcome::Queued(id) => Self::Queued(id),
            EnqueueOutcome::Merged(id) => Self::Merged(id),
        }
    }
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub done: usize,
    pub deleted: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct WebhookQueue {
    store: Arc<dyn QueueStore>,
    syncer: Arc<IncrementalSyncer>,
    clock: SharedClock,
    config: WebhookConfig,
    backoff: RetryConfig,
}

impl WebhookQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        syncer: Arc<IncrementalSyncer>,
        clock: SharedClock,
        config: WebhookConfig,
    ) -> Self {
        let backoff = RetryConfig::from_webhook_config(&config);
        Self {
            store,
            syncer,
            clock,
            config,
            backoff,
        }
    }

    pub fn backoff(&self) -> &RetryConfig {
        &self.backoff
    }

    /// Accept a JSON notification. Unparsable ones are dropped, not errors.
    pub async fn accept_json(&self, body: &Value) -> Result<AcceptOutcome, StorageError> {
        self.accept(Notification::from_json(body)).await
    }

    /// Accept a form-encoded notification body.
    pub async fn accept_form(&self, body: &str) -> Result<AcceptOutcome, StorageError> {
        self.accept(Notification::from_form(body)).await
    }

    async fn accept(&self, parsed: Result<Notification, ParseError>) -> Result<AcceptOutcome, StorageError> {
        match parsed {
            Ok(notification) => Ok(self.enqueue(&NewEvent::from(&notification)).await?.into()),
            Err(reason) => {
                debug!(reason = %reason, "Dropping notification");
                crate::metrics::record_webhook_event("dropped");
                Ok(AcceptOutcome::Dropped(reason))
            }
        }
    }

    /// Queue an event, merging into the pending one for the same record.
    pub async fn enqueue(&self, event: &NewEvent) -> Result<EnqueueOutcome, StorageError> {
        let outcome = self.store.enqueue(event, self.clock.now_millis()).await?;
        let label = match outcome {
            EnqueueOutcome::Queued(_) => "queued",
            EnqueueOutcome::Merged(_) => "merged",
        };
        crate::metrics::record_webhook_event(label);
        debug!(entity = %event.entity_key, entity_id = event.entity_id, outcome = label, "Webhook event accepted");
        Ok(outcome)
    }

    /// Process up to `batch_size` due events.
    pub async fn drain_once(&self) -> Result<DrainReport, StorageError> {
        let now = self.clock.now_millis();
        let requeued = self.store.requeue_stale(now - STALE_PROCESSING_MS, now).await?;
        if requeued > 0 {
            warn!(requeued, "Requeued abandoned webhook events");
        }

        let events = self.store.claim_due(now, self.config.batch_size).await?;
        let mut report = DrainReport {
            claimed: events.len(),
            ..Default::default()
        };

        for event in events {
            match self.process(&event).await {
                Ok(EventAction::Delete) => {
                    self.store.mark_done(event.id, self.clock.now_millis()).await?;
                    report.deleted += 1;
                    report.done += 1;
                    crate::metrics::record_webhook_event("deleted");
                }
                Ok(_) => {
                    self.store.mark_done(event.id, self.clock.now_millis()).await?;
                    report.done += 1;
                    crate::metrics::record_webhook_event("done");
                }
                Err(e) => {
                    if self.fail(&event, &e.to_string()).await? {
                        report.retried += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                done = report.done,
                retried = report.retried,
                failed = report.failed,
                "Webhook drain pass"
            );
        }
        Ok(report)
    }

    async fn process(&self, event: &WebhookEvent) -> Result<EventAction, SyncError> {
        let action = event.action().unwrap_or(EventAction::Update);
        if action == EventAction::Delete {
            let entity = self.syncer.schema().entity(&event.entity_key).await?;
            let removed = self.syncer.schema().tables().delete(&entity, event.entity_id).await?;
            debug!(entity = %event.entity_key, id = event.entity_id, removed, "Delete applied");
            return Ok(action);
        }

        match self.syncer.fetch_record(&event.entity_key, event.entity_id).await? {
            Some(record) => {
                self.syncer.apply_records(&event.entity_key, &[record]).await?;
            }
            None => {
                // Gone upstream before we got to it
                let entity = self.syncer.schema().entity(&event.entity_key).await?;
                self.syncer.schema().tables().delete(&entity, event.entity_id).await?;
            }
        }
        Ok(action)
    }

    /// Reschedule or park a failed event. Returns true if it will be retried.
    async fn fail(&self, event: &WebhookEvent, reason: &str) -> Result<bool, StorageError> {
        let attempts = event.attempts.saturating_add(1);
        let now = self.clock.now_millis();

        if !self.backoff.allows_another(attempts as usize) {
            error!(
                id = event.id,
                entity = %event.entity_key,
                entity_id = event.entity_id,
                attempts,
                error = %reason,
                "Webhook event failed permanently"
            );
            self.store.mark_error(event.id, attempts, reason, now).await?;
            crate::metrics::record_webhook_event("error");
            return Ok(false);
        }

        let delay = self.backoff.delay_for_attempt(event.attempts as usize);
        let next_run_at = now.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
        warn!(
            id = event.id,
            entity = %event.entity_key,
            entity_id = event.entity_id,
            attempts,
            delay_secs = delay.as_secs(),
            error = %reason,
            "Webhook event rescheduled"
        );
        self.store.mark_retry(event.id, attempts, reason, next_run_at, now).await?;
        crate::metrics::record_webhook_event("retry");
        Ok(true)
    }

    pub async fn status_counts(&self) -> Result<BTreeMap<WebhookStatus, usize>, StorageError> {
        self.store.count_by_status().await
    }

    /// Events still waiting to be processed (`new` or `retry`).
    pub async fn backlog(&self) -> Result<usize, StorageError> {
        Ok(self
            .status_counts()
            .await?
            .iter()
            .filter(|(status, _)| status.is_pending())
            .map(|(_, n)| n)
            .sum())
    }

    /// Drain until shutdown, sleeping `poll_interval` when idle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(batch_size = self.config.batch_size, "Webhook drain loop started");
        let idle = self.config.poll_interval();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.drain_once().await {
                Ok(report) if report.claimed > 0 => Duration::ZERO,
                Ok(_) => idle,
                Err(e) => {
                    error!(error = %e, "Webhook drain failed");
                    crate::metrics::record_error("webhook", "drain", "storage");
                    idle * 2
                }
            };

            if let Ok(backlog) = self.backlog().await {
                crate::metrics::set_webhook_backlog(backlog);
            }

            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("Webhook drain loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_and_pending() {
        for status in [
            WebhookStatus::New,
            WebhookStatus::Processing,
            WebhookStatus::Done,
            WebhookStatus::Retry,
            WebhookStatus::Error,
        ] {
            assert_eq!(WebhookStatus::parse(status.as_str()), Some(status));
        }
        assert!(WebhookStatus::New.is_pending());
        assert!(WebhookStatus::Retry.is_pending());
        assert!(!WebhookStatus::Processing.is_pending());
        assert_eq!(WebhookStatus::parse("queued"), None);
    }

    #[test]
    fn test_event_action_from_name() {
        let mut event = WebhookEvent {
            id: 1,
            entity_key: "deal".into(),
            entity_id: 1,
            event_name: "ONCRMDEALDELETE".into(),
            payload: Value::Null,
            status: WebhookStatus::New,
            attempts: 0,
            last_error: None,
            received_at: 0,
            next_run_at: 0,
            updated_at: 0,
        };
        assert_eq!(event.action(), Some(EventAction::Delete));
        event.event_name = "ONCRMDEALUPDATE".into();
        assert_eq!(event.action(), Some(EventAction::Update));
    }

    #[test]
    fn test_accept_outcome_from_enqueue() {
        assert_eq!(AcceptOutcome::from(EnqueueOutcome::Merged(4)), AcceptOutcome::Merged(4));
        assert_eq!(EnqueueOutcome::Queued(9).id(), 9);
    }
}
