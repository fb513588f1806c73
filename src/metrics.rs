// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for crm-mirror.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `crm_mirror_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `method`: remote API method (`crm.deal.list`, ...)
//! - `entity`: entity key (`deal`, `dyn:1114`, ...)
//! - `pass`: forward, freshness, webhook
//! - `status`: ok, retry, rejected, overloaded, exhausted

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// REMOTE API
// ═══════════════════════════════════════════════════════════════════════════

/// Record the outcome of one remote HTTP attempt
pub fn record_remote_call(method: &str, status: &str) {
    counter!(
        "crm_mirror_remote_calls_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record remote call latency (including retries)
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "crm_mirror_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a throttling retry and why it happened
pub fn record_remote_retry(reason: &str) {
    counter!(
        "crm_mirror_remote_retries_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an overload signal that was turned into an empty reply
pub fn record_overload(method: &str) {
    counter!(
        "crm_mirror_remote_overload_total",
        "method" => method.to_string()
    )
    .increment(1);
}

/// Time spent waiting for the shared throttle
pub fn record_throttle_wait(duration: Duration) {
    histogram!("crm_mirror_throttle_wait_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// SCHEMA
// ═══════════════════════════════════════════════════════════════════════════

/// Record a schema refresh attempt
pub fn record_schema_refresh(entity: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "crm_mirror_schema_refresh_total",
        "entity" => entity.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record columns added to an entity table
pub fn record_columns_added(entity: &str, count: usize) {
    counter!(
        "crm_mirror_columns_added_total",
        "entity" => entity.to_string()
    )
    .increment(count as u64);
}

/// Record a field value that could not be coerced to its column type
pub fn record_mapping_failure(entity: &str) {
    counter!(
        "crm_mirror_mapping_failures_total",
        "entity" => entity.to_string()
    )
    .increment(1);
}

/// Record mapping cache lookups
pub fn record_mapping_cache(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "crm_mirror_mapping_cache_total",
        "outcome" => outcome
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC
// ═══════════════════════════════════════════════════════════════════════════

/// Record rows upserted by a sync pass
pub fn record_rows_upserted(entity: &str, pass: &str, count: usize) {
    counter!(
        "crm_mirror_rows_upserted_total",
        "entity" => entity.to_string(),
        "pass" => pass.to_string()
    )
    .increment(count as u64);
}

/// Record a local row deletion
pub fn record_rows_deleted(entity: &str, count: usize) {
    counter!(
        "crm_mirror_rows_deleted_total",
        "entity" => entity.to_string()
    )
    .increment(count as u64);
}

/// Set the current cursor position for an entity
pub fn set_cursor_position(entity: &str, position: i64) {
    gauge!(
        "crm_mirror_cursor_position",
        "entity" => entity.to_string()
    )
    .set(position as f64);
}

/// Record a cursor reset caused by the stale-cursor check
pub fn record_cursor_reset(entity: &str) {
    counter!(
        "crm_mirror_cursor_resets_total",
        "entity" => entity.to_string()
    )
    .increment(1);
}

/// Record one `sync_entity` run
pub fn record_sync_duration(entity: &str, duration: Duration) {
    histogram!(
        "crm_mirror_sync_seconds",
        "entity" => entity.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// WEBHOOK QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a webhook event transition (queued, merged, dropped, done, retry, error)
pub fn record_webhook_event(outcome: &str) {
    counter!(
        "crm_mirror_webhook_events_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the number of events waiting to be processed
pub fn set_webhook_backlog(count: usize) {
    gauge!("crm_mirror_webhook_backlog").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULER / LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a scheduler tick outcome (completed, skipped_busy, skipped_quiet)
pub fn record_scheduler_cycle(outcome: &str) {
    counter!(
        "crm_mirror_scheduler_cycles_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an error with category for alerting
pub fn record_error(component: &str, operation: &str, error_type: &str) {
    counter!(
        "crm_mirror_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "crm_mirror_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Track engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "crm_mirror_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: String,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, &self.operation, self.start.elapsed());
    }
}
