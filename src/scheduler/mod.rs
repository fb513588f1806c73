// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic sweep over every known entity.
//!
//! Each tick runs at most one cycle: if the previous cycle is still going
//! the tick is skipped. A cycle optionally refreshes the catalog and field
//! schemas, then splits its time budget across entities by weight and
//! syncs them one after another. One entity failing does not stop the rest.

use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Timelike, Utc};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::entity::{EntityDefinition, EntityKind};
use crate::sync::{IncrementalSyncer, SyncReport};

/// Smallest slice of the budget any entity gets.
const MIN_ENTITY_BUDGET: Duration = Duration::from_secs(1);

/// Result of syncing one entity within a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityOutcome {
    pub entity_key: String,
    pub budget: Duration,
    pub result: Result<SyncReport, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Catalog and schemas were refreshed this cycle
    pub refreshed: bool,
    pub entities: Vec<EntityOutcome>,
}

impl CycleReport {
    pub fn rows_upserted(&self) -> usize {
        self.entities
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(|r| r.rows_upserted)
            .sum()
    }

    pub fn failures(&self) -> usize {
        self.entities.iter().filter(|o| o.result.is_err()).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Ran(CycleReport),
    /// A cycle was already running
    Busy,
    Disabled,
    QuietHours,
}

/// Split `total` across entities in proportion to their weights.
///
/// Dynamic entities share one `dynamic_budget_weight` between them. Plain
/// weights are scaled by the dynamic count instead of dividing, so the split
/// stays exact in integers.
pub fn apportion(
    total: Duration,
    entities: &[EntityDefinition],
    config: &SchedulerConfig,
) -> Vec<(EntityDefinition, Duration)> {
    let dynamic_count = entities.iter().filter(|e| e.kind == EntityKind::Dynamic).count();
    let plain_scale = u64::try_from(dynamic_count.max(1)).unwrap_or(u64::MAX);
    let weights: Vec<u64> = entities
        .iter()
        .map(|e| match e.kind {
            EntityKind::Plain => u64::from(config.weight_for(&e.entity_key)).saturating_mul(plain_scale),
            EntityKind::Dynamic => u64::from(config.dynamic_budget_weight),
        })
        .collect();
    let sum: u64 = weights.iter().sum();

    entities
        .iter()
        .zip(weights)
        .map(|(entity, weight)| {
            let share = if sum == 0 {
                total / entities.len().max(1) as u32
            } else {
                let nanos = total.as_nanos() * u128::from(weight) / u128::from(sum);
                Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
            };
            (entity.clone(), share.max(MIN_ENTITY_BUDGET))
        })
        .collect()
}

/// Whether `hour` falls in the `[start, end)` window, which may wrap midnight.
pub fn in_quiet_hours(hour: u32, quiet: Option<(u8, u8)>) -> bool {
    let Some((start, end)) = quiet else {
        return false;
    };
    let (start, end) = (u32::from(start), u32::from(end));
    match start.cmp(&end) {
        std::cmp::Ordering::Less => (start..end).contains(&hour),
        std::cmp::Ordering::Greater => hour >= start || hour < end,
        std::cmp::Ordering::Equal => false,
    }
}

pub struct SyncScheduler {
    syncer: Arc<IncrementalSyncer>,
    clock: SharedClock,
    config: SchedulerConfig,
    utc_offset_minutes: i32,
    cycle_lock: Mutex<()>,
}

impl SyncScheduler {
    pub fn new(
        syncer: Arc<IncrementalSyncer>,
        clock: SharedClock,
        config: SchedulerConfig,
        utc_offset_minutes: i32,
    ) -> Self {
        Self {
            syncer,
            clock,
            config,
            utc_offset_minutes,
            cycle_lock: Mutex::new(()),
        }
    }

    fn local_hour(&self) -> u32 {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
        self.clock.now_utc().with_timezone(&offset).hour()
    }

    /// Run one cycle unless disabled, busy or in quiet hours.
    pub async fn tick(&self) -> TickOutcome {
        if !self.config.enabled {
            return TickOutcome::Disabled;
        }
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            debug!("Previous cycle still running, skipping tick");
            crate::metrics::record_scheduler_cycle("busy");
            return TickOutcome::Busy;
        };
        if in_quiet_hours(self.local_hour(), self.config.quiet_hours) {
            debug!("Quiet hours, skipping tick");
            crate::metrics::record_scheduler_cycle("quiet");
            return TickOutcome::QuietHours;
        }

        let report = self.run_cycle().await;
        crate::metrics::record_scheduler_cycle(if report.failures() == 0 { "ok" } else { "partial" });
        TickOutcome::Ran(report)
    }

    #[tracing::instrument(skip(self))]
    async fn run_cycle(&self) -> CycleReport {
        let schema = self.syncer.schema();
        let mut report = CycleReport::default();

        let refresh_interval = Duration::from_secs(self.config.full_refresh_interval_secs);
        match schema.catalog_due(refresh_interval).await {
            Ok(true) => match schema.refresh_all().await {
                Ok(refreshed) => {
                    report.refreshed = true;
                    info!(entities = refreshed.len(), "Catalog and schemas refreshed");
                }
                Err(e) => warn!(error = %e, "Catalog refresh failed, syncing known entities"),
            },
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Could not read catalog refresh time"),
        }

        let entities = match schema.known_entities().await {
            Ok(entities) => entities,
            Err(e) => {
                error!(error = %e, "Could not list entities, skipping cycle");
                return report;
            }
        };

        let limit = self.config.effective_record_limit();
        for (entity, budget) in apportion(self.config.effective_time_budget(), &entities, &self.config) {
            let result = self
                .syncer
                .sync_entity(&entity.entity_key, Some(limit), budget)
                .await
                .map_err(|e| {
                    error!(entity = %entity.entity_key, error = %e, "Entity sync failed");
                    e.to_string()
                });
            report.entities.push(EntityOutcome {
                entity_key: entity.entity_key,
                budget,
                result,
            });
        }

        info!(
            entities = report.entities.len(),
            rows = report.rows_upserted(),
            failures = report.failures(),
            "Sync cycle finished"
        );
        report
    }

    /// Tick every `interval_secs` until shutdown. The first tick comes one
    /// interval after the call.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.interval_secs);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.config.interval_secs, "Sync scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Sync scheduler stopped");
    }
}
