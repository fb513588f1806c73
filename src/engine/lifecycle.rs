// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: start-up sequence, background loops, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::remote::RateLimitedClient;
use crate::resilience::retry::RetryConfig;
use crate::scheduler::{apportion, SyncScheduler};
use crate::schema::SchemaRegistry;
use crate::storage::{SqlStore, TableManager};
use crate::sync::IncrementalSyncer;
use crate::webhook::WebhookQueue;

use super::{Components, EngineError, EngineState, MirrorEngine};

impl MirrorEngine {
    /// Start the engine.
    ///
    /// Start-up flow:
    /// 1. Validate configuration (nothing remote is touched on failure)
    /// 2. Open the database and create the metadata tables
    /// 3. Build the remote client
    /// 4. Refresh the catalog and field schemas, then sweep every entity once
    ///    within `bootstrap_budget_secs` (if `bootstrap_on_start`)
    /// 5. Ready!
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), EngineError> {
        let startup_start = Instant::now();
        self.config.validate()?;
        info!("Starting CRM mirror");
        self.set_state(EngineState::Connecting);

        // ========== PHASE 1: Database ==========
        let phase_start = Instant::now();
        let store = match SqlStore::new(&self.config.database_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Failed to open the mirror database");
                crate::metrics::record_error("engine", "start", "database");
                self.set_state(EngineState::Created);
                return Err(e.into());
            }
        };
        crate::metrics::record_startup_phase("database", phase_start.elapsed());
        info!(dialect = ?store.dialect(), "Mirror database ready");

        // ========== PHASE 2: Remote client ==========
        let client = match &self.transport {
            Some(transport) => RateLimitedClient::new(
                transport.clone(),
                self.config.remote.min_request_interval(),
                RetryConfig::from_remote_config(&self.config.remote),
            ),
            None => RateLimitedClient::from_config(&self.config.remote).inspect_err(|_| {
                crate::metrics::record_error("engine", "start", "transport");
                self.set_state(EngineState::Created);
            })?,
        };
        let client = Arc::new(client);

        let schema = Arc::new(SchemaRegistry::new(
            client.clone(),
            store.clone(),
            store.clone(),
            TableManager::new(store.clone()),
            self.clock.clone(),
            self.config.sync.mapping_cache_ttl(),
        ));
        let syncer = Arc::new(IncrementalSyncer::new(
            client.clone(),
            schema.clone(),
            store.clone(),
            self.clock.clone(),
            self.config.sync.clone(),
        ));
        let webhooks = Arc::new(WebhookQueue::new(
            store.clone(),
            syncer.clone(),
            self.clock.clone(),
            self.config.webhook.clone(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            syncer.clone(),
            self.clock.clone(),
            self.config.scheduler.clone(),
            self.config.sync.day_boundary_offset_minutes,
        ));

        self.components = Some(Components {
            store,
            client,
            schema,
            syncer,
            webhooks,
            scheduler,
        });

        // ========== PHASE 3: Bootstrap ==========
        if self.config.bootstrap_on_start {
            self.set_state(EngineState::Bootstrapping);
            let phase_start = Instant::now();
            self.bootstrap().await;
            crate::metrics::record_startup_phase("bootstrap", phase_start.elapsed());
        }

        self.set_state(EngineState::Ready);
        crate::metrics::record_startup_phase("total", startup_start.elapsed());
        info!(elapsed_ms = startup_start.elapsed().as_millis() as u64, "CRM mirror ready");
        Ok(())
    }

    /// Catalog refresh plus one sweep with no record limit.
    ///
    /// Failures are logged; the periodic scheduler picks up where this leaves off.
    async fn bootstrap(&self) {
        let Some(c) = &self.components else {
            return;
        };

        let entities = match c.schema.refresh_all().await {
            Ok(entities) => entities,
            Err(e) => {
                warn!(error = %e, "Catalog refresh failed during bootstrap");
                match c.schema.known_entities().await {
                    Ok(entities) => entities,
                    Err(e) => {
                        error!(error = %e, "Could not list entities, skipping bootstrap sweep");
                        return;
                    }
                }
            }
        };

        let budget = Duration::from_secs(self.config.bootstrap_budget_secs);
        let mut rows = 0;
        for (entity, share) in apportion(budget, &entities, &self.config.scheduler) {
            match c.syncer.sync_entity(&entity.entity_key, None, share).await {
                Ok(report) => rows += report.rows_upserted,
                Err(e) => warn!(entity = %entity.entity_key, error = %e, "Bootstrap sync failed"),
            }
        }
        info!(entities = entities.len(), rows, "Bootstrap sweep complete");
    }

    /// Spawn the scheduler and the webhook drain loop.
    ///
    /// Disabled components are not spawned.
    pub fn run(&mut self) -> Result<(), EngineError> {
        let state = self.state();
        let c = match (&self.components, state) {
            (Some(c), EngineState::Ready) => c,
            (Some(_), EngineState::Running) => return Ok(()),
            _ => return Err(EngineError::NotStarted(state)),
        };

        if self.config.scheduler.enabled {
            let scheduler = c.scheduler.clone();
            let shutdown = self.shutdown_tx.subscribe();
            self.tasks.push(tokio::spawn(async move { scheduler.run(shutdown).await }));
        }
        if self.config.webhook.enabled {
            let webhooks = c.webhooks.clone();
            let shutdown = self.shutdown_tx.subscribe();
            self.tasks.push(tokio::spawn(async move { webhooks.run(shutdown).await }));
        }

        self.set_state(EngineState::Running);
        info!(tasks = self.tasks.len(), "Background loops started");
        Ok(())
    }

    /// Signal the loops to stop and wait for them.
    ///
    /// A cycle or drain pass in progress finishes its current step first.
    pub async fn shutdown(&mut self) {
        info!("Shutting down CRM mirror");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }

        if let Some(c) = &self.components {
            c.store.pool().close().await;
        }
        info!("CRM mirror stopped");
    }
}
