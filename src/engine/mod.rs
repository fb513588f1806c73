// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mirror engine: wires the components together and owns their lifecycle.
//!
//! # Example
//!
//! ```rust,no_run
//! use crm_mirror::{MirrorConfig, MirrorEngine};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), crm_mirror::EngineError> {
//! let config = MirrorConfig {
//!     database_url: "sqlite://mirror.db?mode=rwc".into(),
//!     ..Default::default()
//! };
//! let mut engine = MirrorEngine::new(config);
//! engine.start().await?;
//! engine.run()?;
//!
//! // Hand inbound notifications to the queue
//! engine
//!     .accept_json(&json!({"event": "ONCRMDEALUPDATE", "data": {"FIELDS": {"ID": 42}}}))
//!     .await?;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{EngineError, EngineState, HealthCheck};

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{SharedClock, SystemClock};
use crate::config::MirrorConfig;
use crate::remote::{RateLimitedClient, Transport};
use crate::scheduler::{SyncScheduler, TickOutcome};
use crate::schema::SchemaRegistry;
use crate::storage::SqlStore;
use crate::sync::IncrementalSyncer;
use crate::webhook::{AcceptOutcome, WebhookQueue};

/// Everything built by [`MirrorEngine::start`].
pub(super) struct Components {
    pub(super) store: Arc<SqlStore>,
    pub(super) client: Arc<RateLimitedClient>,
    pub(super) schema: Arc<SchemaRegistry>,
    pub(super) syncer: Arc<IncrementalSyncer>,
    pub(super) webhooks: Arc<WebhookQueue>,
    pub(super) scheduler: Arc<SyncScheduler>,
}

pub struct MirrorEngine {
    pub(super) config: MirrorConfig,
    pub(super) clock: SharedClock,
    /// Replaces the HTTP transport when set
    pub(super) transport: Option<Arc<dyn Transport>>,
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,
    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) components: Option<Components>,
    pub(super) tasks: Vec<JoinHandle<()>>,
}

impl MirrorEngine {
    /// Create an engine. Nothing is connected until [`start()`](Self::start).
    pub fn new(config: MirrorConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            clock: Arc::new(SystemClock),
            transport: None,
            state: state_tx,
            state_rx,
            shutdown_tx,
            components: None,
            tasks: Vec::new(),
        }
    }

    /// Talk to the remote through `transport` instead of HTTP.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    fn components(&self) -> Result<&Components, EngineError> {
        self.components.as_ref().ok_or(EngineError::NotStarted(self.state()))
    }

    pub fn store(&self) -> Option<&Arc<SqlStore>> {
        self.components.as_ref().map(|c| &c.store)
    }

    pub fn client(&self) -> Option<&Arc<RateLimitedClient>> {
        self.components.as_ref().map(|c| &c.client)
    }

    pub fn schema(&self) -> Option<&Arc<SchemaRegistry>> {
        self.components.as_ref().map(|c| &c.schema)
    }

    pub fn syncer(&self) -> Option<&Arc<IncrementalSyncer>> {
        self.components.as_ref().map(|c| &c.syncer)
    }

    pub fn webhooks(&self) -> Option<&Arc<WebhookQueue>> {
        self.components.as_ref().map(|c| &c.webhooks)
    }

    pub fn scheduler(&self) -> Option<&Arc<SyncScheduler>> {
        self.components.as_ref().map(|c| &c.scheduler)
    }

    /// Queue a JSON change notification.
    pub async fn accept_json(&self, body: &Value) -> Result<AcceptOutcome, EngineError> {
        Ok(self.components()?.webhooks.accept_json(body).await?)
    }

    /// Queue a form-encoded change notification.
    pub async fn accept_form(&self, body: &str) -> Result<AcceptOutcome, EngineError> {
        Ok(self.components()?.webhooks.accept_form(body).await?)
    }

    /// Run one scheduler cycle now, subject to the same overlap guard as the timer.
    pub async fn sync_now(&self) -> Result<TickOutcome, EngineError> {
        Ok(self.components()?.scheduler.tick().await)
    }

    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let ready = matches!(state, EngineState::Ready | EngineState::Running);

        let (known_entities, webhook_backlog) = match &self.components {
            Some(c) => (
                c.schema.known_entities().await.ok().map(|e| e.len()),
                c.webhooks.backlog().await.ok(),
            ),
            None => (None, None),
        };
        let healthy = state == EngineState::Running && known_entities.is_some() && webhook_backlog.is_some();

        HealthCheck {
            state,
            ready,
            known_entities,
            webhook_backlog,
            healthy,
        }
    }
}
