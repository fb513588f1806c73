//! # CRM Mirror
//!
//! Mirrors CRM entity records, and their evolving field schema, into a local
//! SQL database so reports and downstream jobs can query them without going
//! through the remote API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │      SyncScheduler       │      │       WebhookQueue       │
//! │  • periodic sweep        │      │  • dedup enqueue         │
//! │  • budget per entity     │      │  • drain with backoff    │
//! └────────────┬─────────────┘      └────────────┬─────────────┘
//!              │                                 │
//!              ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     IncrementalSyncer                       │
//! │  • forward pass from the stored cursor                     │
//! │  • freshness pass over records modified today              │
//! └─────────────────────────────────────────────────────────────┘
//!              │                                 │
//!              ▼                                 ▼
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │    RateLimitedClient     │      │      SchemaRegistry      │
//! │  • min spacing per call  │      │  • field discovery       │
//! │  • retry / overload      │      │  • column naming + cache │
//! └──────────────────────────┘      └────────────┬─────────────┘
//!                                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            SQLite / MySQL (sqlx Any driver)                 │
//! │  • one table per entity, additive columns                  │
//! │  • metadata, cursors, webhook events                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use crm_mirror::{MirrorConfig, MirrorEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: MirrorConfig = serde_json::from_str(r#"{
//!         "database_url": "sqlite://mirror.db?mode=rwc",
//!         "remote": {"base_url": "https://crm.example.com/rest/1/token"}
//!     }"#).expect("valid config");
//!
//!     let mut engine = MirrorEngine::new(config);
//!     engine.start().await.expect("Failed to start");
//!     engine.run().expect("Failed to spawn loops");
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: The [`MirrorEngine`] wiring everything together
//! - [`remote`]: Throttled, retrying API client over a pluggable transport
//! - [`schema`]: Entity catalog, field mapping and the mapping cache
//! - [`storage`]: SQL metadata store, entity tables and the event queue
//! - [`sync`]: Forward and freshness passes
//! - [`webhook`]: Notification parsing and the reconciliation queue
//! - [`scheduler`]: Periodic sweep
//! - [`resilience`]: Retry policies

pub mod clock;
pub mod config;
pub mod engine;
pub mod entity;
pub mod metrics;
pub mod remote;
pub mod resilience;
pub mod scheduler;
pub mod schema;
pub mod storage;
pub mod sync;
pub mod webhook;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, MirrorConfig, RemoteConfig, SchedulerConfig, SyncConfig, WebhookConfig};
pub use engine::{EngineError, EngineState, HealthCheck, MirrorEngine};
pub use entity::{EntityDefinition, EntityKind, Pagination};
pub use remote::{RateLimitedClient, RemoteError, RemoteErrorKind, RemoteReply, Transport, TransportResponse};
pub use resilience::retry::RetryConfig;
pub use scheduler::{CycleReport, SyncScheduler, TickOutcome};
pub use schema::{EntityMapping, FieldDefinition, FieldEnumValue, SchemaError, SchemaRegistry};
pub use storage::{SqlStore, StorageError, TableManager};
pub use sync::{IncrementalSyncer, StopReason, SyncError, SyncReport};
pub use webhook::{AcceptOutcome, Notification, WebhookQueue, WebhookStatus};
pub use metrics::LatencyTimer;
