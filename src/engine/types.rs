// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the mirror engine.

use thiserror::Error;

use crate::config::ConfigError;
use crate::remote::TransportError;
use crate::schema::SchemaError;
use crate::storage::StorageError;

/// Engine lifecycle state.
///
/// Use [`super::MirrorEngine::state()`] to check the current state or
/// [`super::MirrorEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Opening the database and building the remote client
    Connecting,
    /// Refreshing the catalog and running the start-up sweep
    Bootstrapping,
    /// Ready to accept notifications
    Ready,
    /// Background loops running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Bootstrapping => "bootstrapping",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Bootstrapping => write!(f, "Bootstrapping"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("engine is {0}, operation needs a started engine")]
    NotStarted(EngineState),
}

/// Point-in-time health snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub state: EngineState,
    pub ready: bool,
    /// Entities in the local catalog, if it could be read
    pub known_entities: Option<usize>,
    /// Webhook events still waiting, if the queue could be read
    pub webhook_backlog: Option<usize>,
    /// Running and both stores answered
    pub healthy: bool,
}
