// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote CRM API access.
//!
//! Every call goes through [`RateLimitedClient`], which owns throttling,
//! retry and overload handling on top of a pluggable [`Transport`].
//!
//! # Response envelope
//!
//! ```text
//! { "result": <list | {"items": [...], "next": N} | object>,
//!   "error": "CODE", "error_description": "...",
//!   "next": N }
//! ```
//!
//! [`RemoteReply::page`] accepts both list shapes.

pub mod client;
pub mod transport;

pub use client::RateLimitedClient;
pub use transport::{HttpTransport, Transport, TransportError, TransportResponse};

use serde_json::Value;
use thiserror::Error;

/// Body error code meaning the portal is blocked / overloaded.
pub const OVERLOAD_CODE: &str = "OVERLOAD_LIMIT";

/// Coarse classification of a [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Throttling or transport failures outlasted the retry policy
    RetryExhausted,
    /// The remote refused the request; retrying will not help
    Rejected,
    /// The response could not be understood
    Malformed,
}

#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("{method}: gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        method: String,
        attempts: usize,
        last_error: String,
    },
    #[error("{method}: rejected ({code}): {description}")]
    Rejected {
        method: String,
        code: String,
        description: String,
    },
    #[error("{method}: malformed response: {reason}")]
    Malformed { method: String, reason: String },
}

impl RemoteError {
    #[must_use]
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            Self::RetryExhausted { .. } => RemoteErrorKind::RetryExhausted,
            Self::Rejected { .. } => RemoteErrorKind::Rejected,
            Self::Malformed { .. } => RemoteErrorKind::Malformed,
        }
    }
}

/// A successful remote response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReply {
    /// The `result` member (Null when absent)
    pub result: Value,
    /// Top-level `next` page token
    pub next: Option<i64>,
    /// Set when the remote answered with the overload signal; `result` is then empty
    pub overloaded: bool,
}

/// One page of a list method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next: Option<i64>,
}

impl RemoteReply {
    /// Wrap a parsed envelope body.
    #[must_use]
    pub fn from_body(body: &Value) -> Self {
        Self {
            result: body.get("result").cloned().unwrap_or(Value::Null),
            next: body.get("next").and_then(parse_token),
            overloaded: false,
        }
    }

    /// The empty reply returned in place of an overload error.
    #[must_use]
    pub fn overloaded() -> Self {
        Self {
            result: Value::Array(Vec::new()),
            next: None,
            overloaded: true,
        }
    }

    /// Normalize the list result.
    ///
    /// Accepts a bare list, or an object carrying `items` and an optional
    /// inner `next` (which wins over the top-level token). Anything else is
    /// an empty page.
    #[must_use]
    pub fn page(&self) -> Page {
        match &self.result {
            Value::Array(items) => Page {
                items: items.clone(),
                next: self.next,
            },
            Value::Object(map) => {
                let items = match map.get("items") {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                let next = map.get("next").and_then(parse_token).or(self.next);
                Page { items, next }
            }
            _ => Page {
                items: Vec::new(),
                next: self.next,
            },
        }
    }
}

/// Page tokens and ids arrive as numbers or numeric strings.
pub(crate) fn parse_token(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
