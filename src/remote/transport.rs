// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire transport for remote calls.
//!
//! [`Transport`] performs exactly one request and reports what came back;
//! it never retries or interprets error codes. That is the client's job.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Raw outcome of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// Parsed JSON body, when the body was JSON
    pub body: Option<Value>,
}

impl TransportResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body: Some(body) }
    }

    pub fn with_status(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }
}

/// The request never produced an HTTP response (DNS, connect, timeout...).
#[derive(Error, Debug, Clone)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, method: &str, params: &Value) -> Result<TransportResponse, TransportError>;
}

/// HTTP transport posting JSON to `{base_url}/{method}.json`.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, method: &str) -> String {
        format!("{}/{}.json", self.base_url, method)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, method: &str, params: &Value) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .post(self.url_for(method))
            .json(params)
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let body = serde_json::from_str(&text).ok();
        if body.is_none() && !text.is_empty() {
            debug!(method, status, bytes = text.len(), "Non-JSON response body");
        }

        Ok(TransportResponse { status, body })
    }
}
