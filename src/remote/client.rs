// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rate-limited, retrying remote client.
//!
//! One instance is shared (behind `Arc`) by the scheduler and the webhook
//! worker. The throttle lock is held while waiting, so the minimum spacing
//! holds across every caller, not per task.
//!
//! | Response                                  | Outcome                            |
//! |-------------------------------------------|------------------------------------|
//! | 2xx with `result`                         | `Ok(reply)`                        |
//! | `OVERLOAD_LIMIT` (any status)             | `Ok(RemoteReply::overloaded())`    |
//! | 429, 5xx, transport failure, `*LIMIT*`    | back off and retry                 |
//! | any other error code / status             | `Err(Rejected)` immediately        |

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

use super::transport::{HttpTransport, Transport, TransportError, TransportResponse};
use super::{RemoteError, RemoteReply, OVERLOAD_CODE};
use crate::config::RemoteConfig;
use crate::metrics::{self, LatencyTimer};
use crate::resilience::retry::RetryConfig;

/// Error codes the remote uses for request-rate throttling.
const THROTTLE_CODES: [&str; 2] = ["QUERY_LIMIT_EXCEEDED", "OPERATION_TIME_LIMIT"];

#[derive(Debug)]
enum Verdict {
    Success(RemoteReply),
    Overloaded,
    Throttled(String),
    Rejected { code: String, description: String },
    Malformed(String),
}

fn is_throttle_code(code: &str) -> bool {
    THROTTLE_CODES.contains(&code) || (code.contains("LIMIT") && code != OVERLOAD_CODE)
}

fn classify(response: &TransportResponse) -> Verdict {
    let error_code = response
        .body
        .as_ref()
        .and_then(|b| b.get("error"))
        .and_then(Value::as_str)
        .filter(|code| !code.is_empty());
    let description = response
        .body
        .as_ref()
        .and_then(|b| b.get("error_description"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if error_code == Some(OVERLOAD_CODE) {
        return Verdict::Overloaded;
    }
    if response.status == 429 {
        return Verdict::Throttled("HTTP 429".to_string());
    }
    if let Some(code) = error_code {
        if is_throttle_code(code) {
            return Verdict::Throttled(code.to_string());
        }
        return Verdict::Rejected { code: code.to_string(), description };
    }
    if response.status >= 500 {
        return Verdict::Throttled(format!("HTTP {}", response.status));
    }
    if !(200..300).contains(&response.status) {
        return Verdict::Rejected {
            code: format!("HTTP_{}", response.status),
            description,
        };
    }
    match &response.body {
        Some(body) => Verdict::Success(RemoteReply::from_body(body)),
        None => Verdict::Malformed("body is not JSON".to_string()),
    }
}

pub struct RateLimitedClient {
    transport: Arc<dyn Transport>,
    min_interval: Duration,
    policy: RetryConfig,
    /// Start time of the most recent request
    last_call: Mutex<Option<Instant>>,
}

impl RateLimitedClient {
    pub fn new(transport: Arc<dyn Transport>, min_interval: Duration, policy: RetryConfig) -> Self {
        Self {
            transport,
            min_interval,
            policy,
            last_call: Mutex::new(None),
        }
    }

    /// HTTP client built from configuration.
    pub fn from_config(config: &RemoteConfig) -> Result<Self, TransportError> {
        let transport = HttpTransport::new(&config.base_url, config.request_timeout())?;
        Ok(Self::new(
            Arc::new(transport),
            config.min_request_interval(),
            RetryConfig::from_remote_config(config),
        ))
    }

    pub fn policy(&self) -> &RetryConfig {
        &self.policy
    }

    /// Wait until `min_interval` has passed since the previous request started.
    async fn throttle(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            let now = Instant::now();
            if ready_at > now {
                metrics::record_throttle_wait(ready_at - now);
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Invoke a remote method.
    ///
    /// Throttling and transport failures are retried per the injected
    /// [`RetryConfig`]; the overload signal yields an empty reply with
    /// `overloaded` set.
    #[tracing::instrument(skip(self, params))]
    pub async fn call(&self, method: &str, params: &Value) -> Result<RemoteReply, RemoteError> {
        let _timer = LatencyTimer::new("remote", method);
        let mut attempts = 0usize;

        loop {
            self.throttle().await;
            attempts += 1;

            let last_error = match self.transport.send(method, params).await {
                Ok(response) => match classify(&response) {
                    Verdict::Success(reply) => {
                        metrics::record_remote_call(method, "ok");
                        if attempts > 1 {
                            debug!(method, attempts, "Remote call succeeded after retries");
                        }
                        return Ok(reply);
                    }
                    Verdict::Overloaded => {
                        metrics::record_remote_call(method, "overloaded");
                        metrics::record_overload(method);
                        warn!(method, status = response.status, "Remote reported overload, returning empty result");
                        return Ok(RemoteReply::overloaded());
                    }
                    Verdict::Rejected { code, description } => {
                        metrics::record_remote_call(method, "rejected");
                        return Err(RemoteError::Rejected {
                            method: method.to_string(),
                            code,
                            description,
                        });
                    }
                    Verdict::Malformed(reason) => {
                        metrics::record_remote_call(method, "malformed");
                        return Err(RemoteError::Malformed {
                            method: method.to_string(),
                            reason,
                        });
                    }
                    Verdict::Throttled(reason) => {
                        metrics::record_remote_call(method, "retry");
                        metrics::record_remote_retry("throttled");
                        reason
                    }
                },
                Err(e) => {
                    metrics::record_remote_call(method, "retry");
                    metrics::record_remote_retry("transport");
                    e.to_string()
                }
            };

            if !self.policy.allows_another(attempts) {
                metrics::record_remote_call(method, "exhausted");
                return Err(RemoteError::RetryExhausted {
                    method: method.to_string(),
                    attempts,
                    last_error,
                });
            }

            let delay = self.policy.jittered_delay(attempts - 1);
            warn!(
                method,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Remote call throttled, backing off"
            );
            sleep(delay).await;
        }
    }
}
