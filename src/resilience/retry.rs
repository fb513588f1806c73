// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! A [`RetryConfig`] is an explicit policy value: it is injected into the
//! remote client, the webhook queue and SQL connection setup, and
//! [`RetryConfig::delay_for_attempt`] is a pure function so backoff growth can
//! be checked without sleeping.
//!
//! # Example
//!
//! ```
//! use crm_mirror::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Webhook events: 5s, 10s, 20s ... capped at 5 minutes
//! let webhook = RetryConfig::webhook(10);
//! assert_eq!(webhook.delay_for_attempt(0), Duration::from_secs(5));
//! assert_eq!(webhook.delay_for_attempt(1), Duration::from_secs(10));
//! assert_eq!(webhook.delay_for_attempt(9), Duration::from_secs(300));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::{RemoteConfig, WebhookConfig};

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::query()`] - Quick retry for individual SQL statements
/// - [`RetryConfig::remote()`] - Remote API throttling backoff
/// - [`RetryConfig::webhook()`] - Per-event requeue delays
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts allowed; `None` retries forever
    pub max_retries: Option<usize>,
    /// Random spread applied to each delay, as a fraction of it (0.0 = none)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::remote()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Backoff for throttled remote calls: 0.7s doubling, 8 attempts.
    #[must_use]
    pub fn remote() -> Self {
        Self {
            max_retries: Some(8),
            initial_delay: Duration::from_millis(700),
            max_delay: Duration::from_secs(120),
            factor: 2.0,
            jitter: 0.1,
        }
    }

    /// Requeue delays for webhook events: 5s doubling, capped at 5 minutes.
    #[must_use]
    pub fn webhook(max_attempts: usize) -> Self {
        Self {
            max_retries: Some(max_attempts),
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Remote policy built from configuration.
    #[must_use]
    pub fn from_remote_config(config: &RemoteConfig) -> Self {
        Self {
            max_retries: Some(config.max_attempts),
            initial_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            factor: 2.0,
            jitter: config.backoff_jitter,
        }
    }

    /// Webhook requeue policy built from configuration.
    #[must_use]
    pub fn from_webhook_config(config: &WebhookConfig) -> Self {
        Self {
            max_retries: Some(config.max_attempts as usize),
            initial_delay: Duration::from_secs(config.backoff_base_secs),
            max_delay: Duration::from_secs(config.backoff_max_secs),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based), before jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled_nanos = self.initial_delay.as_nanos() as f64 * self.factor.powi(exponent);
        if !scaled_nanos.is_finite() || scaled_nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(scaled_nanos.round() as u64)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) with jitter applied.
    #[must_use]
    pub fn jittered_delay(&self, attempt: usize) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub fn allows_another(&self, attempts: usize) -> bool {
        self.max_retries.map_or(true, |max| attempts < max)
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !config.allows_another(attempts) {
                    return Err(err);
                }

                let delay = config.jittered_delay(attempts - 1);
                match config.max_retries {
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}
