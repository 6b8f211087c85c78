use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::ServiceError;

pub const MAX_RETRIES: u32 = 3;
pub const BASE_DELAY_MS: u64 = 1000;
pub const MAX_JITTER_RATIO: f64 = 0.3;

/// Bounded exponential backoff around a fallible async operation.
///
/// Only errors that [`is_retryable_error`] accepts are retried; anything else
/// propagates on the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay_ms: BASE_DELAY_MS,
            max_jitter_ratio: MAX_JITTER_RATIO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            ..Default::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.max_jitter_ratio = 0.0;
        self
    }

    /// Un-jittered delay before retry number `attempt + 1`: `base * 2^attempt`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if self.max_jitter_ratio <= 0.0 {
            return base;
        }
        let ratio = rand::thread_rng().gen_range(0.0..=self.max_jitter_ratio);
        base + base.mul_f64(ratio)
    }

    pub async fn execute<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !is_retryable_error(&err) {
                        log::debug!("{} failed with non-retryable error: {:#}", operation_name, err);
                        return Err(err);
                    }

                    if attempt >= self.max_retries {
                        log::warn!(
                            "{} failed after {} attempts: {:#}",
                            operation_name,
                            attempt + 1,
                            err
                        );
                        return Err(err);
                    }

                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{} failed, retrying in {}ms ({}/{}): {:#}",
                        operation_name,
                        delay.as_millis(),
                        attempt + 1,
                        self.max_retries,
                        err
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Network failures, CORS failures, HTTP 429 and HTTP 503 are transient.
///
/// Typed [`ServiceError`]s anywhere in the chain decide first; foreign errors
/// fall back to inspecting the root cause's message, never the context lines.
pub fn is_retryable_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(service_err) = cause.downcast_ref::<ServiceError>() {
            return service_err.is_retryable();
        }
        if let Some(reqwest_err) = cause.downcast_ref::<reqwest::Error>() {
            if reqwest_err.is_connect() || reqwest_err.is_timeout() || reqwest_err.is_request() {
                return true;
            }
            if let Some(status) = reqwest_err.status() {
                return matches!(status.as_u16(), 429 | 503);
            }
        }
    }

    let err_str = err.root_cause().to_string().to_lowercase();
    err_str.contains("network")
        || err_str.contains("cors")
        || err_str.contains("connection reset")
        || err_str.contains("connection refused")
        || err_str.contains("429")
        || err_str.contains("too many requests")
        || err_str.contains("503")
        || err_str.contains("service unavailable")
}
