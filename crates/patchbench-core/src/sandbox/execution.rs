//! Launch controls: bounded setup retries with exponential backoff and a
//! circuit breaker over consecutive setup failures.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{SandboxError, SandboxResult};

/// Retry settings for sandbox setup failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms * 2u64.pow(attempt.saturating_sub(1)))
    }
}

/// Atomic circuit breaker that opens after N consecutive failures.
///
/// Thread-safe via `AtomicU32`. Resets on success.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold,
        }
    }

    /// Returns `true` if the breaker is open (too many consecutive failures).
    pub fn is_open(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= self.threshold
    }

    /// Record a failure. Returns current consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

/// Run `launch` with setup retries and circuit-breaker controls.
///
/// Only `SandboxError::SetupFailed` counts against the breaker and is
/// retried; any other error or a successful launch is returned as is. The
/// breaker is checked before each attempt.
pub async fn with_setup_retries<T, F, Fut>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    mut launch: F,
) -> SandboxResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SandboxResult<T>>,
{
    let max_attempts = policy.max_retries + 1;
    let mut attempt = 0;
    loop {
        attempt += 1;
        if breaker.is_open() {
            return Err(SandboxError::CircuitBreakerOpen {
                consecutive_failures: breaker.failure_count(),
                threshold: breaker.threshold(),
            });
        }

        match launch().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(e) if e.is_setup_failure() => {
                let failures = breaker.record_failure();
                if attempt >= max_attempts {
                    return Err(e);
                }
                warn!(
                    "Sandbox setup failed (attempt {}, {} consecutive): {}",
                    attempt, failures, e
                );
                tokio::time::sleep(policy.delay(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
